//! Ordered merge of chunk files into the final artifact

use crate::downloader::segment::{ChunkSpec, ChunkState, FileChunkSet};
use crate::downloader::store::ChunkStore;
use crate::utils::error::DownloadError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

pub const DEFAULT_COPY_BUFFER: usize = 64 * 1024;

/// Where the merged artifact for `file_name` lands
pub fn destination_path(dest_dir: &Path, file_name: &str) -> PathBuf {
    dest_dir.join(file_name)
}

/// Merge every chunk of `set` into `dest_dir/<file name>`.
///
/// All chunks are validated before the destination is touched. On
/// success each chunk file is deleted as soon as it has been copied. A set
/// that is not fully present yields `MergeIncomplete` with no file left at
/// the destination, and its unusable chunks marked `Paused`.
pub async fn merge_file(
    set: &mut FileChunkSet,
    store: &ChunkStore,
    dest_dir: &Path,
    buffer_size: usize,
) -> Result<PathBuf, DownloadError> {
    let dest = destination_path(dest_dir, &set.target.file_name);

    if set.merged {
        match fs::metadata(&dest).await {
            Ok(meta) if meta.len() == set.total_size => {
                debug!("{} already merged", dest.display());
                return Ok(dest);
            }
            _ => {
                warn!("Merged file {} is missing or truncated", dest.display());
                set.merged = false;
            }
        }
    }

    let mut missing = 0usize;
    for chunk in set.chunks.iter_mut() {
        let on_disk = store.existing_len(&chunk.id).await?;
        let expected = chunk.expected_size();

        if chunk.is_completed() && on_disk == expected {
            continue;
        }

        missing += 1;
        if on_disk > expected {
            store.remove(&chunk.id).await?;
            chunk.downloaded_bytes = 0;
        } else {
            chunk.downloaded_bytes = on_disk;
        }
        chunk.state = ChunkState::Paused;
    }

    if missing > 0 {
        if let Err(e) = fs::remove_file(&dest).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial file {}: {}", dest.display(), e);
            }
        }
        warn!(
            "Cannot merge {}: {} of {} chunks missing",
            set.target.file_name,
            missing,
            set.chunks.len()
        );
        return Err(DownloadError::MergeIncomplete(missing));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    debug!(
        "Merging {} chunks into {}",
        set.chunks.len(),
        dest.display()
    );

    let mut consumed = 0usize;
    let result = copy_chunks(&set.chunks, store, &dest, buffer_size, &mut consumed).await;

    match result {
        Ok(total_bytes) => {
            set.merged = true;
            info!(
                "Successfully merged {} bytes into {}",
                total_bytes,
                dest.display()
            );
            Ok(dest)
        }
        Err(e) => {
            error!("Merge of {} failed: {}", dest.display(), e);
            let _ = fs::remove_file(&dest).await;
            // Consumed chunk files are gone and must be fetched again
            for chunk in set.chunks.iter_mut().take(consumed) {
                chunk.downloaded_bytes = 0;
                chunk.state = ChunkState::Paused;
            }
            Err(e)
        }
    }
}

async fn copy_chunks(
    chunks: &[ChunkSpec],
    store: &ChunkStore,
    dest: &Path,
    buffer_size: usize,
    consumed: &mut usize,
) -> Result<u64, DownloadError> {
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .await?;

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut total_bytes = 0u64;

    for chunk in chunks {
        let path = store.path_for(&chunk.id);
        let mut input = File::open(&path).await.map_err(|e| {
            DownloadError::CorruptedOrMissingChunk(format!("{}: {}", chunk.id, e))
        })?;

        let mut bytes_copied = 0u64;
        loop {
            let bytes_read = input.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            output.write_all(&buffer[..bytes_read]).await?;
            bytes_copied += bytes_read as u64;
        }

        if bytes_copied != chunk.expected_size() {
            return Err(DownloadError::CorruptedOrMissingChunk(format!(
                "{}: read {} of {} bytes",
                chunk.id,
                bytes_copied,
                chunk.expected_size()
            )));
        }

        drop(input);
        if let Err(e) = fs::remove_file(&path).await {
            warn!("Failed to remove chunk file {}: {}", path.display(), e);
        }
        *consumed += 1;
        total_bytes += bytes_copied;
        debug!("Merged chunk {} ({} bytes)", chunk.index, bytes_copied);
    }

    output.flush().await?;
    output.sync_all().await?;
    Ok(total_bytes)
}
