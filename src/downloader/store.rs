//! Temporary chunk file storage
//!
//! Every chunk is written to `<root>/<CHUNK_FILE_PREFIX><chunk id><CHUNK_FILE_SUFFIX>`.
//! The fixed prefix and suffix make stale files from earlier runs
//! recognisable, so they can be swept without touching anything else that
//! lives in the same directory.

use crate::utils::error::DownloadError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, warn};

pub const CHUNK_FILE_PREFIX: &str = "chunkloader_";
pub const CHUNK_FILE_SUFFIX: &str = ".part";

/// Directory holding per-chunk temp files
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<(), DownloadError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn path_for(&self, chunk_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{}{}", CHUNK_FILE_PREFIX, chunk_id, CHUNK_FILE_SUFFIX))
    }

    pub fn is_chunk_file(name: &str) -> bool {
        name.starts_with(CHUNK_FILE_PREFIX) && name.ends_with(CHUNK_FILE_SUFFIX)
    }

    /// Bytes already on disk for a chunk, 0 when no file exists
    pub async fn existing_len(&self, chunk_id: &str) -> Result<u64, DownloadError> {
        match fs::metadata(self.path_for(chunk_id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, chunk_id: &str) -> bool {
        fs::try_exists(self.path_for(chunk_id)).await.unwrap_or(false)
    }

    pub async fn remove(&self, chunk_id: &str) -> Result<(), DownloadError> {
        match fs::remove_file(self.path_for(chunk_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rename(&self, from_id: &str, to_id: &str) -> Result<(), DownloadError> {
        if from_id == to_id {
            return Ok(());
        }
        fs::rename(self.path_for(from_id), self.path_for(to_id)).await?;
        Ok(())
    }

    /// Paths of all chunk files currently in the store
    pub async fn list(&self) -> Result<Vec<PathBuf>, DownloadError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if Self::is_chunk_file(name) {
                    paths.push(entry.path());
                }
            }
        }
        Ok(paths)
    }

    /// Delete chunk files last modified more than `retention` ago
    pub async fn sweep_stale(&self, retention: Duration) -> Result<usize, DownloadError> {
        let now = SystemTime::now();
        let mut removed = 0;

        for path in self.list().await? {
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Failed to stat chunk file {}: {}", path.display(), e);
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > retention {
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!("Removed stale chunk file: {}", path.display());
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to remove stale chunk file {}: {}", path.display(), e),
                }
            }
        }

        Ok(removed)
    }

    /// Delete every chunk file in the store
    pub async fn purge(&self) -> Result<usize, DownloadError> {
        let mut removed = 0;
        for path in self.list().await? {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove chunk file {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_naming_convention() {
        let store = ChunkStore::new("/tmp/chunks");
        let path = store.path_for("model.bin_7");
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "chunkloader_model.bin_7.part"
        );
        assert!(ChunkStore::is_chunk_file("chunkloader_model.bin_7.part"));
        assert!(!ChunkStore::is_chunk_file("model.bin"));
        assert!(!ChunkStore::is_chunk_file("chunkloader_notes.txt"));
    }

    #[tokio::test]
    async fn test_existing_len_missing_is_zero() {
        let temp = TempDir::new().unwrap();
        let store = ChunkStore::new(temp.path());
        assert_eq!(store.existing_len("nope_0").await.unwrap(), 0);
        std::fs::write(store.path_for("yes_0"), b"12345").unwrap();
        assert_eq!(store.existing_len("yes_0").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_purge_only_touches_chunk_files() {
        let temp = TempDir::new().unwrap();
        let store = ChunkStore::new(temp.path());
        std::fs::write(store.path_for("a_0"), b"a").unwrap();
        std::fs::write(store.path_for("a_1"), b"b").unwrap();
        let unrelated = temp.path().join("keep.txt");
        std::fs::write(&unrelated, b"keep").unwrap();

        store.purge().await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_files() {
        let temp = TempDir::new().unwrap();
        let store = ChunkStore::new(temp.path());
        std::fs::write(store.path_for("fresh_0"), b"data").unwrap();

        let removed = store.sweep_stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.exists("fresh_0").await);
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = ChunkStore::new(temp.path().join("not-created"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_chunk() {
        let temp = TempDir::new().unwrap();
        let store = ChunkStore::new(temp.path());
        std::fs::write(store.path_for("f_3"), b"body").unwrap();
        store.rename("f_3", "f_0").await.unwrap();
        assert!(!store.exists("f_3").await);
        assert_eq!(store.existing_len("f_0").await.unwrap(), 4);
    }
}
