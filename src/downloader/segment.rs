//! Chunk planning and the per-file chunk model

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

/// A remote artifact to fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTarget {
    pub url: String,
    pub file_name: String,
    /// Authoritative or caller-estimated length; `None` means resolve on demand
    pub total_size: Option<u64>,
}

impl FileTarget {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            total_size: None,
        }
    }

    pub fn with_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    /// Relative path made only of plain components, so it stays under the
    /// destination directory. `onnx/model.onnx` is fine, `../x` and `/x` are not.
    pub fn has_safe_name(&self) -> bool {
        let path = Path::new(&self.file_name);
        path.components().next().is_some()
            && path.components().all(|c| matches!(c, Component::Normal(_)))
    }
}

/// Chunk lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Pending,
    InProgress,
    Paused,
    Completed,
}

/// A contiguous byte range of a remote file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub id: String,
    pub index: usize,
    pub start_byte: u64,
    /// Inclusive
    pub end_byte: u64,
    pub downloaded_bytes: u64,
    pub state: ChunkState,
}

impl ChunkSpec {
    pub fn expected_size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub fn is_completed(&self) -> bool {
        self.state == ChunkState::Completed
    }
}

/// A file and the ordered chunks that partition it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkSet {
    pub target: FileTarget,
    pub total_size: u64,
    pub chunks: Vec<ChunkSpec>,
    /// Set once the destination file has been produced
    pub merged: bool,
}

impl FileChunkSet {
    pub fn new(target: FileTarget, total_size: u64, tiers: &ChunkTiers) -> Self {
        let chunks = plan_chunks(&target.file_name, total_size, tiers);
        Self {
            target,
            total_size,
            chunks,
            merged: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(ChunkSpec::is_completed)
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_completed()).count()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        if self.merged {
            return self.total_size;
        }
        self.chunks
            .iter()
            .map(|c| c.downloaded_bytes.min(c.expected_size()))
            .sum()
    }

    pub fn has_incomplete_chunks(&self) -> bool {
        self.chunks.iter().any(|c| !c.is_completed())
    }
}

/// Size-tiered chunk widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTiers {
    /// Width for files under `medium_threshold`
    pub small: u64,
    pub medium: u64,
    pub large: u64,
    pub huge: u64,
    pub medium_threshold: u64,
    pub large_threshold: u64,
    pub huge_threshold: u64,
}

impl Default for ChunkTiers {
    fn default() -> Self {
        Self {
            small: 5 * MB,
            medium: 10 * MB,
            large: 25 * MB,
            huge: 50 * MB,
            medium_threshold: 100 * MB,
            large_threshold: GB,
            huge_threshold: 5 * GB,
        }
    }
}

/// Chunk width for a file of `total_size` bytes
pub fn chunk_width(total_size: u64, tiers: &ChunkTiers) -> u64 {
    let width = if total_size < tiers.medium_threshold {
        tiers.small
    } else if total_size < tiers.large_threshold {
        tiers.medium
    } else if total_size < tiers.huge_threshold {
        tiers.large
    } else {
        tiers.huge
    };
    width.max(1)
}

/// Deterministic chunk id for `file_name` and `index`.
///
/// Path separators are percent-escaped (and `%` itself), so distinct names
/// never share a temp file.
pub fn chunk_id(file_name: &str, index: usize) -> String {
    let mut escaped = String::with_capacity(file_name.len());
    for c in file_name.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    format!("{}_{}", escaped, index)
}

/// Split `[0, total_size)` into ordered, non-overlapping chunks
pub fn plan_chunks(file_name: &str, total_size: u64, tiers: &ChunkTiers) -> Vec<ChunkSpec> {
    if total_size == 0 {
        return Vec::new();
    }

    let width = chunk_width(total_size, tiers);
    let count = total_size.div_ceil(width) as usize;
    let mut chunks = Vec::with_capacity(count);

    for i in 0..count {
        let start = i as u64 * width;
        let end = if i == count - 1 {
            total_size - 1
        } else {
            start + width - 1
        };

        chunks.push(ChunkSpec {
            id: chunk_id(file_name, i),
            index: i,
            start_byte: start,
            end_byte: end,
            downloaded_bytes: 0,
            state: ChunkState::Pending,
        });
    }

    chunks
}
