//! Platform-specific utilities
//!
//! This module provides cross-platform abstractions for:
//! - Application directories (config, cache, downloads)
//! - Free space on the volume holding a directory

use std::path::{Path, PathBuf};
use sysinfo::Disks;

const APP_DIR: &str = if cfg!(target_os = "linux") {
    "chunkloader"
} else {
    "Chunkloader"
};

/// Returns the default destination directory
/// - All platforms: ~/Downloads/Chunkloader (or ~/Downloads/chunkloader on Linux)
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(APP_DIR)
}

/// Returns the configuration directory
/// - macOS: ~/Library/Application Support/Chunkloader
/// - Windows: %APPDATA%\Chunkloader
/// - Linux: ~/.config/chunkloader
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Default settings file location
pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

/// Returns the cache directory
/// - macOS: ~/Library/Caches/Chunkloader
/// - Windows: %LOCALAPPDATA%\Chunkloader
/// - Linux: ~/.cache/chunkloader
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

/// Shared directory for per-chunk temp files
pub fn chunk_temp_dir() -> PathBuf {
    cache_dir().join("chunks")
}

/// Reports free space for a destination
pub trait StorageProbe: Send + Sync {
    /// Bytes available to the volume holding `dir`; `None` when unknown
    fn available_space(&self, dir: &Path) -> Option<u64>;
}

/// Disk list lookup: the mount point with the longest matching prefix wins
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSpace;

impl StorageProbe for DiskSpace {
    fn available_space(&self, dir: &Path) -> Option<u64> {
        let target = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        let mut best: Option<(usize, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if target.starts_with(mount) {
                let score = mount.as_os_str().len();
                match best {
                    Some((best_score, _)) if best_score >= score => {}
                    _ => best = Some((score, disk.available_space())),
                }
            }
        }

        best.map(|(_, available)| available)
    }
}

/// Fixed answer, for tests and hosts that manage space themselves
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub Option<u64>);

impl StorageProbe for FixedSpace {
    fn available_space(&self, _dir: &Path) -> Option<u64> {
        self.0
    }
}
