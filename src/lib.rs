//! Chunkloader library

pub mod backend;
pub mod downloader;
pub mod utils;

// Re-export main types for easier use
pub use backend::{BackendActor, BackendCommand, BackendEvent};
pub use downloader::{DownloadConfig, DownloadEngine, FileTarget, ProgressSnapshot, SessionState};
pub use utils::{AppSettings, DownloadError};
