//! Utility modules for error handling and configuration

pub mod config;
pub mod error;
pub mod network;
pub mod platform;

// Re-export for convenience
pub use config::AppSettings;
pub use error::DownloadError;
pub use network::{NetworkMonitor, ReachabilityMonitor};
pub use platform::{DiskSpace, FixedSpace, StorageProbe};
