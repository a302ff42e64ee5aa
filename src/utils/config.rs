//! Application configuration

use crate::downloader::engine::DownloadConfig;
use crate::downloader::retry::RetryConfig;
use crate::downloader::segment::ChunkTiers;
use crate::utils::platform;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Where merged artifacts are written
    pub download_location: PathBuf,

    /// Shared directory for chunk temp files
    pub temp_dir: PathBuf,

    /// Simultaneous chunk fetches per file
    pub max_concurrent_chunks: usize,

    /// Attempts per chunk, first one included
    pub retry_attempts: u32,

    /// Attempts per size probe
    pub metadata_retry_attempts: u32,

    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub probe_timeout_secs: u64,
    pub chunk_timeout_secs: u64,

    /// Chunk files older than this are swept at session start
    pub temp_retention_hours: u64,

    /// Free space required, as a multiple of the bytes to download
    pub storage_safety_factor: f64,

    /// Destination files smaller than this are treated as partial on cancel
    pub min_artifact_bytes: u64,

    /// `host:port` used to check connectivity before retrying network errors
    pub connectivity_probe: Option<String>,

    pub chunk_tiers: ChunkTiers,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            download_location: platform::default_download_dir(),
            temp_dir: platform::chunk_temp_dir(),
            max_concurrent_chunks: 4,
            retry_attempts: 5,
            metadata_retry_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            probe_timeout_secs: 30,
            chunk_timeout_secs: 120,
            temp_retention_hours: 24,
            storage_safety_factor: 2.0,
            min_artifact_bytes: 1024,
            connectivity_probe: None,
            chunk_tiers: ChunkTiers::default(),
        }
    }
}

impl AppSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings: AppSettings = serde_json::from_str(&content)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings.sanitized())
    }

    /// Missing file means defaults; a malformed file is still an error
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    /// Enforce sane minimums
    pub fn sanitized(mut self) -> Self {
        self.max_concurrent_chunks = self.max_concurrent_chunks.max(1);
        self.retry_attempts = self.retry_attempts.max(1);
        self.metadata_retry_attempts = self.metadata_retry_attempts.max(1);
        self.retry_max_delay_ms = self.retry_max_delay_ms.max(self.retry_base_delay_ms);
        self.probe_timeout_secs = self.probe_timeout_secs.max(1);
        self.chunk_timeout_secs = self.chunk_timeout_secs.max(1);
        if !self.storage_safety_factor.is_finite() || self.storage_safety_factor < 1.0 {
            self.storage_safety_factor = 1.0;
        }
        self
    }

    pub fn to_download_config(&self) -> DownloadConfig {
        let base = Duration::from_millis(self.retry_base_delay_ms);
        let cap = Duration::from_millis(self.retry_max_delay_ms);
        let defaults = DownloadConfig::default();

        DownloadConfig {
            tiers: self.chunk_tiers,
            max_concurrent_chunks: self.max_concurrent_chunks.max(1),
            retry: RetryConfig {
                max_attempts: self.retry_attempts,
                base_delay: base,
                max_delay: cap,
                ..RetryConfig::bulk()
            },
            metadata_retry: RetryConfig {
                max_attempts: self.metadata_retry_attempts,
                base_delay: base / 2,
                max_delay: cap.min(Duration::from_secs(10)).max(base / 2),
                ..RetryConfig::metadata()
            },
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            temp_retention: Duration::from_secs(self.temp_retention_hours * 3600),
            storage_safety_factor: self.storage_safety_factor,
            min_artifact_bytes: self.min_artifact_bytes,
            connectivity_probe: self.connectivity_probe.clone(),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppSettings::default();
        assert_eq!(config.max_concurrent_chunks, 4);
        assert_eq!(config.retry_attempts, 5);
        assert!(config.metadata_retry_attempts < config.retry_attempts);
        assert!(config.storage_safety_factor >= 2.0);
    }

    #[test]
    fn test_sanitized_enforces_minimums() {
        let config = AppSettings {
            max_concurrent_chunks: 0,
            retry_attempts: 0,
            storage_safety_factor: f64::NAN,
            retry_base_delay_ms: 5000,
            retry_max_delay_ms: 10,
            ..AppSettings::default()
        }
        .sanitized();

        assert_eq!(config.max_concurrent_chunks, 1);
        assert_eq!(config.retry_attempts, 1);
        assert_eq!(config.storage_safety_factor, 1.0);
        assert_eq!(config.retry_max_delay_ms, 5000);
    }

    #[test]
    fn test_round_trip_through_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("settings.json");
        let settings = AppSettings {
            max_concurrent_chunks: 6,
            connectivity_probe: Some("example.com:443".into()),
            ..AppSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(AppSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{ "retry_attempts": 7 }"#).unwrap();

        let settings = AppSettings::load(&path).unwrap();
        assert_eq!(settings.retry_attempts, 7);
        assert_eq!(settings.max_concurrent_chunks, 4);
    }

    #[test]
    fn test_missing_file_is_default_but_garbage_is_error() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("absent.json");
        assert_eq!(AppSettings::load_or_default(&missing).unwrap(), AppSettings::default());

        let garbage = temp.path().join("bad.json");
        std::fs::write(&garbage, "not json").unwrap();
        assert!(AppSettings::load_or_default(&garbage).is_err());
    }

    #[test]
    fn test_to_download_config() {
        let settings = AppSettings {
            retry_attempts: 4,
            chunk_timeout_secs: 60,
            ..AppSettings::default()
        };
        let config = settings.to_download_config();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.metadata_retry.max_attempts, 3);
        assert_eq!(config.chunk_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_chunks, 4);
        assert!(config.metadata_retry.max_delay >= config.metadata_retry.base_delay);
    }
}
