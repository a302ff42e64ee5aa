//! Failure classification and jittered exponential backoff

use crate::utils::error::DownloadError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::time::Duration;

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryReason {
    NetworkError,
    ServerError,
    Timeout,
    DiskError,
    CorruptedFile,
    Unknown,
}

impl RetryReason {
    /// Map an error onto a retry bucket
    pub fn classify(error: &DownloadError) -> Self {
        match error {
            DownloadError::NetworkUnavailable => RetryReason::NetworkError,
            DownloadError::Timeout => RetryReason::Timeout,
            DownloadError::Network(e) => classify_reqwest(e),
            DownloadError::HttpStatus(code) => match *code {
                408 => RetryReason::Timeout,
                429 | 500..=599 => RetryReason::ServerError,
                _ => RetryReason::Unknown,
            },
            DownloadError::IncompleteBody { .. } | DownloadError::SizeUnavailable(_) => {
                RetryReason::ServerError
            }
            DownloadError::Disk(e) => match e.kind() {
                ErrorKind::TimedOut => RetryReason::Timeout,
                ErrorKind::NotFound | ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
                    RetryReason::CorruptedFile
                }
                _ => RetryReason::DiskError,
            },
            DownloadError::InsufficientStorage { .. } => RetryReason::DiskError,
            DownloadError::CorruptedOrMissingChunk(_) => RetryReason::CorruptedFile,
            _ => RetryReason::Unknown,
        }
    }
}

fn classify_reqwest(error: &reqwest::Error) -> RetryReason {
    if error.is_timeout() {
        RetryReason::Timeout
    } else if error.is_connect() {
        RetryReason::NetworkError
    } else if let Some(status) = error.status() {
        if status.is_server_error() {
            RetryReason::ServerError
        } else {
            RetryReason::Unknown
        }
    } else if error.is_body() || error.is_decode() {
        RetryReason::ServerError
    } else if error.is_request() {
        RetryReason::NetworkError
    } else {
        RetryReason::Unknown
    }
}

/// Retry tuning
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Global attempt cap per chunk, first attempt included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random fraction added to each delay, in `[0, 1]`
    pub jitter: f64,
    pub disk_attempts: u32,
    pub unknown_attempts: u32,
}

impl RetryConfig {
    /// Bulk chunk transfer
    pub fn bulk() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
            disk_attempts: 2,
            unknown_attempts: 3,
        }
    }

    /// Small metadata requests (size probes)
    pub fn metadata() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..Self::bulk()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::bulk()
    }
}

/// Decides whether and when to retry
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn classify(&self, error: &DownloadError) -> RetryReason {
        RetryReason::classify(error)
    }

    /// Attempt cap for a reason, bounded by the global cap
    pub fn attempt_limit(&self, reason: RetryReason) -> u32 {
        let global = self.config.max_attempts.max(1);
        match reason {
            RetryReason::DiskError | RetryReason::CorruptedFile => {
                global.min(self.config.disk_attempts)
            }
            RetryReason::Unknown => global.min(self.config.unknown_attempts),
            _ => global,
        }
    }

    /// `attempts` is how many attempts have already failed (1 after the first).
    /// `network_available` must reflect live connectivity; a `NetworkError` is
    /// never retried into a dead link.
    pub fn should_retry(&self, reason: RetryReason, attempts: u32, network_available: bool) -> bool {
        if reason == RetryReason::NetworkError && !network_available {
            return false;
        }
        attempts < self.attempt_limit(reason)
    }

    /// Jittered delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let fraction = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.jitter.min(1.0))
        } else {
            0.0
        };
        self.backoff_with_jitter(attempt, fraction)
    }

    /// Delay with an explicit jitter fraction. With `fraction <= 1` the
    /// sequence over consecutive attempts is non-decreasing.
    pub fn backoff_with_jitter(&self, attempt: u32, fraction: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.config.base_delay.as_secs_f64() * f64::from(1u32 << exponent);
        let jittered = base * (1.0 + fraction.clamp(0.0, 1.0));
        let capped = jittered.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Attempt bookkeeping for one chunk; dropped when the chunk completes
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_reason: Option<RetryReason>,
}

impl RetryState {
    pub fn record(&mut self, reason: RetryReason) -> u32 {
        self.attempts += 1;
        self.last_reason = Some(reason);
        self.attempts
    }
}
