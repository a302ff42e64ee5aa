//! Error handling for the download engine

use thiserror::Error;

/// Main error type for chunked downloads
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Unable to determine size of {0}")]
    SizeUnavailable(String),

    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Insufficient storage: {required} bytes required, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Destination directory unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("Corrupted or missing chunk: {0}")]
    CorruptedOrMissingChunk(String),

    #[error("Response ended early: expected {expected} bytes, received {received}")]
    IncompleteBody { expected: u64, received: u64 },

    #[error("Merge incomplete: {0} chunk(s) missing")]
    MergeIncomplete(usize),

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether partial on-disk state survives this error and a later
    /// `resume()` can continue from it.
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            DownloadError::InvalidUrl(_)
                | DownloadError::InvalidFileName(_)
                | DownloadError::DestinationUnavailable(_)
                | DownloadError::InsufficientStorage { .. }
                | DownloadError::NetworkUnavailable
                | DownloadError::SizeUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_failures_are_not_resumable() {
        assert!(!DownloadError::InvalidUrl("nope".into()).is_resumable());
        assert!(!DownloadError::NetworkUnavailable.is_resumable());
        assert!(!DownloadError::InvalidFileName("../x".into()).is_resumable());
        assert!(!DownloadError::InsufficientStorage {
            required: 10,
            available: 1
        }
        .is_resumable());
    }

    #[test]
    fn test_transfer_failures_are_resumable() {
        assert!(DownloadError::HttpStatus(503).is_resumable());
        assert!(DownloadError::Timeout.is_resumable());
        assert!(DownloadError::MergeIncomplete(2).is_resumable());
    }

    #[test]
    fn test_merge_incomplete_message_mentions_count() {
        let msg = DownloadError::MergeIncomplete(3).to_string();
        assert!(msg.contains('3'));
        assert!(msg.to_lowercase().contains("incomplete"));
    }
}
