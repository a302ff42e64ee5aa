//! Deterministic collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chunkloader::downloader::retry::RetryConfig;
use chunkloader::downloader::{
    Backends, ChunkFetcher, ChunkRequest, ChunkStore, ChunkTiers, DownloadConfig, FetchOutcome,
    SizeProbe,
};
use chunkloader::utils::{DownloadError, FixedSpace, NetworkMonitor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Repeatable, non-periodic-looking payload
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + i / 251) % 256) as u8)
        .collect()
}

/// Every tier is `width` bytes wide
pub fn flat_tiers(width: u64) -> ChunkTiers {
    ChunkTiers {
        small: width,
        medium: width,
        large: width,
        huge: width,
        ..ChunkTiers::default()
    }
}

pub fn fast_config(tiers: ChunkTiers) -> DownloadConfig {
    let retry = RetryConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
        ..RetryConfig::bulk()
    };
    DownloadConfig {
        tiers,
        retry: retry.clone(),
        metadata_retry: retry,
        progress_interval: Duration::ZERO,
        ..DownloadConfig::default()
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Status(u16),
    Offline,
}

/// In-memory origin keyed by URL
#[derive(Default)]
pub struct MockFetcher {
    files: HashMap<String, Arc<Vec<u8>>>,
    failures: Mutex<HashMap<String, (u32, Failure)>>,
    full_bodies: AtomicUsize,
    short_once: Mutex<HashMap<String, bool>>,
    calls: Mutex<Vec<String>>,
    ignore_range: bool,
    piece_size: usize,
    piece_delay: Duration,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            piece_size: 4096,
            ..Self::default()
        }
    }

    pub fn with_file(mut self, url: &str, data: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), Arc::new(data));
        self
    }

    /// Answer every request with the whole body and status 200
    pub fn ignoring_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    /// Stream in `piece_size` pieces with a pause between them
    pub fn throttled(mut self, piece_size: usize, piece_delay: Duration) -> Self {
        self.piece_size = piece_size.max(1);
        self.piece_delay = piece_delay;
        self
    }

    /// Fail the next `times` fetches of `chunk_id` with HTTP `status`
    pub fn fail_chunk(&self, chunk_id: &str, times: u32, status: u16) {
        self.failures
            .lock()
            .unwrap()
            .insert(chunk_id.to_string(), (times, Failure::Status(status)));
    }

    /// Fail the next `times` fetches of `chunk_id` as if the link dropped
    pub fn fail_chunk_offline(&self, chunk_id: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(chunk_id.to_string(), (times, Failure::Offline));
    }

    /// Number of whole-file bodies written
    pub fn full_bodies(&self) -> usize {
        self.full_bodies.load(Ordering::SeqCst)
    }

    /// Deliver only half of the next fetch of `chunk_id`
    pub fn short_body_once(&self, chunk_id: &str) {
        self.short_once
            .lock()
            .unwrap()
            .insert(chunk_id.to_string(), true);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, chunk_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == chunk_id)
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn take_failure(&self, chunk_id: &str) -> Option<DownloadError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(chunk_id) {
            Some((remaining, failure)) if *remaining > 0 => {
                *remaining -= 1;
                Some(match *failure {
                    Failure::Status(status) => DownloadError::HttpStatus(status),
                    Failure::Offline => DownloadError::NetworkUnavailable,
                })
            }
            _ => None,
        }
    }

    fn take_short(&self, chunk_id: &str) -> bool {
        self.short_once
            .lock()
            .unwrap()
            .remove(chunk_id)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChunkFetcher for MockFetcher {
    async fn fetch(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError> {
        self.calls.lock().unwrap().push(request.chunk_id.clone());

        if let Some(error) = self.take_failure(&request.chunk_id) {
            return Err(error);
        }
        let data = self
            .files
            .get(&request.url)
            .cloned()
            .ok_or(DownloadError::HttpStatus(404))?;

        let mut options = OpenOptions::new();
        options.create(true);
        let body = if self.ignore_range {
            if !request.accept_full_file {
                return Ok(FetchOutcome {
                    bytes_written: 0,
                    is_full_file: true,
                });
            }
            self.full_bodies.fetch_add(1, Ordering::SeqCst);
            options.write(true).truncate(true);
            &data[..]
        } else {
            options.append(true);
            let body = &data[request.start_byte as usize..=request.end_byte as usize];
            if self.take_short(&request.chunk_id) {
                &body[..body.len() / 2]
            } else {
                body
            }
        };

        let mut file = options.open(&request.path).await?;
        let mut written = 0u64;
        for piece in body.chunks(self.piece_size) {
            if cancel.is_cancelled() {
                file.flush().await?;
                return Err(DownloadError::Cancelled);
            }
            file.write_all(piece).await?;
            written += piece.len() as u64;
            if !self.piece_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        file.flush().await?;
                        return Err(DownloadError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.piece_delay) => {}
                }
            }
        }
        file.flush().await?;

        Ok(FetchOutcome {
            bytes_written: written,
            is_full_file: self.ignore_range,
        })
    }
}

/// Sizes known up front
#[derive(Default)]
pub struct StaticSizes(pub HashMap<String, u64>);

#[async_trait]
impl SizeProbe for StaticSizes {
    async fn resolve(&self, url: &str) -> Result<u64, DownloadError> {
        self.0
            .get(url)
            .copied()
            .ok_or_else(|| DownloadError::SizeUnavailable(url.to_string()))
    }
}

pub struct Connectivity(pub bool);

#[async_trait]
impl NetworkMonitor for Connectivity {
    async fn is_available(&self) -> bool {
        self.0
    }
}

/// Online for the first `checks` queries, offline afterwards
pub struct DropsOffline(AtomicUsize);

impl DropsOffline {
    pub fn after(checks: usize) -> Self {
        Self(AtomicUsize::new(checks))
    }
}

#[async_trait]
impl NetworkMonitor for DropsOffline {
    async fn is_available(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub fn backends(fetcher: Arc<MockFetcher>, sizes: StaticSizes) -> Backends {
    Backends {
        fetcher,
        sizes: Arc::new(sizes),
        network: Arc::new(Connectivity(true)),
        storage: Arc::new(FixedSpace(None)),
    }
}

pub fn store_in(dir: &std::path::Path) -> ChunkStore {
    ChunkStore::new(dir.join("chunks"))
}
