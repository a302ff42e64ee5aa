//! Single range request streamed straight to a chunk file

use crate::downloader::size::parse_content_range;
use crate::utils::error::DownloadError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WRITE_BUFFER: usize = 64 * 1024;

/// What to fetch and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub url: String,
    pub chunk_id: String,
    /// First byte to request: chunk start plus whatever is already on disk
    pub start_byte: u64,
    /// Inclusive
    pub end_byte: u64,
    pub path: PathBuf,
    /// Whether a `200` body may be written here. At most one chunk per file
    /// gets this, so an origin that ignores `Range` sends the file once.
    pub accept_full_file: bool,
}

impl ChunkRequest {
    pub fn expected_len(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }
}

/// Result of one fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    /// The origin ignored `Range` and sent the whole file
    pub is_full_file: bool,
}

/// Fills one chunk file from the network.
///
/// Implementations append to `request.path` on a ranged response and
/// truncate it on a full-file response. A full-file response to a request
/// without `accept_full_file` is reported with `bytes_written == 0` and its
/// body is never read. Cancellation returns `DownloadError::Cancelled` and
/// leaves whatever was written on disk.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError>;
}

/// `reqwest`-backed fetcher
#[derive(Debug, Clone)]
pub struct HttpChunkFetcher {
    client: Client,
    read_timeout: Duration,
    short_body_ratio: f64,
}

impl HttpChunkFetcher {
    pub fn new(client: Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
            short_body_ratio: 0.9,
        }
    }

    pub fn with_short_body_ratio(mut self, ratio: f64) -> Self {
        self.short_body_ratio = ratio;
        self
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        debug!(
            "Fetching chunk {} (bytes {}-{})",
            request.chunk_id, request.start_byte, request.end_byte
        );

        let send = self
            .client
            .get(&request.url)
            .header(RANGE, format!("bytes={}-{}", request.start_byte, request.end_byte))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            res = timeout(self.read_timeout, send) => match res {
                Ok(response) => response?,
                Err(_) => return Err(DownloadError::Timeout),
            },
        };

        let is_full_file = match response.status() {
            StatusCode::PARTIAL_CONTENT => false,
            StatusCode::OK => true,
            other => return Err(DownloadError::HttpStatus(other.as_u16())),
        };

        if !is_full_file {
            let served_start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .map(|(start, _, _)| start);
            if let Some(start) = served_start {
                if start != request.start_byte {
                    return Err(DownloadError::CorruptedOrMissingChunk(format!(
                        "{}: requested offset {}, server sent {}",
                        request.chunk_id, request.start_byte, start
                    )));
                }
            }
        } else if request.accept_full_file {
            debug!("Origin ignored Range for chunk {}, taking full file", request.chunk_id);
        } else {
            debug!("Origin ignored Range for chunk {}, dropping body", request.chunk_id);
            return Ok(FetchOutcome {
                bytes_written: 0,
                is_full_file: true,
            });
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if is_full_file {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(&request.path).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);

        let limit = if is_full_file {
            None
        } else {
            Some(request.expected_len())
        };
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    writer.flush().await?;
                    return Err(DownloadError::Cancelled);
                }
                next = timeout(self.read_timeout, stream.next()) => next,
            };

            let bytes = match next {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(e))) => {
                    writer.flush().await?;
                    return Err(e.into());
                }
                Ok(None) => break,
                Err(_) => {
                    writer.flush().await?;
                    return Err(DownloadError::Timeout);
                }
            };

            let take = match limit {
                Some(limit) => ((limit - written) as usize).min(bytes.len()),
                None => bytes.len(),
            };
            writer.write_all(&bytes[..take]).await?;
            written += take as u64;

            if limit.is_some_and(|limit| written >= limit) {
                break;
            }
        }

        writer.flush().await?;

        if let Some(expected) = limit {
            if (written as f64) < expected as f64 * self.short_body_ratio {
                warn!(
                    "Chunk {} received {} of {} expected bytes",
                    request.chunk_id, written, expected
                );
            }
        }

        Ok(FetchOutcome {
            bytes_written: written,
            is_full_file,
        })
    }
}
