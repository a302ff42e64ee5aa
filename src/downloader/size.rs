//! Authoritative remote file size resolution

use crate::downloader::retry::RetryPolicy;
use crate::utils::error::DownloadError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Origin header carrying the true (uncompressed) size of a linked file
pub const LINKED_SIZE_HEADER: &str = "x-linked-size";

/// Something that can tell how large a remote file is
#[async_trait]
pub trait SizeProbe: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<u64, DownloadError>;
}

/// Parse `bytes <start>-<end>/<total>`; total is `None` for `*`
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
}

/// Pick a size out of response headers.
///
/// Precedence: linked size, then `Content-Length` when the payload is not
/// content-encoded (a compressed length under-reports), then the
/// `Content-Range` total.
pub fn size_from_headers(headers: &HeaderMap) -> Option<u64> {
    if let Some(size) = header_u64(headers, LINKED_SIZE_HEADER) {
        return Some(size);
    }

    let encoded = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().is_empty() && !v.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(false);
    if !encoded {
        if let Some(size) = header_u64(headers, CONTENT_LENGTH.as_str()) {
            return Some(size);
        }
    }

    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
        .and_then(|(_, _, total)| total)
        .filter(|&v| v > 0)
}

/// HEAD-based size resolver with a ranged-GET fallback
#[derive(Debug, Clone)]
pub struct SizeResolver {
    client: Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl SizeResolver {
    pub fn new(client: Client, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            client,
            timeout,
            retry,
        }
    }

    async fn probe_once(&self, url: &str) -> Result<u64, DownloadError> {
        let head = match timeout(self.timeout, self.client.head(url).send()).await {
            Ok(res) => res?,
            Err(_) => return Err(DownloadError::Timeout),
        };

        let status = head.status();
        if status.is_server_error() {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }
        if status.is_success() {
            if let Some(size) = size_from_headers(head.headers()) {
                debug!("Resolved {} to {} bytes via HEAD", url, size);
                return Ok(size);
            }
        }

        // Some origins answer HEAD poorly; a one-byte range still reports the total.
        let probe = match timeout(
            self.timeout,
            self.client.get(url).header(RANGE, "bytes=0-0").send(),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => return Err(DownloadError::Timeout),
        };

        let status = probe.status();
        if status == StatusCode::PARTIAL_CONTENT {
            let total = probe
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .and_then(|(_, _, total)| total)
                .filter(|&v| v > 0);
            if let Some(size) = total {
                debug!("Resolved {} to {} bytes via range probe", url, size);
                return Ok(size);
            }
        } else if status == StatusCode::OK {
            if let Some(size) = size_from_headers(probe.headers()) {
                return Ok(size);
            }
        } else if !status.is_success() {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }

        Err(DownloadError::SizeUnavailable(url.to_string()))
    }
}

#[async_trait]
impl SizeProbe for SizeResolver {
    async fn resolve(&self, url: &str) -> Result<u64, DownloadError> {
        let mut attempts = 0;
        loop {
            match self.probe_once(url).await {
                Ok(size) => return Ok(size),
                Err(e) => {
                    attempts += 1;
                    let reason = self.retry.classify(&e);
                    if !self.retry.should_retry(reason, attempts, true) {
                        return Err(e);
                    }
                    let delay = self.retry.backoff(attempts);
                    warn!(
                        "Size probe for {} failed (attempt {}, {:?}): {}; retrying in {:?}",
                        url, attempts, reason, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Resolve many URLs concurrently. Returns whatever resolved; fails only
/// when every URL failed.
pub async fn resolve_all(
    probe: &dyn SizeProbe,
    urls: &[String],
    max_concurrent: usize,
) -> Result<HashMap<String, u64>, DownloadError> {
    if urls.is_empty() {
        return Ok(HashMap::new());
    }

    let results: Vec<(String, Result<u64, DownloadError>)> = stream::iter(urls.iter().cloned())
        .map(|url| async move {
            let result = probe.resolve(&url).await;
            (url, result)
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut sizes = HashMap::new();
    let mut last_error = None;
    for (url, result) in results {
        match result {
            Ok(size) => {
                sizes.insert(url, size);
            }
            Err(e) => {
                warn!("Size resolution failed for {}: {}", url, e);
                last_error = Some(e);
            }
        }
    }

    if sizes.is_empty() {
        return Err(last_error.unwrap_or_else(|| DownloadError::SizeUnavailable(urls.join(", "))));
    }
    Ok(sizes)
}
