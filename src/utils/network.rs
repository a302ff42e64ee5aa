//! Live connectivity checks

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Answers "is the network usable right now?"
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_available(&self) -> bool;
}

/// TCP reachability of a configured `host:port`.
///
/// With no address configured the network is assumed available and
/// failures surface through the transfers themselves.
#[derive(Debug, Clone)]
pub struct ReachabilityMonitor {
    address: Option<String>,
    timeout: Duration,
}

impl ReachabilityMonitor {
    pub fn new(address: Option<String>, timeout: Duration) -> Self {
        Self { address, timeout }
    }
}

#[async_trait]
impl NetworkMonitor for ReachabilityMonitor {
    async fn is_available(&self) -> bool {
        let Some(address) = self.address.as_deref() else {
            return true;
        };

        match timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Connectivity probe to {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("Connectivity probe to {} timed out", address);
                false
            }
        }
    }
}
