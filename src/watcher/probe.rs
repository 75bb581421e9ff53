//! Reachability probes

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Answers "can a TCP connection to `addr` be opened right now?".
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn reachable(&self, addr: &str) -> bool;
}

/// Bounded TCP connect; the connection is dropped immediately.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn reachable(&self, addr: &str) -> bool {
        if addr.is_empty() {
            return false;
        }
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!("Probe {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                tracing::debug!("Probe {} timed out after {:?}", addr, self.timeout);
                false
            }
        }
    }
}
