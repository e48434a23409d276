//! Platform online signal for hosts without a network-status API
//!
//! Polls a TCP connect to the remote host. A completed handshake counts as
//! "online", anything else as "offline". The result is fed to
//! [`ReachabilityMonitor::set_platform_online`], which takes care of edge
//! detection.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use url::Url;

use super::ReachabilityMonitor;
use crate::error::{EngineError, EngineResult};

const MIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TcpPlatformWatch {
    host: String,
    port: u16,
    poll: Duration,
    connect_timeout: Duration,
}

impl TcpPlatformWatch {
    pub fn new(host: &str, port: u16, poll: Duration, connect_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            poll: poll.max(MIN_POLL),
            connect_timeout,
        }
    }

    /// Watch the host and port of a remote base URL
    pub fn for_url(base_url: &str, poll: Duration, connect_timeout: Duration) -> EngineResult<Self> {
        let url = Url::parse(base_url)
            .map_err(|e| EngineError::Config(format!("Invalid remote URL '{}': {}", base_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Config(format!("Remote URL '{}' has no host", base_url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| EngineError::Config(format!("Remote URL '{}' has no port", base_url)))?;

        Ok(Self::new(host, port, poll, connect_timeout))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// One connect attempt
    pub async fn check(&self) -> bool {
        let address = self.address();
        match timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::trace!("Connect to {} failed: {}", address, e);
                false
            }
            Err(_) => {
                tracing::trace!("Connect to {} timed out", address);
                false
            }
        }
    }

    pub fn spawn(self, monitor: Arc<ReachabilityMonitor>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.poll);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                let online = self.check().await;
                monitor.set_platform_online(online);
            }
        })
    }
}
