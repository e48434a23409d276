//! Reachability probes

use reqwest::{Client, Method};
use std::time::{Duration, Instant};

use super::RoundTrip;
use crate::config::RemoteConfig;
use crate::error::{EngineError, EngineResult};

/// Low-cost fetch used to estimate round-trip time
#[async_trait::async_trait]
pub trait LinkProbe: Send + Sync {
    async fn round_trip(&self) -> RoundTrip;
}

/// A named service whose reachability is tracked separately from the link
#[async_trait::async_trait]
pub trait ServiceProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `true` when the service answered with a success status
    async fn probe(&self) -> bool;
}

fn probe_client(timeout: Duration) -> EngineResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Config(format!("HTTP client for probes: {}", e)))
}

/// Times a GET of a small resource
pub struct HttpLinkProbe {
    url: String,
    client: Client,
}

impl HttpLinkProbe {
    pub fn new(url: &str, timeout: Duration) -> EngineResult<Self> {
        Ok(Self {
            url: url.to_string(),
            client: probe_client(timeout)?,
        })
    }

    pub fn from_config(config: &RemoteConfig, timeout: Duration) -> EngineResult<Self> {
        Self::new(&config.url(&config.link_probe_path), timeout)
    }
}

#[async_trait::async_trait]
impl LinkProbe for HttpLinkProbe {
    async fn round_trip(&self) -> RoundTrip {
        let started = Instant::now();
        // Any HTTP answer proves the round trip, even an error status
        match self.client.get(&self.url).header("Cache-Control", "no-store").send().await {
            Ok(_) => RoundTrip::Measured(started.elapsed()),
            Err(e) => {
                tracing::debug!("Link probe {} failed: {}", self.url, e);
                RoundTrip::Failed
            }
        }
    }
}

/// Checks one service with a GET (data read) or OPTIONS (control preflight)
pub struct HttpServiceProbe {
    name: String,
    method: Method,
    url: String,
    token: Option<String>,
    client: Client,
}

impl HttpServiceProbe {
    pub fn new(name: &str, method: Method, url: &str, timeout: Duration) -> EngineResult<Self> {
        Ok(Self {
            name: name.to_string(),
            method,
            url: url.to_string(),
            token: None,
            client: probe_client(timeout)?,
        })
    }

    /// Minimal data-layer read
    pub fn data_api(config: &RemoteConfig, timeout: Duration) -> EngineResult<Self> {
        let mut probe = Self::new(
            "data_api",
            Method::GET,
            &config.url(&config.data_probe_path),
            timeout,
        )?;
        probe.token = config.api_token.clone();
        Ok(probe)
    }

    /// Control-layer preflight
    pub fn compute_api(config: &RemoteConfig, timeout: Duration) -> EngineResult<Self> {
        Self::new(
            "compute_api",
            Method::OPTIONS,
            &config.control_probe_url(),
            timeout,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl ServiceProbe for HttpServiceProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> bool {
        let mut request = self.client.request(self.method.clone(), &self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!("{} probe answered {}", self.name, response.status());
                false
            }
            Err(e) => {
                tracing::debug!("{} probe failed: {}", self.name, e);
                false
            }
        }
    }
}
