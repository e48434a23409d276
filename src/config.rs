//! Engine configuration
//!
//! Loaded from `syncline.toml` in a configuration directory. A `.env` file in
//! the same directory is applied first, then these variables override the file:
//!
//! - `SYNCLINE_REMOTE_URL` - Base URL of the remote store
//! - `SYNCLINE_API_TOKEN` - Bearer token sent with every remote request
//! - `SYNCLINE_DATA_DIR` - Directory holding the local database
//! - `SYNCLINE_OWNER` - Default owner collection for the CLI

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "syncline.toml";

/// Environment variable names
pub const ENV_REMOTE_URL: &str = "SYNCLINE_REMOTE_URL";
pub const ENV_API_TOKEN: &str = "SYNCLINE_API_TOKEN";
pub const ENV_DATA_DIR: &str = "SYNCLINE_DATA_DIR";
pub const ENV_OWNER: &str = "SYNCLINE_OWNER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Owner collection used when none is given explicitly
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Remote store endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Per-call timeout for fetch/patch/delete
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Minimal data-layer read used as the data reachability probe
    #[serde(default = "default_data_probe_path")]
    pub data_probe_path: String,
    /// Control-layer endpoint probed with a preflight (OPTIONS) request
    #[serde(default)]
    pub control_probe_url: Option<String>,
    /// Cheap resource fetched to measure round-trip time
    #[serde(default = "default_link_probe_path")]
    pub link_probe_path: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_data_probe_path() -> String {
    "/collections/_probe/entities?limit=1".to_string()
}

fn default_link_probe_path() -> String {
    "/health".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            data_probe_path: default_data_probe_path(),
            control_probe_url: None,
            link_probe_path: default_link_probe_path(),
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// The control probe defaults to the remote root when not configured.
    pub fn control_probe_url(&self) -> String {
        self.control_probe_url
            .clone()
            .unwrap_or_else(|| self.url("/"))
    }
}

/// Thresholds and timers for the reachability monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Generic probe round-trip above which the link is slow
    #[serde(default = "default_slow_rtt_ms")]
    pub slow_rtt_ms: u64,
    /// Platform-reported round-trip above which the link is slow
    #[serde(default = "default_slow_hint_rtt_ms")]
    pub slow_hint_rtt_ms: u64,
    /// Platform-reported bandwidth below which the link is slow
    #[serde(default = "default_slow_downlink_mbps")]
    pub slow_downlink_mbps: f64,
    /// How long the "restored" pulse stays raised
    #[serde(default = "default_restored_display_ms")]
    pub restored_display_ms: u64,
    /// Poll period of the TCP platform watch
    #[serde(default = "default_platform_poll_secs")]
    pub platform_poll_secs: u64,
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_slow_rtt_ms() -> u64 {
    3000
}

fn default_slow_hint_rtt_ms() -> u64 {
    2000
}

fn default_slow_downlink_mbps() -> f64 {
    0.5
}

fn default_restored_display_ms() -> u64 {
    3000
}

fn default_platform_poll_secs() -> u64 {
    5
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            slow_rtt_ms: default_slow_rtt_ms(),
            slow_hint_rtt_ms: default_slow_hint_rtt_ms(),
            slow_downlink_mbps: default_slow_downlink_mbps(),
            restored_display_ms: default_restored_display_ms(),
            platform_poll_secs: default_platform_poll_secs(),
        }
    }
}

impl ReachabilityConfig {
    /// Never zero: `tokio::time::interval` rejects an empty period
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn restored_display(&self) -> Duration {
        Duration::from_millis(self.restored_display_ms)
    }

    pub fn platform_poll(&self) -> Duration {
        Duration::from_secs(self.platform_poll_secs.max(1))
    }

    fn validate(&self) -> EngineResult<()> {
        if self.probe_interval_secs == 0 {
            return Err(EngineError::Config(
                "reachability.probe_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.platform_poll_secs == 0 {
            return Err(EngineError::Config(
                "reachability.platform_poll_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconciliation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts before a queued mutation is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Copy dropped mutations to the dead-letter table instead of discarding them
    #[serde(default)]
    pub keep_dead_letters: bool,
    /// Drop a mutation on its first terminal (4xx) rejection
    #[serde(default)]
    pub drop_terminal_rejections: bool,
    /// Collections refreshed after every pass, on top of the ones touched by it
    #[serde(default)]
    pub collections: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            keep_dead_letters: false,
            drop_terminal_rejections: false,
            collections: vec![],
        }
    }
}

/// Local database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Defaults to `<platform data dir>/syncline`
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    /// Key prefix of the flat legacy cache, followed by the owner id
    #[serde(default = "default_legacy_key_prefix")]
    pub legacy_key_prefix: String,
}

fn default_database_file() -> String {
    "syncline.db".to_string()
}

fn default_legacy_key_prefix() -> String {
    "entities:".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: default_database_file(),
            legacy_key_prefix: default_legacy_key_prefix(),
        }
    }
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| {
                    std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
                })
                .join("syncline")
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(&self.database_file)
    }
}

impl EngineConfig {
    /// Load configuration from a directory
    ///
    /// A missing `syncline.toml` is not an error: defaults are used and the
    /// environment overrides still apply.
    pub fn load(dir: &Path) -> EngineResult<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)?
        } else {
            tracing::debug!(
                "No {} in {}, using defaults",
                CONFIG_FILE_NAME,
                dir.display()
            );
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> EngineResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.reachability.validate()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_REMOTE_URL) {
            if !url.is_empty() {
                self.remote.base_url = url;
            }
        }

        if let Ok(token) = std::env::var(ENV_API_TOKEN) {
            if !token.is_empty() {
                self.remote.api_token = Some(token);
            }
        }

        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.is_empty() {
                self.storage.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(owner) = std::env::var(ENV_OWNER) {
            if !owner.is_empty() {
                self.owner = Some(owner);
            }
        }
    }

    /// Save configuration to a directory
    pub fn save(&self, dir: &Path) -> EngineResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), content)?;
        Ok(())
    }
}
