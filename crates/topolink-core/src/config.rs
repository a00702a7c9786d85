use crate::error::TopologyError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Everything the connector protocol reads from its config provider.
///
/// Missing keys fall back to [`ConnectorConfig::default`], so a TOML file
/// only needs to name what it changes.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectorConfig {
    pub bind: String,
    pub path_prefix: String,
    pub server_info: String,
    pub heartbeat_interval_secs: u64,
    /// Announcement timeout.
    pub heartbeat_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub so_timeout_secs: u64,
    pub whitelist: Vec<String>,
    pub hmac_enabled: bool,
    pub shared_key: Option<String>,
    pub shared_key_ttl_secs: u64,
    pub encryption_enabled: bool,
    pub gzip_connector_requests: bool,
    pub auto_stop_local_loop: bool,
    pub backoff_standby_factor: u32,
    pub backoff_stable_factor: u32,
    pub failure_backoff_threshold: u32,
    pub max_message_bytes: usize,
    pub max_inherited: usize,
    pub max_depth: usize,
    pub connector_urls: Vec<String>,
    pub local: LocalClusterConfig,
}

/// Static description of the local cluster, used when no external
/// membership mechanism is wired in (the `topolink` binary).
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LocalClusterConfig {
    pub instance_id: String,
    pub cluster_id: String,
    pub leader: bool,
    pub members: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            path_prefix: "/topology/connector".to_string(),
            server_info: String::new(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            connection_timeout_secs: 10,
            so_timeout_secs: 10,
            whitelist: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            hmac_enabled: false,
            shared_key: None,
            shared_key_ttl_secs: 4 * 3600,
            encryption_enabled: false,
            gzip_connector_requests: false,
            auto_stop_local_loop: false,
            backoff_standby_factor: 5,
            backoff_stable_factor: 5,
            failure_backoff_threshold: 3,
            max_message_bytes: 16 * 1024 * 1024,
            max_inherited: 256,
            max_depth: 8,
            connector_urls: Vec::new(),
            local: LocalClusterConfig::default(),
        }
    }
}

impl ConnectorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, TopologyError> {
        let config: ConnectorConfig =
            toml::from_str(raw).map_err(|e| TopologyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        tracing::debug!("ConnectorConfig: loading {}", path.display());
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        let key_missing = self.shared_key.as_deref().map_or(true, str::is_empty);
        if (self.hmac_enabled || self.encryption_enabled) && key_missing {
            return Err(TopologyError::Config(
                "shared_key must be set when hmac or encryption is enabled".to_string(),
            ));
        }
        if self.encryption_enabled && !self.hmac_enabled {
            return Err(TopologyError::Config("encryption requires hmac_enabled".to_string()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(TopologyError::Config("heartbeat_interval_secs must be positive".to_string()));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(TopologyError::Config(format!(
                "heartbeat_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.shared_key_ttl_secs == 0 {
            return Err(TopologyError::Config("shared_key_ttl_secs must be positive".to_string()));
        }
        if !self.path_prefix.starts_with('/') || self.path_prefix.ends_with('/') {
            return Err(TopologyError::Config(format!(
                "path_prefix {:?} must start with '/' and not end with '/'",
                self.path_prefix
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Whole-request budget of one ping: connect plus read.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs + self.so_timeout_secs)
    }

    /// Seconds a loop (standby) connector is told to stay quiet, if any.
    pub fn backoff_standby_interval_secs(&self) -> Option<u64> {
        (self.backoff_standby_factor > 1)
            .then(|| u64::from(self.backoff_standby_factor) * self.heartbeat_interval_secs)
    }

    pub fn shared_key_ttl_millis(&self) -> u64 {
        self.shared_key_ttl_secs * 1000
    }
}
