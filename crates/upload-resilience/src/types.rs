//! Server-pushed config documents and client configuration.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ResilienceError, ResilienceResult};

/// TTL applied when a config document does not carry one (5 minutes).
pub const DEFAULT_CONFIG_TTL_SECS: i64 = 5 * 60;

fn default_config_ttl() -> i64 {
    DEFAULT_CONFIG_TTL_SECS
}

/// Version gate shared by every feature group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearPolicy {
    /// Monotonically increasing per-group version.
    #[serde(rename = "clearId", alias = "clear_id", default)]
    pub clear_id: i64,

    /// Whether reaching `clear_id` should drop the group's cache.
    #[serde(rename = "clearCache", alias = "clear_cache", default)]
    pub clear_cache: bool,
}

/// Primary server config (`GET /v1/sdk/config`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Seconds this document stays valid.
    #[serde(default = "default_config_ttl")]
    pub ttl: i64,

    #[serde(default)]
    pub region: Option<RegionConfig>,

    #[serde(default)]
    pub dns: Option<DnsConfig>,

    #[serde(rename = "connectCheck", alias = "connect_check", default)]
    pub connect_check: Option<ConnectCheckConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    #[serde(flatten)]
    pub clear: ClearPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Absent means "leave as is".
    #[serde(default)]
    pub enable: Option<bool>,

    #[serde(flatten)]
    pub clear: ClearPolicy,

    #[serde(default)]
    pub udp: Option<ResolverConfig>,

    #[serde(default)]
    pub doh: Option<ResolverConfig>,
}

/// UDP or DoH resolver group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub enable: Option<bool>,

    #[serde(flatten)]
    pub clear: ClearPolicy,

    #[serde(rename = "ipv4Servers", alias = "ipv4", default)]
    pub ipv4_servers: Option<DnsServers>,

    #[serde(rename = "ipv6Servers", alias = "ipv6", default)]
    pub ipv6_servers: Option<DnsServers>,
}

/// Server list that only takes effect when `override` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsServers {
    #[serde(default)]
    pub servers: Vec<String>,

    #[serde(rename = "override", default)]
    pub is_override: bool,
}

impl DnsServers {
    /// Servers to install, if this push asks for a replacement.
    pub fn override_list(&self) -> Option<&[String]> {
        (self.is_override && !self.servers.is_empty()).then_some(self.servers.as_slice())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectCheckConfig {
    #[serde(default)]
    pub enable: Option<bool>,

    #[serde(rename = "timeoutMs", alias = "timeout_ms", default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub urls: Option<Vec<String>>,

    #[serde(rename = "override", default)]
    pub is_override: Option<bool>,

    #[serde(flatten)]
    pub clear: ClearPolicy,
}

impl ConnectCheckConfig {
    pub fn override_urls(&self) -> Option<&[String]> {
        match (&self.urls, self.is_override) {
            (Some(urls), Some(true)) if !urls.is_empty() => Some(urls.as_slice()),
            _ => None,
        }
    }
}

/// Per-user server config (`GET /v1/sdk/config/user`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUserConfig {
    #[serde(default = "default_config_ttl")]
    pub ttl: i64,

    #[serde(rename = "networkCheckEnable", alias = "network_check_enable", default)]
    pub network_check_enable: Option<bool>,

    #[serde(rename = "http3Enable", alias = "http3_enable", default)]
    pub http3_enable: Option<bool>,
}

/// A config document with its own validity window.
pub trait ConfigDocument: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Cache slot name, also used for the persisted file.
    const KIND: &'static str;

    fn ttl_secs(&self) -> i64;

    /// Decode a fetched document; malformed payloads fail closed.
    fn from_json(value: serde_json::Value) -> ResilienceResult<Self> {
        serde_json::from_value(value).map_err(|e| ResilienceError::InvalidDocument {
            message: format!("malformed {}: {}", Self::KIND, e),
        })
    }
}

impl ConfigDocument for ServerConfig {
    const KIND: &'static str = "server_config";

    fn ttl_secs(&self) -> i64 {
        self.ttl
    }
}

impl ConfigDocument for ServerUserConfig {
    const KIND: &'static str = "server_user_config";

    fn ttl_secs(&self) -> i64 {
        self.ttl
    }
}

/// A fetched document and the instant it was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot<T> {
    pub document: T,
    pub fetched_at: DateTime<Utc>,
}

impl<T: ConfigDocument> ConfigSnapshot<T> {
    pub fn new(document: T) -> Self {
        Self {
            document,
            fetched_at: Utc::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.document.ttl_secs() > (now - self.fetched_at).num_seconds()
    }
}

/// Client configuration for the resilience layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Config service hosts, tried in order.
    pub server_hosts: Vec<String>,

    /// Upload token used to authenticate config fetches.
    pub token: Option<String>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Retries per host for transient failures.
    pub max_retries: u32,

    /// Whether the server config monitor runs at all.
    pub monitor_enabled: bool,

    /// Checkpoint store root. `None` disables resumable-upload checkpoints.
    pub checkpoint_dir: Option<PathBuf>,

    /// Checkpoints older than this are discarded.
    pub checkpoint_max_age_secs: u64,

    /// Where fetched config snapshots are persisted. `None` keeps them in memory.
    pub config_cache_dir: Option<PathBuf>,

    /// Reported to the config service as `sdk_name`.
    pub sdk_name: String,
}

fn default_server_hosts() -> Vec<String> {
    vec![
        "https://uc.qiniuapi.com".to_string(),
        "https://kodo-config.qiniuapi.com".to_string(),
        "https://uc.qbox.me".to_string(),
    ]
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            server_hosts: default_server_hosts(),
            token: None,
            timeout_secs: 10,
            max_retries: 1,
            monitor_enabled: true,
            checkpoint_dir: None,
            checkpoint_max_age_secs: 2 * 24 * 60 * 60,
            config_cache_dir: None,
            sdk_name: "rust".to_string(),
        }
    }
}

impl ResilienceConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `UPLOAD_RESILIENCE_HOSTS` | Comma-separated config service hosts |
    /// | `UPLOAD_RESILIENCE_TOKEN` | Upload token |
    /// | `UPLOAD_RESILIENCE_TIMEOUT` | Request timeout in seconds |
    /// | `UPLOAD_RESILIENCE_MAX_RETRIES` | Retries per host |
    /// | `UPLOAD_RESILIENCE_MONITOR` | `0`/`false` disables the config monitor |
    /// | `UPLOAD_RESILIENCE_CHECKPOINT_DIR` | Checkpoint store root |
    /// | `UPLOAD_RESILIENCE_CONFIG_CACHE_DIR` | Persisted config snapshots |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_hosts: std::env::var("UPLOAD_RESILIENCE_HOSTS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(String::from)
                        .collect::<Vec<_>>()
                })
                .filter(|hosts| !hosts.is_empty())
                .unwrap_or(defaults.server_hosts),
            token: std::env::var("UPLOAD_RESILIENCE_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            timeout_secs: std::env::var("UPLOAD_RESILIENCE_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("UPLOAD_RESILIENCE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            monitor_enabled: std::env::var("UPLOAD_RESILIENCE_MONITOR")
                .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
                .unwrap_or(defaults.monitor_enabled),
            checkpoint_dir: std::env::var_os("UPLOAD_RESILIENCE_CHECKPOINT_DIR").map(PathBuf::from),
            checkpoint_max_age_secs: defaults.checkpoint_max_age_secs,
            config_cache_dir: std::env::var_os("UPLOAD_RESILIENCE_CONFIG_CACHE_DIR")
                .map(PathBuf::from),
            sdk_name: defaults.sdk_name,
        }
    }

    /// Parse a YAML config. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> ResilienceResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ResilienceError::Config {
            message: format!("invalid config: {}", e),
        })
    }

    pub fn from_yaml_file(path: &Path) -> ResilienceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ResilienceError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Set the token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the config service hosts.
    pub fn with_server_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_config_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_cache_dir = Some(dir.into());
        self
    }

    pub fn with_monitor_enabled(mut self, enabled: bool) -> Self {
        self.monitor_enabled = enabled;
        self
    }
}
