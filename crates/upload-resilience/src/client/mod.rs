//! Config service client.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ResilienceError, ResilienceResult};
use crate::types::ResilienceConfig;

mod http;

use http::HttpBackend;

pub const CLIENT_USER_AGENT: &str = concat!("upload-resilience/", env!("CARGO_PKG_VERSION"));

const CONFIG_PATH: &str = "/v1/sdk/config";
const USER_CONFIG_PATH: &str = "/v1/sdk/config/user";

/// Source of server-pushed config documents.
///
/// Token and hosts may be changed at any time; a fetch already in flight
/// keeps the values it started with.
#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    /// Fetch the primary config document.
    async fn fetch_config(&self) -> ResilienceResult<serde_json::Value>;

    /// Fetch the per-user config document.
    async fn fetch_user_config(&self) -> ResilienceResult<serde_json::Value>;

    fn set_token(&self, token: Option<String>);

    fn set_server_hosts(&self, hosts: Vec<String>);
}

/// HTTP implementation of [`ConfigFetcher`].
#[derive(Debug)]
pub struct HttpConfigFetcher {
    http: HttpBackend,
    sdk_name: String,
    token: RwLock<Option<Arc<str>>>,
    hosts: RwLock<Arc<[String]>>,
}

impl HttpConfigFetcher {
    pub fn new(config: &ResilienceConfig) -> ResilienceResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| ResilienceError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http: HttpBackend {
                client,
                max_retries: config.max_retries,
            },
            sdk_name: config.sdk_name.clone(),
            token: RwLock::new(config.token.as_deref().map(Arc::from)),
            hosts: RwLock::new(config.server_hosts.clone().into()),
        })
    }

    pub fn from_env() -> ResilienceResult<Self> {
        Self::new(&ResilienceConfig::from_env())
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_token().is_some()
    }

    pub fn server_hosts(&self) -> Arc<[String]> {
        Arc::clone(&self.hosts.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn current_token(&self) -> Option<Arc<str>> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn endpoint(&self, host: &str, path: &str) -> ResilienceResult<String> {
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };

        let mut url = Url::parse(base.trim_end_matches('/')).map_err(|e| ResilienceError::Config {
            message: format!("invalid config host {:?}: {}", host, e),
        })?;
        url.set_path(path);
        url.query_pairs_mut()
            .append_pair("sdk_name", &self.sdk_name)
            .append_pair("sdk_version", env!("CARGO_PKG_VERSION"));
        Ok(url.into())
    }

    /// Try each host in order; transient failures move on to the next host.
    async fn fetch_from_hosts(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> ResilienceResult<serde_json::Value> {
        let hosts = self.server_hosts();
        let mut last_error = ResilienceError::Config {
            message: "no config hosts configured".to_string(),
        };

        for host in hosts.iter() {
            let url = match self.endpoint(host, path) {
                Ok(url) => url,
                Err(e) => {
                    warn!(host = %host, error = %e, "skipping config host");
                    last_error = e;
                    continue;
                }
            };

            debug!(url = %url, "fetching server config");
            match self.http.get_json(&url, token).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(host = %host, error = %e, "config host failed, trying next");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl ConfigFetcher for HttpConfigFetcher {
    async fn fetch_config(&self) -> ResilienceResult<serde_json::Value> {
        let token = self.current_token();
        self.fetch_from_hosts(CONFIG_PATH, token.as_deref()).await
    }

    async fn fetch_user_config(&self) -> ResilienceResult<serde_json::Value> {
        let token = self.current_token().ok_or_else(|| ResilienceError::Config {
            message: "user config requires an upload token".to_string(),
        })?;
        self.fetch_from_hosts(USER_CONFIG_PATH, Some(&token)).await
    }

    fn set_token(&self, token: Option<String>) {
        let token = token.filter(|t| !t.is_empty()).map(Arc::from);
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn set_server_hosts(&self, hosts: Vec<String>) {
        let hosts: Vec<String> = hosts.into_iter().filter(|h| !h.trim().is_empty()).collect();
        if hosts.is_empty() {
            return;
        }
        *self.hosts.write().unwrap_or_else(PoisonError::into_inner) = hosts.into();
    }
}
