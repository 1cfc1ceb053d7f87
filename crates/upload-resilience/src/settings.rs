//! Process-wide network settings, held as an explicit shared value.
//!
//! The monitor re-applies pushed config onto these settings every tick.
//! Writers build a new [`NetworkSettings`] and swap the `Arc`; readers keep
//! whatever snapshot they loaded, so a list is never observed half-written.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

const DEFAULT_UDP_DNS_IPV4_SERVERS: &[&str] =
    &["223.5.5.5", "114.114.114.114", "1.1.1.1", "8.8.8.8"];

const DEFAULT_DOH_IPV4_SERVERS: &[&str] =
    &["https://223.6.6.6/dns-query", "https://8.8.8.8/dns-query"];

const DEFAULT_CONNECT_CHECK_URLS: &[&str] = &[
    "https://www.qiniu.com",
    "https://www.baidu.com",
    "https://www.google.com",
];

/// A server/URL list with a caller override and a replaceable default.
///
/// Server pushes replace `default`; a caller-set `custom` list always wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerList {
    custom: Option<Arc<[String]>>,
    default: Arc<[String]>,
}

impl Default for ServerList {
    fn default() -> Self {
        Self {
            custom: None,
            default: Arc::from(Vec::new()),
        }
    }
}

impl ServerList {
    fn from_static(items: &[&str]) -> Self {
        Self {
            custom: None,
            default: items.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The list consumers should use.
    pub fn effective(&self) -> Arc<[String]> {
        self.custom
            .as_ref()
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    pub fn default_list(&self) -> &[String] {
        &self.default
    }

    pub fn custom_list(&self) -> Option<&[String]> {
        self.custom.as_deref()
    }

    /// Set or clear the caller override.
    pub fn set_custom(&mut self, servers: Option<Vec<String>>) {
        self.custom = servers.map(Into::into);
    }

    /// Replace the default list (server push).
    pub fn replace_default(&mut self, servers: Vec<String>) {
        self.default = servers.into();
    }
}

/// Snapshot of every process-wide knob the resilience layer maintains.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    /// DNS prefetching on/off.
    pub dns_enabled: bool,

    /// Prefetch attempts per host after a failure.
    pub dns_prefetch_retries: u32,

    pub dns_resolve_timeout: Duration,

    /// Default TTL for prefetched IPs when the resolver returns none.
    pub dns_cache_time: Duration,

    /// How long an expired prefetched IP may still be used.
    pub dns_cache_max_ttl: Duration,

    pub udp_dns_enabled: bool,
    pub udp_dns_ipv4_servers: ServerList,
    pub udp_dns_ipv6_servers: ServerList,

    pub doh_enabled: bool,
    pub doh_ipv4_servers: ServerList,
    pub doh_ipv6_servers: ServerList,

    /// Freeze time for a host that failed for every upload.
    pub global_host_frozen_time: Duration,

    /// Freeze time for a host that failed for the current upload only.
    pub partial_host_frozen_time: Duration,

    pub connect_check_enabled: bool,
    pub connect_check_timeout: Duration,
    pub connect_check_urls: ServerList,

    pub http3_enabled: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            dns_enabled: true,
            dns_prefetch_retries: 2,
            dns_resolve_timeout: Duration::from_secs(3),
            dns_cache_time: Duration::from_secs(120),
            dns_cache_max_ttl: Duration::from_secs(600),
            udp_dns_enabled: true,
            udp_dns_ipv4_servers: ServerList::from_static(DEFAULT_UDP_DNS_IPV4_SERVERS),
            udp_dns_ipv6_servers: ServerList::default(),
            doh_enabled: true,
            doh_ipv4_servers: ServerList::from_static(DEFAULT_DOH_IPV4_SERVERS),
            doh_ipv6_servers: ServerList::default(),
            global_host_frozen_time: Duration::from_secs(10),
            partial_host_frozen_time: Duration::from_secs(5 * 60),
            connect_check_enabled: true,
            connect_check_timeout: Duration::from_secs(2),
            connect_check_urls: ServerList::from_static(DEFAULT_CONNECT_CHECK_URLS),
            http3_enabled: false,
        }
    }
}

/// Cloneable handle to the current [`NetworkSettings`].
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<Arc<NetworkSettings>>>,
}

impl SharedSettings {
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<NetworkSettings> {
        let current = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    /// Copy-on-write update. The closure edits a private copy which then
    /// replaces the shared snapshot in one swap. Returns whether anything
    /// changed.
    pub fn update<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&mut NetworkSettings),
    {
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = NetworkSettings::clone(&current);
        edit(&mut next);
        if next == **current {
            return false;
        }
        *current = Arc::new(next);
        true
    }
}
