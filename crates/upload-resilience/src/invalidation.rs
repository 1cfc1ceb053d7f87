//! Downstream cache invalidation hooks.
//!
//! Pushed server configs carry a per-group `clearId`. When it advances and
//! `clearCache` is set, the monitor asks the cache registered for that group
//! to drop everything it holds.

use std::fmt;

/// Feature group of a pushed server config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureGroup {
    /// Region/zone topology.
    Region,
    /// DNS prefetching as a whole.
    Dns,
    /// UDP resolver.
    UdpDns,
    /// DNS-over-HTTPS resolver.
    DohDns,
    /// Connectivity check.
    ConnectCheck,
}

impl FeatureGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Region => "region",
            Self::Dns => "dns",
            Self::UdpDns => "dns.udp",
            Self::DohDns => "dns.doh",
            Self::ConnectCheck => "connect_check",
        }
    }
}

impl fmt::Display for FeatureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache that can be dropped wholesale when the control plane says so.
///
/// Implementations must tolerate being called from the scheduler's
/// runtime while readers are active.
pub trait CacheInvalidator: Send + Sync {
    /// Drop every cached entry. `group` is the feature group that triggered it.
    fn invalidate(&self, group: FeatureGroup);
}

impl<F> CacheInvalidator for F
where
    F: Fn(FeatureGroup) + Send + Sync,
{
    fn invalidate(&self, group: FeatureGroup) {
        self(group)
    }
}
