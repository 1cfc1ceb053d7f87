//! Server config monitor.
//!
//! One tick:
//! 1. nothing happens while the monitor is disabled;
//! 2. a missing or expired primary snapshot is re-fetched, applied and cached;
//! 3. a valid cached snapshot is re-applied as is, undoing any external reset;
//! 4. the user config goes through the same steps on its own TTL.
//!
//! Both documents are handled concurrently. Fetch and decode failures end
//! that document's tick; the previous snapshot stays in force.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::ConfigFetcher;
use crate::config_cache::ConfigCache;
use crate::error::ResilienceResult;
use crate::invalidation::{CacheInvalidator, FeatureGroup};
use crate::scheduler::{JitterPolicy, PeriodicScheduler};
use crate::settings::{NetworkSettings, ServerList, SharedSettings};
use crate::types::{ConfigDocument, ConfigSnapshot, DnsServers, ServerConfig, ServerUserConfig};

mod ledger;

pub use ledger::ClearLedger;

/// Scheduler task name of the config poll.
pub const SERVER_CONFIG_TASK: &str = "ServerConfig";

type Invalidator = Arc<dyn CacheInvalidator>;

struct MonitorInner {
    enabled: AtomicBool,
    cache: ConfigCache,
    fetcher: Arc<dyn ConfigFetcher>,
    settings: SharedSettings,
    ledger: ClearLedger,
    region_cache: RwLock<Option<Invalidator>>,
    dns_cache: RwLock<Option<Invalidator>>,
}

/// Polls the config service and keeps [`SharedSettings`] in line with it.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServerConfigMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for ServerConfigMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfigMonitor")
            .field("enabled", &self.is_enabled())
            .field("cache", &self.inner.cache)
            .field("ledger", &self.inner.ledger)
            .finish_non_exhaustive()
    }
}

impl ServerConfigMonitor {
    /// Build a monitor, enabled but not yet scheduled.
    ///
    /// The clear ledger starts from the ids of the persisted server config,
    /// if any, so a restart never replays a clear that already ran.
    pub fn new(fetcher: Arc<dyn ConfigFetcher>, settings: SharedSettings, cache: ConfigCache) -> Self {
        let ledger = ClearLedger::new();
        if let Some(snapshot) = cache.config() {
            ledger.seed(&snapshot.document);
        }
        Self {
            inner: Arc::new(MonitorInner {
                enabled: AtomicBool::new(true),
                cache,
                fetcher,
                settings,
                ledger,
                region_cache: RwLock::new(None),
                dns_cache: RwLock::new(None),
            }),
        }
    }

    /// Cache dropped when a `region` clear arrives.
    pub fn set_region_cache(&self, cache: Invalidator) {
        *self
            .inner
            .region_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(cache);
    }

    /// Cache dropped when a `dns`, `dns.udp` or `dns.doh` clear arrives.
    pub fn set_dns_cache(&self, cache: Invalidator) {
        *self
            .inner
            .dns_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(cache);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "server config monitor toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_token(&self, token: Option<String>) {
        self.inner.fetcher.set_token(token);
    }

    pub fn set_server_hosts(&self, hosts: Vec<String>) {
        self.inner.fetcher.set_server_hosts(hosts);
    }

    /// Forget both snapshots; the next tick fetches again.
    pub async fn remove_cache(&self) {
        self.inner.cache.remove_cache().await;
    }

    pub fn cache(&self) -> &ConfigCache {
        &self.inner.cache
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.inner.settings
    }

    pub fn ledger(&self) -> &ClearLedger {
        &self.inner.ledger
    }

    /// Register the poll task: first tick now, then every 120s plus up to
    /// 240s of jitter. Returns `false` if it was already running.
    pub fn start(&self, scheduler: &PeriodicScheduler) -> bool {
        let monitor = self.clone();
        scheduler.start(
            SERVER_CONFIG_TASK,
            Duration::ZERO,
            JitterPolicy::config_sync().sample(),
            move || {
                let monitor = monitor.clone();
                async move {
                    monitor.tick().await;
                    anyhow::Ok(())
                }
            },
        )
    }

    /// Cancel the poll task. A fetch already in flight still completes and
    /// is applied only if the monitor is enabled at that point.
    pub fn stop(&self, scheduler: &PeriodicScheduler) -> bool {
        scheduler.stop(SERVER_CONFIG_TASK) > 0
    }

    /// Run one sync round.
    pub async fn tick(&self) {
        if !self.is_enabled() {
            debug!("server config monitor disabled, skipping tick");
            return;
        }

        tokio::join!(self.sync_config(), self.sync_user_config());
    }

    async fn sync_config(&self) {
        if let Some(snapshot) = self.inner.cache.config().filter(|s| s.is_valid()) {
            debug!("reapplying cached server config");
            self.apply_config(&snapshot.document);
            return;
        }

        let fetched = self.inner.fetcher.fetch_config().await;
        match decode::<ServerConfig>(fetched) {
            Ok(config) => {
                if self.apply_config(&config) {
                    self.inner.cache.set_config(ConfigSnapshot::new(config)).await;
                }
            }
            Err(e) => warn!(error = %e, "server config fetch failed"),
        }
    }

    async fn sync_user_config(&self) {
        if let Some(snapshot) = self.inner.cache.user_config().filter(|s| s.is_valid()) {
            debug!("reapplying cached server user config");
            self.apply_user_config(&snapshot.document);
            return;
        }

        let fetched = self.inner.fetcher.fetch_user_config().await;
        match decode::<ServerUserConfig>(fetched) {
            Ok(config) => {
                if self.apply_user_config(&config) {
                    self.inner
                        .cache
                        .set_user_config(ConfigSnapshot::new(config))
                        .await;
                }
            }
            Err(e) => warn!(error = %e, "server user config fetch failed"),
        }
    }

    /// Apply a primary config to the shared settings and fire any due cache
    /// clears. Idempotent. Returns `false` (and touches nothing) while the
    /// monitor is disabled.
    pub fn apply_config(&self, config: &ServerConfig) -> bool {
        if !self.is_enabled() {
            debug!("monitor disabled, discarding server config");
            return false;
        }

        let clears: Vec<FeatureGroup> = ledger::clear_policies(config)
            .into_iter()
            .filter(|(group, policy)| {
                self.inner
                    .ledger
                    .observe(*group, policy.clear_id, policy.clear_cache)
            })
            .map(|(group, _)| group)
            .collect();

        let changed = self
            .inner
            .settings
            .update(|settings| apply_server_config(settings, config));
        if changed {
            info!("network settings updated from server config");
        }

        for group in clears {
            self.invalidate(group);
        }
        true
    }

    /// Apply a user config. Same contract as [`Self::apply_config`].
    pub fn apply_user_config(&self, config: &ServerUserConfig) -> bool {
        if !self.is_enabled() {
            debug!("monitor disabled, discarding server user config");
            return false;
        }

        let changed = self.inner.settings.update(|settings| {
            if let Some(enabled) = config.network_check_enable {
                settings.connect_check_enabled = enabled;
            }
            if let Some(enabled) = config.http3_enable {
                settings.http3_enabled = enabled;
            }
        });
        if changed {
            info!("network settings updated from server user config");
        }
        true
    }

    fn invalidate(&self, group: FeatureGroup) {
        let target = match group {
            FeatureGroup::Region => &self.inner.region_cache,
            FeatureGroup::Dns | FeatureGroup::UdpDns | FeatureGroup::DohDns => {
                &self.inner.dns_cache
            }
            FeatureGroup::ConnectCheck => {
                debug!(group = %group, "clear recorded, nothing to invalidate");
                return;
            }
        };

        let target = target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match target {
            Some(cache) => {
                info!(group = %group, clear_id = self.inner.ledger.last_applied(group), "clearing cache on server request");
                cache.invalidate(group);
            }
            None => debug!(group = %group, "no cache registered for clear"),
        }
    }
}

fn decode<T: ConfigDocument>(fetched: ResilienceResult<serde_json::Value>) -> ResilienceResult<T> {
    fetched.and_then(T::from_json)
}

fn apply_server_config(settings: &mut NetworkSettings, config: &ServerConfig) {
    if let Some(dns) = &config.dns {
        if let Some(enabled) = dns.enable {
            settings.dns_enabled = enabled;
        }

        if let Some(udp) = &dns.udp {
            if let Some(enabled) = udp.enable {
                settings.udp_dns_enabled = enabled;
            }
            override_servers(&mut settings.udp_dns_ipv4_servers, udp.ipv4_servers.as_ref());
            override_servers(&mut settings.udp_dns_ipv6_servers, udp.ipv6_servers.as_ref());
        }

        if let Some(doh) = &dns.doh {
            if let Some(enabled) = doh.enable {
                settings.doh_enabled = enabled;
            }
            override_servers(&mut settings.doh_ipv4_servers, doh.ipv4_servers.as_ref());
            override_servers(&mut settings.doh_ipv6_servers, doh.ipv6_servers.as_ref());
        }
    }

    if let Some(check) = &config.connect_check {
        if let Some(enabled) = check.enable {
            settings.connect_check_enabled = enabled;
        }
        if let Some(timeout_ms) = check.timeout_ms {
            settings.connect_check_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(urls) = check.override_urls() {
            settings.connect_check_urls.replace_default(urls.to_vec());
        }
    }
}

fn override_servers(list: &mut ServerList, pushed: Option<&DnsServers>) {
    if let Some(servers) = pushed.and_then(DnsServers::override_list) {
        list.replace_default(servers.to_vec());
    }
}
