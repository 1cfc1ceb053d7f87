//! Per-client owner of the resilience layer.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::client::{ConfigFetcher, HttpConfigFetcher};
use crate::config_cache::ConfigCache;
use crate::error::ResilienceResult;
use crate::invalidation::CacheInvalidator;
use crate::monitor::ServerConfigMonitor;
use crate::scheduler::PeriodicScheduler;
use crate::settings::SharedSettings;
use crate::types::ResilienceConfig;
use crate::zone::ZoneDirectory;

/// Everything one upload client shares across its uploads: settings, zone
/// descriptors, the config monitor and the checkpoint store.
///
/// Must be created inside a tokio runtime; background tasks run there.
#[derive(Debug)]
pub struct ClientContext {
    settings: SharedSettings,
    scheduler: PeriodicScheduler,
    zones: Arc<ZoneDirectory>,
    monitor: ServerConfigMonitor,
    checkpoints: Option<CheckpointStore>,
}

impl ClientContext {
    /// Build the context and, if enabled, start the config monitor.
    pub fn new(config: &ResilienceConfig) -> ResilienceResult<Self> {
        let fetcher: Arc<dyn ConfigFetcher> = Arc::new(HttpConfigFetcher::new(config)?);
        Self::with_fetcher(config, fetcher)
    }

    /// Same as [`Self::new`] with a caller-supplied fetcher.
    pub fn with_fetcher(
        config: &ResilienceConfig,
        fetcher: Arc<dyn ConfigFetcher>,
    ) -> ResilienceResult<Self> {
        let scheduler = PeriodicScheduler::current()?;
        let settings = SharedSettings::default();
        let zones = Arc::new(ZoneDirectory::new());

        let cache = match &config.config_cache_dir {
            Some(dir) => ConfigCache::with_dir(dir),
            None => ConfigCache::in_memory(),
        };
        let monitor = ServerConfigMonitor::new(fetcher, settings.clone(), cache);
        monitor.set_region_cache(Arc::clone(&zones) as Arc<dyn CacheInvalidator>);

        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => Some(
                CheckpointStore::open(dir)?
                    .with_max_age(Duration::from_secs(config.checkpoint_max_age_secs)),
            ),
            None => None,
        };

        monitor.set_enabled(config.monitor_enabled);
        if config.monitor_enabled {
            monitor.start(&scheduler);
        }

        info!(
            monitor = config.monitor_enabled,
            checkpoints = checkpoints.is_some(),
            "client context ready"
        );

        Ok(Self {
            settings,
            scheduler,
            zones,
            monitor,
            checkpoints,
        })
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &PeriodicScheduler {
        &self.scheduler
    }

    pub fn zones(&self) -> &Arc<ZoneDirectory> {
        &self.zones
    }

    pub fn monitor(&self) -> &ServerConfigMonitor {
        &self.monitor
    }

    pub fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }

    /// Route DNS-group clears to the embedder's resolver cache.
    pub fn set_dns_cache(&self, cache: Arc<dyn CacheInvalidator>) {
        self.monitor.set_dns_cache(cache);
    }

    /// Stop the monitor and every other scheduled task.
    pub fn shutdown(&self) {
        self.monitor.stop(&self.scheduler);
        self.monitor.set_enabled(false);
        self.scheduler.shutdown();
        info!("client context shut down");
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SERVER_CONFIG_TASK;
    use tempfile::TempDir;

    fn offline_config(temp_dir: &TempDir) -> ResilienceConfig {
        ResilienceConfig::default()
            .with_server_hosts(["http://127.0.0.1:9"])
            .with_checkpoint_dir(temp_dir.path().join("checkpoints"))
    }

    #[tokio::test]
    async fn test_new_wires_components() {
        let temp_dir = TempDir::new().unwrap();
        let context = ClientContext::new(&offline_config(&temp_dir)).unwrap();

        assert!(context.monitor().is_enabled());
        assert!(context.scheduler().is_active(SERVER_CONFIG_TASK));
        assert!(context.checkpoints().unwrap().root().is_dir());
        assert!(context.zones().is_empty());

        context.shutdown();
        assert!(context.scheduler().task_names().is_empty());
        assert!(!context.monitor().is_enabled());
    }

    #[tokio::test]
    async fn test_monitor_disabled_by_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = offline_config(&temp_dir).with_monitor_enabled(false);
        let context = ClientContext::new(&config).unwrap();

        assert!(!context.monitor().is_enabled());
        assert!(!context.scheduler().is_active(SERVER_CONFIG_TASK));
    }

    #[tokio::test]
    async fn test_bad_checkpoint_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("file");
        std::fs::write(&file_path, b"x").unwrap();

        let config = ResilienceConfig::default()
            .with_monitor_enabled(false)
            .with_checkpoint_dir(&file_path);
        assert!(ClientContext::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_dns_cache_receives_dns_clears() {
        use crate::invalidation::FeatureGroup;
        use crate::types::{ConfigDocument, ServerConfig};
        use std::sync::Mutex;

        let temp_dir = TempDir::new().unwrap();
        let config = offline_config(&temp_dir).with_monitor_enabled(false);
        let context = ClientContext::new(&config).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        context.set_dns_cache(Arc::new(move |group: FeatureGroup| {
            recorded.lock().unwrap().push(group);
        }));

        context.monitor().set_enabled(true);
        let push = ServerConfig::from_json(serde_json::json!({
            "dns": {"clearId": 1, "clearCache": true}
        }))
        .unwrap();
        context.monitor().apply_config(&push);

        assert_eq!(*seen.lock().unwrap(), vec![FeatureGroup::Dns]);
    }

    #[test]
    fn test_requires_runtime() {
        assert!(ClientContext::new(&ResilienceConfig::default().with_monitor_enabled(false)).is_err());
    }
}
