//! Resilience layer for the object-storage upload client.
//!
//! This crate keeps the state an upload client needs to survive flaky
//! networks and a changing control plane:
//!
//! - Zone descriptors built from region topology documents, with TTLs
//! - A named periodic task scheduler with failure containment
//! - A server config monitor that polls the config service and applies
//!   pushed DNS, connectivity-check and HTTP/3 settings
//! - Versioned cache invalidation driven by per-group `clearId`s
//! - A file-per-key checkpoint store for resumable uploads
//!
//! # Quick Start
//!
//! ```no_run
//! use upload_resilience::{ClientContext, ResilienceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ResilienceConfig::from_env().with_token("upload-token");
//! let context = ClientContext::new(&config)?;
//!
//! // Settings follow server pushes from here on.
//! let settings = context.settings().snapshot();
//! println!("dns prefetch enabled: {}", settings.dns_enabled);
//!
//! if let Some(store) = context.checkpoints() {
//!     store.put("bucket:object.bin", b"{\"offset\":0}").await;
//! }
//!
//! context.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `UPLOAD_RESILIENCE_HOSTS` | Comma-separated config service hosts |
//! | `UPLOAD_RESILIENCE_TOKEN` | Upload token for config fetches |
//! | `UPLOAD_RESILIENCE_TIMEOUT` | Request timeout in seconds (default: 10) |
//! | `UPLOAD_RESILIENCE_MAX_RETRIES` | Retries per host for transient failures (default: 1) |
//! | `UPLOAD_RESILIENCE_MONITOR` | `0`/`false` disables the config monitor |
//! | `UPLOAD_RESILIENCE_CHECKPOINT_DIR` | Checkpoint store root |
//! | `UPLOAD_RESILIENCE_CONFIG_CACHE_DIR` | Directory for persisted config snapshots |

pub mod checkpoint;
pub mod client;
pub mod config_cache;
pub mod context;
mod digest;
pub mod error;
pub mod invalidation;
pub mod monitor;
pub mod scheduler;
pub mod settings;
pub mod types;
pub mod zone;

// Re-export main types
pub use checkpoint::{CheckpointStore, DEFAULT_MAX_AGE};
pub use client::{ConfigFetcher, HttpConfigFetcher, CLIENT_USER_AGENT};
pub use config_cache::ConfigCache;
pub use context::ClientContext;
pub use error::{ResilienceError, ResilienceResult};
pub use invalidation::{CacheInvalidator, FeatureGroup};
pub use monitor::{ClearLedger, ServerConfigMonitor, SERVER_CONFIG_TASK};
pub use scheduler::{JitterPolicy, PeriodicScheduler, TaskFuture};
pub use settings::{NetworkSettings, ServerList, SharedSettings};
pub use types::{
    ClearPolicy, ConfigDocument, ConfigSnapshot, ConnectCheckConfig, DnsConfig, DnsServers,
    RegionConfig, ResilienceConfig, ResolverConfig, ServerConfig, ServerUserConfig,
    DEFAULT_CONFIG_TTL_SECS,
};
pub use zone::{ZoneDescriptor, ZoneDirectory, LOCAL_ZONE_TTL_SECS, UNKNOWN_REGION_ID};
