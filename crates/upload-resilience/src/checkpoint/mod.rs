//! Persistent resumable-upload checkpoints.
//!
//! One file per logical key, named by the lowercase hex SHA-256 of the key.
//! The file content is the raw progress blob and its modification time is
//! the staleness clock.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   3a7bd3e2360a3d29eea436fcfb7e44c735d117c42d1c1835420b6b9942dd4f1b
//!   ...
//! ```
//!
//! The store is a best-effort accelerator: write and delete failures are
//! logged and swallowed, read failures look like "no checkpoint". Only
//! provisioning the root is a hard error.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, warn};

use crate::digest::sha256_hex;
use crate::error::ResilienceResult;

pub(crate) mod io;
mod policy;

pub use policy::DEFAULT_MAX_AGE;

/// Directory-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    max_age: Duration,
}

impl CheckpointStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> ResilienceResult<Self> {
        let root = root.into();
        io::provision_root_impl(&root)?;
        Ok(Self {
            root,
            max_age: DEFAULT_MAX_AGE,
        })
    }

    /// Open the store under the user cache directory.
    ///
    /// Default: `<cache dir>/upload-resilience/checkpoints`
    pub fn with_default_dir() -> ResilienceResult<Self> {
        Self::open(io::default_checkpoint_dir_impl()?)
    }

    /// Override the staleness threshold.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Storage path for a logical key.
    pub fn slot_path(&self, key: &str) -> PathBuf {
        self.root.join(sha256_hex(key))
    }

    /// Store `data` as the whole content of `key`'s slot.
    pub async fn put(&self, key: &str, data: &[u8]) {
        let path = self.slot_path(key);
        match io::write_atomic_impl(&path, data).await {
            Ok(()) => debug!(key, bytes = data.len(), "checkpoint saved"),
            Err(e) => warn!(key, path = %path.display(), error = %e, "failed to save checkpoint"),
        }
    }

    /// Read `key`'s checkpoint.
    ///
    /// A slot older than the staleness threshold is deleted and reported as
    /// absent. An empty slot also reads as absent.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.slot_path(key);

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "no checkpoint");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "failed to stat checkpoint");
                return None;
            }
        };

        if self.is_stale(&metadata) {
            debug!(key, "checkpoint is stale, discarding");
            self.remove_slot(key, &path).await;
            return None;
        }

        match fs::read(&path).await {
            Ok(data) if data.is_empty() => None,
            Ok(data) => Some(data),
            Err(e) => {
                warn!(key, error = %e, "failed to read checkpoint");
                None
            }
        }
    }

    /// Remove `key`'s checkpoint if present.
    pub async fn delete(&self, key: &str) {
        let path = self.slot_path(key);
        self.remove_slot(key, &path).await;
    }

    /// Remove every slot and the root itself. A missing root is a no-op;
    /// the next `put` recreates it.
    pub async fn clear(&self) {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(root = %self.root.display(), "cleared checkpoints"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(root = %self.root.display(), error = %e, "failed to clear checkpoints"),
        }
    }

    /// Delete every stale slot. Returns how many were removed.
    pub async fn evict_stale(&self) -> usize {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(root = %self.root.display(), error = %e, "failed to scan checkpoints");
                }
                return 0;
            }
        };

        let mut evicted = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read checkpoint entry");
                    break;
                }
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };

            if self.is_stale(&metadata) {
                match io::remove_if_exists_impl(&entry.path()).await {
                    Ok(true) => evicted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to evict checkpoint"),
                }
            }
        }

        if evicted > 0 {
            debug!(evicted, "evicted stale checkpoints");
        }
        evicted
    }

    fn is_stale(&self, metadata: &std::fs::Metadata) -> bool {
        match metadata.modified() {
            Ok(modified) => policy::is_stale_impl(modified, SystemTime::now(), self.max_age),
            Err(_) => false,
        }
    }

    async fn remove_slot(&self, key: &str, path: &Path) {
        match io::remove_if_exists_impl(path).await {
            Ok(true) => debug!(key, "checkpoint removed"),
            Ok(false) => {}
            Err(e) => warn!(key, error = %e, "failed to remove checkpoint"),
        }
    }
}
