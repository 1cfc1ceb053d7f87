//! Latest fetched server config snapshots.
//!
//! Each slot holds an `Arc<ConfigSnapshot<_>>` behind a lock; a write swaps
//! the whole snapshot, so a reader sees either the old or the new document.
//!
//! With a directory attached, every write is mirrored to
//! `<dir>/<kind>.json` and the files are loaded back on construction.
//! Persistence is best effort: failures are logged, never returned.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::checkpoint::io::{remove_if_exists_impl, write_atomic_impl};
use crate::types::{ConfigDocument, ConfigSnapshot, ServerConfig, ServerUserConfig};

#[derive(Debug)]
struct Slot<T> {
    current: RwLock<Option<Arc<ConfigSnapshot<T>>>>,
    path: Option<PathBuf>,
}

impl<T: ConfigDocument> Slot<T> {
    fn new(dir: Option<&Path>) -> Self {
        let path = dir.map(|dir| dir.join(format!("{}.json", T::KIND)));
        let loaded = path.as_deref().and_then(load_snapshot::<T>);
        Self {
            current: RwLock::new(loaded.map(Arc::new)),
            path,
        }
    }

    fn get(&self) -> Option<Arc<ConfigSnapshot<T>>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn set(&self, snapshot: ConfigSnapshot<T>) -> Arc<ConfigSnapshot<T>> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));

        if let Some(path) = &self.path {
            match serde_json::to_vec(&*snapshot) {
                Ok(bytes) => {
                    if let Err(e) = write_atomic_impl(path, &bytes).await {
                        warn!(kind = T::KIND, path = %path.display(), error = %e, "failed to persist config");
                    }
                }
                Err(e) => warn!(kind = T::KIND, error = %e, "failed to serialize config"),
            }
        }
        snapshot
    }

    async fn clear(&self) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(path) = &self.path {
            if let Err(e) = remove_if_exists_impl(path).await {
                warn!(kind = T::KIND, path = %path.display(), error = %e, "failed to remove persisted config");
            }
        }
    }
}

fn load_snapshot<T: ConfigDocument>(path: &Path) -> Option<ConfigSnapshot<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(kind = T::KIND, path = %path.display(), error = %e, "failed to read persisted config");
            return None;
        }
    };

    match serde_json::from_slice::<ConfigSnapshot<T>>(&bytes) {
        Ok(snapshot) => {
            debug!(kind = T::KIND, fetched_at = %snapshot.fetched_at, "loaded persisted config");
            Some(snapshot)
        }
        Err(e) => {
            warn!(kind = T::KIND, error = %e, "ignoring corrupted persisted config");
            None
        }
    }
}

/// Primary and user config snapshots.
#[derive(Debug)]
pub struct ConfigCache {
    config: Slot<ServerConfig>,
    user_config: Slot<ServerUserConfig>,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ConfigCache {
    /// Cache without persistence.
    pub fn in_memory() -> Self {
        Self {
            config: Slot::new(None),
            user_config: Slot::new(None),
        }
    }

    /// Cache mirrored to `dir`. Previously persisted snapshots are loaded
    /// immediately, expired or not; callers check validity.
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            config: Slot::new(Some(dir)),
            user_config: Slot::new(Some(dir)),
        }
    }

    pub fn config(&self) -> Option<Arc<ConfigSnapshot<ServerConfig>>> {
        self.config.get()
    }

    pub fn user_config(&self) -> Option<Arc<ConfigSnapshot<ServerUserConfig>>> {
        self.user_config.get()
    }

    pub async fn set_config(
        &self,
        snapshot: ConfigSnapshot<ServerConfig>,
    ) -> Arc<ConfigSnapshot<ServerConfig>> {
        self.config.set(snapshot).await
    }

    pub async fn set_user_config(
        &self,
        snapshot: ConfigSnapshot<ServerUserConfig>,
    ) -> Arc<ConfigSnapshot<ServerUserConfig>> {
        self.user_config.set(snapshot).await
    }

    /// Drop both snapshots (and their files).
    pub async fn remove_cache(&self) {
        self.config.clear().await;
        self.user_config.clear().await;
        debug!("config cache cleared");
    }
}
