//! Filesystem helpers for checkpoint slots.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;

use crate::error::{ResilienceError, ResilienceResult};

pub(crate) fn default_checkpoint_dir_impl() -> ResilienceResult<PathBuf> {
    let base = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| ResilienceError::Checkpoint {
            message: "could not determine cache directory".to_string(),
        })?;

    Ok(base.join("upload-resilience").join("checkpoints"))
}

/// Create the store root, or confirm an existing path is a directory.
pub(crate) fn provision_root_impl(root: &Path) -> ResilienceResult<()> {
    if root.exists() {
        if !root.is_dir() {
            return Err(ResilienceError::Checkpoint {
                message: format!("{} exists and is not a directory", root.display()),
            });
        }
        return Ok(());
    }

    std::fs::create_dir_all(root).map_err(|e| ResilienceError::Checkpoint {
        message: format!("failed to create {}: {}", root.display(), e),
    })
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sibling temp path unique to this write: `.<name>.<pid>-<seq>.tmp`.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}-{}.tmp", name, std::process::id(), seq))
}

/// Write the whole slot through a temp file so readers never see a
/// truncated blob. Concurrent writers of one slot each use their own temp
/// file; the last rename wins.
pub(crate) async fn write_atomic_impl(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path);
    fs::write(&temp_path, data).await?;

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Remove a slot; a missing file is not an error.
pub(crate) async fn remove_if_exists_impl(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
