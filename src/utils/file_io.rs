use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::error;

use crate::Result;
use crate::StorageError;

pub fn create_parent_dir_if_not_exist(path: &Path) -> Result<()> {
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(parent_dir) {
                error!("Failed to create directory({:?}): {:?}", parent_dir, e);
                return Err(StorageError::IoError(e).into());
            }
        }
    }
    Ok(())
}

/// Atomic rename. The target is replaced if it already exists, so callers
/// must stage into a unique temporary path first.
pub(crate) async fn move_path(
    from: &Path,
    to: &Path,
) -> Result<()> {
    debug!(?from, ?to, "atomic rename");
    tokio::fs::rename(from, to).await.map_err(|e| {
        StorageError::PathError {
            path: PathBuf::from(from),
            source: e,
        }
        .into()
    })
}

/// Best-effort removal of a stale file or directory. Missing targets are
/// fine; other failures are logged and swallowed.
pub(crate) async fn remove_path_best_effort(path: &Path) {
    let result = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("Failed to remove {:?}: {:?}", path, e),
    }
}
