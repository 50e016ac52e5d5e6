//! Storage maintenance: snapshot pruning and crash debris removal.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use osd_proto::error::{OsdError, OsdResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::storage::common::run_blocking;
use crate::storage::{SharedMetadata, StorageLayout};

/// Outcome of pruning one file's snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub snapshots_dropped: usize,
    pub objects_deleted: usize,
}

/// Drop every snapshot of a file not listed in `retained` and delete the
/// object versions that only the dropped snapshots referenced.
///
/// Current object versions are never deleted. `object_lock` yields the lock
/// serializing access to one object of the file.
pub async fn prune_versions<F>(
    layout: &dyn StorageLayout,
    file_id: &str,
    md: &SharedMetadata,
    retained: &BTreeSet<u64>,
    object_lock: F,
) -> OsdResult<PruneReport>
where
    F: Fn(u64) -> Arc<RwLock<()>> + Send + Sync,
{
    let (released, table, dropped) = {
        let mut md = md.lock();
        let before = md.version_table().len();
        let released = md.version_table_mut().cleanup(retained);
        let dropped = before - md.version_table().len();
        (released, md.version_table().clone(), dropped)
    };
    if dropped == 0 {
        return Ok(PruneReport::default());
    }
    run_blocking(move || table.save()).await?;

    let mut report = PruneReport {
        snapshots_dropped: dropped,
        objects_deleted: 0,
    };
    for (obj_no, versions) in released {
        let lock = object_lock(obj_no);
        let _guard = lock.write().await;
        for version in versions {
            if md.lock().latest_object_version(obj_no) == version {
                continue;
            }
            layout.delete_object(file_id, md, obj_no, version).await?;
            report.objects_deleted += 1;
        }
    }

    info!(
        "cleanup: {} dropped {} snapshots, {} object versions",
        file_id, report.snapshots_dropped, report.objects_deleted
    );
    Ok(report)
}

/// Remove temporary files left behind by writes interrupted by a crash.
///
/// Must only run while no writes are in flight, i.e. before the engine
/// starts serving.
pub async fn remove_stale_tmp_files(base: &Path) -> OsdResult<usize> {
    let base = base.to_path_buf();
    let removed = run_blocking(move || {
        let mut removed = 0;
        let mut pending: Vec<PathBuf> = vec![base];
        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|e| {
                warn!("cleanup: failed to read dir {}: {}", dir.display(), e);
                OsdError::Eio
            })?;
            for entry in entries {
                let entry = entry.map_err(|_| OsdError::Eio)?;
                let path = entry.path();
                let file_type = entry.file_type().map_err(|_| OsdError::Eio)?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if entry.file_name().to_string_lossy().starts_with(".tmp_") {
                    debug!("cleanup: removing {}", path.display());
                    std::fs::remove_file(&path).map_err(|e| {
                        warn!("cleanup: failed to remove {}: {}", path.display(), e);
                        OsdError::Eio
                    })?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    })
    .await?;

    if removed > 0 {
        info!("cleanup: removed {} stale temporary files", removed);
    }
    Ok(removed)
}
