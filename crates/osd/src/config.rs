//! Engine configuration and storage directory descriptor.
//!
//! `EngineConfig` carries every tunable the engine reads. The storage
//! directory itself records which layout created it, so that a node
//! restarted with a different layout refuses to interpret the data.

use std::path::{Path, PathBuf};
use std::time::Duration;

use osd_proto::constants::LAYOUT_INFO_FILENAME;
use osd_proto::defaults::*;
use osd_proto::error::{OsdError, OsdResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::storage::common;

/// Tunables of one storage engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the object store.
    pub storage_dir: PathBuf,
    /// Layout name, see [`crate::storage::available_layouts`].
    pub layout: String,
    /// Store and verify a checksum per object version.
    pub checksums: bool,
    /// fsync object data before acknowledging writes.
    pub sync_writes: bool,
    /// Files whose metadata stays cached.
    pub metadata_cache_size: usize,
    /// Hash layout fan-out per directory level.
    pub subdirs: u32,
    /// Hash layout directory depth.
    pub max_dir_depth: u32,
    /// Lease granted when a caller does not ask for one.
    pub default_lease: Duration,
    /// Period of the open file table sweep.
    pub sweep_interval: Duration,
    /// Position of this node within the stripe of the files it stores.
    pub node_index: u32,
}

impl EngineConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            layout: DEFAULT_LAYOUT.to_string(),
            checksums: DEFAULT_CHECKSUMS_ENABLED,
            sync_writes: DEFAULT_SYNC_WRITES,
            metadata_cache_size: DEFAULT_METADATA_CACHE_SIZE,
            subdirs: DEFAULT_SUBDIRS,
            max_dir_depth: DEFAULT_MAX_DIR_DEPTH,
            default_lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            node_index: DEFAULT_NODE_INDEX,
        }
    }

    pub fn with_layout(mut self, layout: &str) -> Self {
        self.layout = layout.to_string();
        self
    }

    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }
}

/// Descriptor persisted at the root of a storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutInfo {
    pub name: String,
    pub tag: u32,
}

/// Load the layout descriptor of `dir`, `None` if the directory was never
/// initialized.
pub fn load_layout_info(dir: &Path) -> OsdResult<Option<LayoutInfo>> {
    let path = dir.join(LAYOUT_INFO_FILENAME);
    let data = match common::read_all(&path) {
        Ok(data) => data,
        Err(OsdError::NotFound) => return Ok(None),
        Err(e) => return Err(e),
    };
    bincode::deserialize(&data).map(Some).map_err(|_| {
        error!("corrupt layout descriptor: {}", path.display());
        OsdError::SystemError
    })
}

/// Check that `dir` was created by the layout `info` describes and
/// (re)write the descriptor.
pub fn ensure_layout_info(dir: &Path, info: &LayoutInfo) -> OsdResult<()> {
    if let Some(on_disk) = load_layout_info(dir)? {
        if on_disk.tag != info.tag {
            error!(
                "storage at {} was created by layout {} ({:#x}), not {} ({:#x})",
                dir.display(),
                on_disk.name,
                on_disk.tag,
                info.name,
                info.tag
            );
            return Err(OsdError::LayoutMismatch);
        }
    }
    let data = bincode::serialize(info).map_err(|_| OsdError::SystemError)?;
    common::atomic_write(&dir.join(LAYOUT_INFO_FILENAME), &data, true)?;
    debug!("layout descriptor {} written to {}", info.name, dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_info_roundtrip_and_mismatch() {
        let tmp = std::env::temp_dir().join("osd_test_layout_info");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        assert_eq!(load_layout_info(&tmp).unwrap(), None);

        let hash = LayoutInfo {
            name: "hash".into(),
            tag: 2,
        };
        ensure_layout_info(&tmp, &hash).unwrap();
        assert_eq!(load_layout_info(&tmp).unwrap(), Some(hash.clone()));
        ensure_layout_info(&tmp, &hash).unwrap();

        let single = LayoutInfo {
            name: "single".into(),
            tag: 3,
        };
        assert_eq!(
            ensure_layout_info(&tmp, &single),
            Err(OsdError::LayoutMismatch)
        );

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_config_builders() {
        let cfg = EngineConfig::new("/tmp/x")
            .with_layout("single")
            .with_checksums(true);
        assert_eq!(cfg.layout, "single");
        assert!(cfg.checksums);
        assert_eq!(cfg.subdirs, DEFAULT_SUBDIRS);
    }
}
