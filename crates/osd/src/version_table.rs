//! Per-file snapshot index.
//!
//! A `VersionTable` maps a snapshot timestamp (milliseconds) to the versions
//! of the file's objects at that moment plus the file size. Object versions
//! are kept sparse, so a file with one far-away object costs one entry. Reading a
//! file "as of T" means looking up the latest entry at or before T and then
//! reading each object at the version recorded there.
//!
//! The table is persisted as one bincode blob and replaced atomically on
//! every save.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use osd_proto::constants::{NO_VERSION, VTABLE_MAGIC};
use osd_proto::error::{OsdError, OsdResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::storage::common;

/// One snapshot boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileVersion {
    /// Snapshot time in milliseconds. 0 for the empty version.
    pub timestamp: u64,
    /// Object number -> version. Objects without an entry were absent.
    pub object_versions: BTreeMap<u64, u64>,
    /// File size at the snapshot.
    pub file_size: u64,
}

static EMPTY_VERSION: FileVersion = FileVersion {
    timestamp: 0,
    object_versions: BTreeMap::new(),
    file_size: 0,
};

impl FileVersion {
    /// Version of `obj_no` in this snapshot, `NO_VERSION` if it was absent.
    pub fn object_version(&self, obj_no: u64) -> u64 {
        self.object_versions
            .get(&obj_no)
            .copied()
            .unwrap_or(NO_VERSION)
    }

    /// Number of objects present in the snapshot.
    pub fn object_count(&self) -> usize {
        self.object_versions.len()
    }
}

#[derive(Serialize, Deserialize)]
struct VersionTableFile {
    magic: u32,
    versions: Vec<FileVersion>,
}

/// Ordered timestamp -> version vector index for one file.
#[derive(Debug, Clone)]
pub struct VersionTable {
    path: PathBuf,
    versions: BTreeMap<u64, FileVersion>,
}

impl VersionTable {
    /// Create an empty table persisted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            versions: BTreeMap::new(),
        }
    }

    /// Backing file of this table.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a snapshot boundary. A second boundary with the same
    /// timestamp replaces the first.
    pub fn add_version(
        &mut self,
        timestamp: u64,
        mut object_versions: BTreeMap<u64, u64>,
        file_size: u64,
    ) {
        object_versions.retain(|_, ver| *ver != NO_VERSION);
        self.versions.insert(
            timestamp,
            FileVersion {
                timestamp,
                object_versions,
                file_size,
            },
        );
    }

    /// Latest boundary at or before `timestamp`, or the empty version when
    /// none exists.
    pub fn latest_version_before(&self, timestamp: u64) -> &FileVersion {
        self.versions
            .range(..=timestamp)
            .next_back()
            .map(|(_, v)| v)
            .unwrap_or(&EMPTY_VERSION)
    }

    /// Whether any boundary references version `version` of `obj_no`.
    pub fn is_contained(&self, obj_no: u64, version: u64) -> bool {
        version != NO_VERSION
            && self
                .versions
                .values()
                .any(|v| v.object_version(obj_no) == version)
    }

    /// Drop every boundary except those in `retained` and return the object
    /// versions that no remaining boundary references.
    ///
    /// The result maps object number to the set of released versions. The
    /// caller decides which of them may be deleted from disk.
    pub fn cleanup(&mut self, retained: &BTreeSet<u64>) -> BTreeMap<u64, BTreeSet<u64>> {
        let (kept, dropped): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.versions)
            .into_iter()
            .partition(|(ts, _)| retained.contains(ts));
        self.versions = kept;

        let mut released: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for version in dropped.values() {
            for (&obj_no, &ver) in &version.object_versions {
                if !self.is_contained(obj_no, ver) {
                    released.entry(obj_no).or_default().insert(ver);
                }
            }
        }
        released
    }

    /// All boundaries in timestamp order.
    pub fn versions(&self) -> impl Iterator<Item = &FileVersion> {
        self.versions.values()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Persist the whole table, replacing the previous file atomically.
    pub fn save(&self) -> OsdResult<()> {
        let file = VersionTableFile {
            magic: VTABLE_MAGIC,
            versions: self.versions.values().cloned().collect(),
        };
        let data = bincode::serialize(&file).map_err(|_| OsdError::SystemError)?;
        common::atomic_write(&self.path, &data, true)?;
        debug!(
            "saved version table {} ({} entries)",
            self.path.display(),
            self.versions.len()
        );
        Ok(())
    }

    /// Replace the in-memory state with the persisted table. A missing file
    /// loads as an empty table.
    pub fn load(&mut self) -> OsdResult<()> {
        let data = match common::read_all(&self.path) {
            Ok(data) => data,
            Err(OsdError::NotFound) => {
                self.versions.clear();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let file: VersionTableFile = bincode::deserialize(&data).map_err(|_| {
            error!("corrupt version table: {}", self.path.display());
            OsdError::SystemError
        })?;
        if file.magic != VTABLE_MAGIC {
            error!("bad version table magic: {}", self.path.display());
            return Err(OsdError::SystemError);
        }
        self.versions = file
            .versions
            .into_iter()
            .map(|v| (v.timestamp, v))
            .collect();
        Ok(())
    }

    /// Load the table at `path`, or an empty one if it was never saved.
    pub fn open(path: impl Into<PathBuf>) -> OsdResult<Self> {
        let mut table = Self::new(path);
        table.load()?;
        Ok(table)
    }
}
