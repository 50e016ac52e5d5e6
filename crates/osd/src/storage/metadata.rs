//! In-memory metadata of one file on this node.
//!
//! Built by a layout's `load_file_metadata` from what is on disk and then
//! kept current by the write and truncate paths. Shared between requests
//! as [`SharedMetadata`]; the mutex is only held for bookkeeping, never
//! across disk I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use osd_proto::constants::NO_VERSION;
use osd_proto::striping::StripingPolicy;
use parking_lot::Mutex;

use crate::version_table::VersionTable;

/// Handle to the metadata of an open or cached file.
pub type SharedMetadata = Arc<Mutex<FileMetadata>>;

#[derive(Debug, Clone)]
pub struct FileMetadata {
    policy: StripingPolicy,
    file_size: u64,
    last_object: Option<u64>,
    truncate_epoch: u64,
    /// Version readers see for each object.
    latest_versions: BTreeMap<u64, u64>,
    /// Highest version ever stored per object, including preserved ones.
    largest_versions: BTreeMap<u64, u64>,
    /// Checksum per (object, version).
    checksums: HashMap<(u64, u64), u64>,
    version_table: VersionTable,
}

impl FileMetadata {
    pub fn new(policy: StripingPolicy, version_table: VersionTable) -> Self {
        Self {
            policy,
            file_size: 0,
            last_object: None,
            truncate_epoch: 0,
            latest_versions: BTreeMap::new(),
            largest_versions: BTreeMap::new(),
            checksums: HashMap::new(),
            version_table,
        }
    }

    pub fn into_shared(self) -> SharedMetadata {
        Arc::new(Mutex::new(self))
    }

    pub fn policy(&self) -> StripingPolicy {
        self.policy
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn set_file_size(&mut self, size: u64) {
        self.file_size = size;
    }

    /// Highest object number stored locally, `None` for an empty file.
    pub fn last_object(&self) -> Option<u64> {
        self.last_object
    }

    pub fn set_last_object(&mut self, obj_no: Option<u64>) {
        self.last_object = obj_no;
    }

    pub fn truncate_epoch(&self) -> u64 {
        self.truncate_epoch
    }

    pub fn set_truncate_epoch(&mut self, epoch: u64) {
        self.truncate_epoch = epoch;
    }

    pub fn latest_object_version(&self, obj_no: u64) -> u64 {
        self.latest_versions.get(&obj_no).copied().unwrap_or(NO_VERSION)
    }

    pub fn largest_object_version(&self, obj_no: u64) -> u64 {
        self.largest_versions.get(&obj_no).copied().unwrap_or(NO_VERSION)
    }

    /// Make `version` the current version of `obj_no`.
    pub fn update_object_version(&mut self, obj_no: u64, version: u64) {
        self.latest_versions.insert(obj_no, version);
        self.note_stored_version(obj_no, version);
    }

    /// Record that `version` of `obj_no` exists on disk without making it
    /// current.
    pub fn note_stored_version(&mut self, obj_no: u64, version: u64) {
        let largest = self.largest_versions.entry(obj_no).or_insert(version);
        if *largest < version {
            *largest = version;
        }
    }

    pub fn object_checksum(&self, obj_no: u64, version: u64) -> u64 {
        self.checksums.get(&(obj_no, version)).copied().unwrap_or(0)
    }

    pub fn set_object_checksum(&mut self, obj_no: u64, version: u64, checksum: u64) {
        self.checksums.insert((obj_no, version), checksum);
    }

    /// Forget `version` of `obj_no` after it was removed from disk.
    pub fn discard_object(&mut self, obj_no: u64, version: u64) {
        if self.latest_object_version(obj_no) == version {
            self.latest_versions.remove(&obj_no);
        }
        self.checksums.remove(&(obj_no, version));
    }

    /// Stop treating any version of `obj_no` as current while keeping what
    /// is known about its stored versions.
    pub fn drop_current_version(&mut self, obj_no: u64) {
        self.latest_versions.remove(&obj_no);
    }

    pub fn clear_latest_object_versions(&mut self) {
        self.latest_versions.clear();
    }

    /// Current `(object, version)` pairs in object order.
    pub fn latest_object_versions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.latest_versions.iter().map(|(&o, &v)| (o, v))
    }

    /// Current versions of every present object, keyed by object number.
    pub fn version_map(&self) -> BTreeMap<u64, u64> {
        self.latest_versions
            .iter()
            .filter(|(_, &ver)| ver != NO_VERSION)
            .map(|(&o, &v)| (o, v))
            .collect()
    }

    pub fn version_table(&self) -> &VersionTable {
        &self.version_table
    }

    pub fn version_table_mut(&mut self) -> &mut VersionTable {
        &mut self.version_table
    }
}
