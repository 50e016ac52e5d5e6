//! Per-node object storage engine.
//!
//! `StorageEngine` is the single entry point the request layer calls. It
//! owns the storage layout, the open file table and the advisory lock table,
//! and implements the read, write and truncate paths on top of the layout's
//! per-object primitives:
//!
//! - object versions are chosen from the file's COW policy,
//! - holes below the last object read as padding,
//! - truncates carry an epoch and stale ones are rejected,
//! - closing a written, versioned file cuts a snapshot into its version
//!   table, and a delete of an open file waits for the close.
//!
//! Operations on one `(file_id, obj_no)` are serialized by a read-write lock
//! per object. A truncate rewrites many objects and the file's epoch, so it
//! also holds a per-file lock exclusively while reads and writes hold it
//! shared. Locks are always taken file first, then object.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use osd_proto::constants::{FULL_OBJECT_LENGTH, NO_VERSION};
use osd_proto::error::{OsdError, OsdResult};
use osd_proto::striping::StripingPolicy;
use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::cleanup::{self, PruneReport};
use crate::config::EngineConfig;
use crate::cow::{CowMode, CowPolicy};
use crate::locks::{AdvisoryLock, AdvisoryLockTable, LockHolder};
use crate::open_files::{OpenFileEntry, OpenFileTable};
use crate::storage::common::run_blocking;
use crate::storage::{self, ObjectInformation, SharedMetadata, StorageLayout};

/// Seconds since the Unix epoch; lease times use this clock.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the Unix epoch; version table keys use this clock.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a file left the open file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Explicit,
    Expired,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Explicit => f.write_str("closed"),
            CloseReason::Expired => f.write_str("expired"),
        }
    }
}

/// Report handed to the [`CloseListener`] for every closed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub file_id: String,
    /// File size as known to this node after the close.
    pub file_size: u64,
    pub reason: CloseReason,
    /// The file was deleted because deletion had been requested while open.
    pub deleted: bool,
}

/// Receives close events, e.g. to report final sizes to the metadata
/// service.
#[async_trait]
pub trait CloseListener: Send + Sync {
    async fn file_closed(&self, closed: ClosedFile);
}

/// Version selector for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadVersion {
    /// Current content.
    #[default]
    Latest,
    /// Content as of the latest snapshot at or before this time (ms).
    Snapshot(u64),
}

pub struct StorageEngine {
    config: EngineConfig,
    layout: Arc<dyn StorageLayout>,
    open_files: Mutex<OpenFileTable>,
    locks: AdvisoryLockTable,
    file_locks: DashMap<String, Arc<RwLock<()>>>,
    object_locks: DashMap<(String, u64), Arc<RwLock<()>>>,
    listener: Option<Arc<dyn CloseListener>>,
}

impl StorageEngine {
    /// Wrap an initialized layout.
    pub fn new(config: EngineConfig, layout: Arc<dyn StorageLayout>) -> Self {
        Self {
            config,
            layout,
            open_files: Mutex::new(OpenFileTable::new()),
            locks: AdvisoryLockTable::new(),
            file_locks: DashMap::new(),
            object_locks: DashMap::new(),
            listener: None,
        }
    }

    /// Build the configured layout, initialize it at the configured
    /// directory and wrap it.
    pub async fn open(config: EngineConfig, first_time: bool) -> OsdResult<Self> {
        let layout: Arc<dyn StorageLayout> = storage::get_layout(&config.layout, &config)
            .ok_or_else(|| {
                warn!("engine: unknown layout '{}'", config.layout);
                OsdError::InvalidParms
            })?
            .into();
        layout.init(&config.storage_dir, first_time).await?;
        info!(
            "engine: {} layout at {} (checksums {})",
            layout.name(),
            config.storage_dir.display(),
            config.checksums
        );
        Ok(Self::new(config, layout))
    }

    pub fn with_listener(mut self, listener: Arc<dyn CloseListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &dyn StorageLayout {
        self.layout.as_ref()
    }

    fn file_lock(&self, file_id: &str) -> Arc<RwLock<()>> {
        self.file_locks
            .entry(file_id.to_string())
            .or_default()
            .clone()
    }

    fn object_lock(&self, file_id: &str, obj_no: u64) -> Arc<RwLock<()>> {
        self.object_locks
            .entry((file_id.to_string(), obj_no))
            .or_default()
            .clone()
    }

    /// Forget the locks of a file that no request holds any more.
    fn drop_idle_locks(&self, file_id: &str) {
        self.file_locks
            .retain(|id, lock| id != file_id || Arc::strong_count(lock) > 1);
        self.object_locks
            .retain(|(id, _), lock| id != file_id || Arc::strong_count(lock) > 1);
    }

    async fn metadata(&self, file_id: &str, policy: StripingPolicy) -> OsdResult<SharedMetadata> {
        self.layout.get_file_metadata(policy, file_id).await
    }

    /// Metadata of a file being read or written. It stays pinned in the
    /// cache until the file is closed.
    async fn open_metadata(&self, file_id: &str, policy: StripingPolicy) -> OsdResult<SharedMetadata> {
        let md = self.layout.get_file_metadata(policy, file_id).await?;
        Ok(self.layout.metadata_cache().pin(file_id, md))
    }

    /// COW policy of an open file. Requests on a file that is not open open
    /// it implicitly with the default lease and no copy-on-write.
    fn touch(&self, file_id: &str, policy: StripingPolicy, write: bool) -> Arc<CowPolicy> {
        let expires = now_secs() + self.config.default_lease.as_secs();
        self.open_files
            .lock()
            .open_file(file_id, expires, CowPolicy::default(), policy, write)
    }

    fn is_local(&self, policy: &StripingPolicy, obj_no: u64) -> bool {
        policy.is_local_object(obj_no, self.config.node_index)
    }

    // ─── Request path ───────────────────────────────────────────────

    /// Read `length` bytes at `offset` of an object.
    ///
    /// An object that is missing but lies below the file's last object is
    /// a hole and reads as padding.
    pub async fn read(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        obj_no: u64,
        offset: u32,
        length: u32,
        version: ReadVersion,
    ) -> OsdResult<ObjectInformation> {
        self.touch(file_id, policy, false);
        let file_lock = self.file_lock(file_id);
        let _file_guard = file_lock.read().await;
        let md = self.open_metadata(file_id, policy).await?;
        let lock = self.object_lock(file_id, obj_no);
        let _guard = lock.read().await;

        let (obj_version, last_object) = {
            let md = md.lock();
            match version {
                ReadVersion::Latest => (md.latest_object_version(obj_no), md.last_object()),
                ReadVersion::Snapshot(ts) => {
                    let snapshot = md.version_table().latest_version_before(ts);
                    (
                        snapshot.object_version(obj_no),
                        policy.last_object(snapshot.file_size),
                    )
                }
            }
        };

        let info = self
            .layout
            .read_object(file_id, &md, obj_no, offset, length, obj_version)
            .await?;
        if info == ObjectInformation::DoesNotExist {
            if last_object.is_some_and(|last| obj_no < last) {
                debug!("engine: {} obj {} is a hole", file_id, obj_no);
                return Ok(ObjectInformation::Padding);
            }
            debug!("engine: {} obj {} v{} not found", file_id, obj_no, obj_version);
        }
        Ok(info)
    }

    /// Write `data` at `offset` into an object and return the file size
    /// known to this node afterwards.
    pub async fn write(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        obj_no: u64,
        offset: u32,
        data: &[u8],
        client_epoch: u64,
    ) -> OsdResult<u64> {
        let stripe_size = policy.stripe_size_for_object(obj_no) as u64;
        if offset as u64 + data.len() as u64 > stripe_size {
            return Err(OsdError::InvalidParms);
        }

        let cow = self.touch(file_id, policy, true);
        let file_lock = self.file_lock(file_id);
        let _file_guard = file_lock.read().await;
        let md = self.open_metadata(file_id, policy).await?;
        let lock = self.object_lock(file_id, obj_no);
        let _guard = lock.write().await;

        let (largest, last_object) = {
            let md = md.lock();
            if client_epoch < md.truncate_epoch() {
                debug!(
                    "engine: write to {} with epoch {} < {}",
                    file_id,
                    client_epoch,
                    md.truncate_epoch()
                );
                return Err(OsdError::StaleEpoch);
            }
            (md.largest_object_version(obj_no), md.last_object())
        };

        cow.init_cow_flags_if_required(last_object.map_or(0, |last| last + 1));
        let is_cow = cow.is_cow(obj_no);
        let new_version = if is_cow || self.config.checksums {
            largest + 1
        } else {
            largest.max(1)
        };

        self.layout
            .write_object(
                file_id,
                &md,
                data,
                obj_no,
                offset,
                new_version,
                self.config.sync_writes,
                is_cow,
            )
            .await?;
        if is_cow {
            cow.object_changed(obj_no);
        }

        let file_size = {
            let mut md = md.lock();
            let last = md.last_object();
            if last.map_or(true, |last| obj_no >= last) {
                md.set_last_object(Some(obj_no));
                let end = policy.object_start_offset(obj_no) + offset as u64 + data.len() as u64;
                if end > md.file_size() {
                    md.set_file_size(end);
                }
            }
            md.file_size()
        };
        self.open_files.lock().mark_written(file_id);
        debug!(
            "engine: wrote {} bytes to {} obj {} v{} (size {})",
            data.len(),
            file_id,
            obj_no,
            new_version,
            file_size
        );
        Ok(file_size)
    }

    /// Set the file to `new_size` bytes under truncate epoch `client_epoch`.
    ///
    /// An epoch below the recorded one is rejected; the recorded epoch
    /// itself means the truncate was already applied. Runs exclusively
    /// against every other request on the file.
    pub async fn truncate(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        new_size: u64,
        client_epoch: u64,
    ) -> OsdResult<()> {
        let cow = self.touch(file_id, policy, true);
        let file_lock = self.file_lock(file_id);
        let _file_guard = file_lock.write().await;
        let md = self.open_metadata(file_id, policy).await?;

        let (recorded, old_last) = {
            let md = md.lock();
            (md.truncate_epoch(), md.last_object())
        };
        if client_epoch < recorded {
            debug!(
                "engine: truncate of {} with epoch {} < {}",
                file_id, client_epoch, recorded
            );
            return Err(OsdError::StaleEpoch);
        }
        if client_epoch == recorded {
            debug!("engine: truncate epoch {} of {} already applied", client_epoch, file_id);
            return Ok(());
        }

        cow.init_cow_flags_if_required(old_last.map_or(0, |last| last + 1));
        let new_last = policy.last_object(new_size);

        match (old_last, new_last) {
            (_, None) => self.truncate_to_zero(file_id, &md, &cow).await?,
            (Some(old), Some(new)) if new < old => {
                self.shrink(file_id, &md, &cow, policy, old, new, new_size)
                    .await?
            }
            (old, Some(new)) => {
                self.extend(file_id, &md, &cow, policy, old, new, new_size)
                    .await?
            }
        }

        {
            let mut md = md.lock();
            md.set_file_size(new_size);
            md.set_last_object(new_last);
            md.set_truncate_epoch(client_epoch);
        }
        self.layout.set_truncate_epoch(file_id, client_epoch).await?;
        self.layout
            .update_current_version_size(file_id, new_last)
            .await?;
        self.open_files.lock().mark_written(file_id);
        info!(
            "engine: truncated {} to {} (epoch {})",
            file_id, new_size, client_epoch
        );
        Ok(())
    }

    /// Version to give `obj_no` when truncating it.
    fn truncate_version(md: &SharedMetadata, cow: &CowPolicy, obj_no: u64) -> (u64, bool) {
        let md = md.lock();
        let is_cow = cow.is_cow(obj_no);
        let version = if is_cow {
            md.largest_object_version(obj_no) + 1
        } else {
            md.latest_object_version(obj_no).max(1)
        };
        (version, is_cow)
    }

    /// Version for a new padding object.
    fn padding_version(md: &SharedMetadata, cow: &CowPolicy, obj_no: u64) -> u64 {
        let largest = md.lock().largest_object_version(obj_no);
        if cow.is_cow(obj_no) {
            largest + 1
        } else {
            largest.max(1)
        }
    }

    async fn truncate_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        cow: &CowPolicy,
        obj_no: u64,
        new_length: u32,
    ) -> OsdResult<()> {
        let lock = self.object_lock(file_id, obj_no);
        let _guard = lock.write().await;
        let (version, is_cow) = Self::truncate_version(md, cow, obj_no);
        self.layout
            .truncate_object(file_id, md, obj_no, new_length, version, is_cow)
            .await?;
        if is_cow {
            cow.object_changed(obj_no);
        }
        Ok(())
    }

    /// Remove the current version of `obj_no`, keeping it on disk when a
    /// snapshot still refers to it.
    async fn remove_current(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        cow: &CowPolicy,
        obj_no: u64,
    ) -> OsdResult<()> {
        let lock = self.object_lock(file_id, obj_no);
        let _guard = lock.write().await;
        let (version, in_snapshot) = {
            let md = md.lock();
            let version = md.latest_object_version(obj_no);
            (version, md.version_table().is_contained(obj_no, version))
        };
        if version == NO_VERSION {
            return Ok(());
        }
        if cow.cow_enabled() && in_snapshot {
            self.layout
                .update_current_obj_version(file_id, md, obj_no, NO_VERSION)
                .await?;
            md.lock().drop_current_version(obj_no);
        } else {
            self.layout.delete_object(file_id, md, obj_no, version).await?;
        }
        Ok(())
    }

    async fn truncate_to_zero(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        cow: &CowPolicy,
    ) -> OsdResult<()> {
        if cow.cow_enabled() {
            let objects: Vec<u64> = md.lock().latest_object_versions().map(|(o, _)| o).collect();
            for obj_no in objects {
                self.remove_current(file_id, md, cow, obj_no).await?;
            }
        } else {
            self.layout.delete_file(file_id, false).await?;
        }
        md.lock().clear_latest_object_versions();
        Ok(())
    }

    /// Make sure the local object of `obj_no`'s row exists when it lies
    /// before `obj_no`, so the row's size is known locally.
    async fn pad_row(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        cow: &CowPolicy,
        policy: StripingPolicy,
        obj_no: u64,
    ) -> OsdResult<()> {
        let local = policy.object_in_row(policy.row(obj_no), self.config.node_index);
        if local >= obj_no || md.lock().latest_object_version(local) != NO_VERSION {
            return Ok(());
        }
        let lock = self.object_lock(file_id, local);
        let _guard = lock.write().await;
        let version = Self::padding_version(md, cow, local);
        self.layout
            .create_padding_object(
                file_id,
                md,
                local,
                version,
                policy.stripe_size_for_object(local),
            )
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn shrink(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        cow: &CowPolicy,
        policy: StripingPolicy,
        old_last: u64,
        new_last: u64,
        new_size: u64,
    ) -> OsdResult<()> {
        // local objects past the new end, newest row first
        let node = self.config.node_index;
        for row in (policy.row(new_last)..=policy.row(old_last)).rev() {
            let obj_no = policy.object_in_row(row, node);
            if obj_no > new_last {
                self.remove_current(file_id, md, cow, obj_no).await?;
            }
        }

        if self.is_local(&policy, new_last) {
            let length = new_size - policy.object_start_offset(new_last);
            self.truncate_object(file_id, md, cow, new_last, length as u32)
                .await?;
        } else {
            self.pad_row(file_id, md, cow, policy, new_last).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn extend(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        cow: &CowPolicy,
        policy: StripingPolicy,
        old_last: Option<u64>,
        new_last: u64,
        new_size: u64,
    ) -> OsdResult<()> {
        let new_length = (new_size - policy.object_start_offset(new_last)) as u32;

        if old_last == Some(new_last) {
            if self.is_local(&policy, new_last) {
                self.truncate_object(file_id, md, cow, new_last, new_length)
                    .await?;
            }
            return Ok(());
        }

        // the old last object becomes a full inner object
        if let Some(old) = old_last {
            let exists = md.lock().latest_object_version(old) != NO_VERSION;
            if exists && self.is_local(&policy, old) {
                let full = policy.stripe_size_for_object(old);
                self.truncate_object(file_id, md, cow, old, full).await?;
            }
        }

        if self.is_local(&policy, new_last) {
            let lock = self.object_lock(file_id, new_last);
            let _guard = lock.write().await;
            let version = Self::padding_version(md, cow, new_last);
            self.layout
                .create_padding_object(file_id, md, new_last, version, new_length)
                .await?;
        } else {
            self.pad_row(file_id, md, cow, policy, new_last).await?;
        }
        Ok(())
    }

    /// Size of the file now, or as of a snapshot.
    pub async fn file_size(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        version: ReadVersion,
    ) -> OsdResult<u64> {
        let md = self.metadata(file_id, policy).await?;
        let md = md.lock();
        Ok(match version {
            ReadVersion::Latest => md.file_size(),
            ReadVersion::Snapshot(ts) => md.version_table().latest_version_before(ts).file_size,
        })
    }

    /// Delete a file. While the file is open the deletion is only recorded
    /// and happens on close; returns false in that case.
    pub async fn delete_file(&self, file_id: &str) -> OsdResult<bool> {
        let expired = {
            let mut table = self.open_files.lock();
            if !table.is_closed(file_id, now_secs()) && table.set_delete_on_close(file_id) {
                info!("engine: {} is open, deleting on close", file_id);
                return Ok(false);
            }
            // lease ran out, but no sweep has closed the file yet
            table.close(file_id)
        };
        match expired {
            Some(mut entry) => {
                entry.delete_on_close = true;
                self.finish_close(entry, CloseReason::Expired).await?;
            }
            None => self.remove_file(file_id).await?,
        }
        Ok(true)
    }

    async fn remove_file(&self, file_id: &str) -> OsdResult<()> {
        self.layout.delete_file(file_id, true).await?;
        self.drop_idle_locks(file_id);
        info!("engine: deleted {}", file_id);
        Ok(())
    }

    // ─── Open file lifecycle ────────────────────────────────────────

    /// Open a file for `lease` with copy-on-write `mode`. Opening an open
    /// file refreshes its lease and keeps its COW state.
    pub fn open_file(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        lease: Duration,
        write: bool,
        mode: CowMode,
    ) -> Arc<CowPolicy> {
        let expires = now_secs() + lease.as_secs();
        self.open_files
            .lock()
            .open_file(file_id, expires, CowPolicy::new(mode), policy, write)
    }

    /// Extend the lease of an open file.
    pub fn keep_open(&self, file_id: &str, lease: Duration) -> OsdResult<()> {
        let expires = now_secs() + lease.as_secs();
        self.open_files
            .lock()
            .refresh(file_id, expires, false)
            .map(|_| ())
            .ok_or(OsdError::NotOpen)
    }

    pub fn is_open(&self, file_id: &str) -> bool {
        !self.open_files.lock().is_closed(file_id, now_secs())
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.lock().len()
    }

    /// Close a file explicitly.
    pub async fn close(&self, file_id: &str) -> OsdResult<ClosedFile> {
        let entry = self.open_files.lock().close(file_id).ok_or(OsdError::NotOpen)?;
        self.finish_close(entry, CloseReason::Explicit).await
    }

    /// Close every file whose lease ended before `now` (seconds). Returns
    /// the closed files.
    pub async fn sweep(&self, now: u64) -> Vec<ClosedFile> {
        let expired = self.open_files.lock().clean(now);
        let mut closed = Vec::with_capacity(expired.len());
        for entry in expired {
            let file_id = entry.file_id.clone();
            match self.finish_close(entry, CloseReason::Expired).await {
                Ok(report) => closed.push(report),
                Err(e) => warn!("engine: closing expired {} failed: {}", file_id, e),
            }
        }
        closed
    }

    /// Act on a file that has left the open file table.
    async fn finish_close(&self, entry: OpenFileEntry, reason: CloseReason) -> OsdResult<ClosedFile> {
        let file_id = entry.file_id.clone();
        let released = self.locks.release_file(&file_id);
        if released > 0 {
            debug!("engine: released {} locks on {}", released, file_id);
        }

        let (deleted, file_size) = if entry.delete_on_close {
            self.remove_file(&file_id).await?;
            (true, 0)
        } else {
            if entry.written && entry.cow.cow_enabled() {
                self.create_file_version(&file_id, entry.policy, now_millis())
                    .await?;
            }
            let size = self.file_size(&file_id, entry.policy, ReadVersion::Latest).await?;
            self.layout.metadata_cache().unpin(&file_id);
            self.drop_idle_locks(&file_id);
            (false, size)
        };

        let closed = ClosedFile {
            file_id,
            file_size,
            reason,
            deleted,
        };
        debug!("engine: {} {} (size {})", closed.file_id, reason, file_size);
        if let Some(listener) = &self.listener {
            listener.file_closed(closed.clone()).await;
        }
        Ok(closed)
    }

    // ─── Versions ───────────────────────────────────────────────────

    /// Record the current object versions and size as a snapshot at
    /// `timestamp` (ms) and persist the version table.
    pub async fn create_file_version(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        timestamp: u64,
    ) -> OsdResult<()> {
        let md = self.metadata(file_id, policy).await?;
        let table = {
            let mut md = md.lock();
            let versions = md.version_map();
            let size = md.file_size();
            md.version_table_mut().add_version(timestamp, versions, size);
            md.version_table().clone()
        };
        run_blocking(move || table.save()).await?;
        debug!("engine: cut version {} of {}", timestamp, file_id);
        Ok(())
    }

    /// Drop every snapshot not in `retained` and delete the object versions
    /// only they referenced.
    pub async fn cleanup_versions(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        retained: &BTreeSet<u64>,
    ) -> OsdResult<PruneReport> {
        let file_lock = self.file_lock(file_id);
        let _file_guard = file_lock.read().await;
        let md = self.metadata(file_id, policy).await?;
        cleanup::prune_versions(self.layout.as_ref(), file_id, &md, retained, |obj_no| {
            self.object_lock(file_id, obj_no)
        })
        .await
    }

    // ─── Scans ──────────────────────────────────────────────────────

    pub async fn object_set(&self, file_id: &str, policy: StripingPolicy) -> OsdResult<BTreeSet<u64>> {
        let md = self.metadata(file_id, policy).await?;
        self.layout.get_object_set(file_id, &md).await
    }

    pub async fn file_id_list(&self) -> OsdResult<Vec<String>> {
        self.layout.get_file_id_list().await
    }

    // ─── Advisory locks ─────────────────────────────────────────────

    /// Acquire an advisory lock and record the holder's lease on the open
    /// file.
    pub fn lock(&self, file_id: &str, request: AdvisoryLock) -> OsdResult<AdvisoryLock> {
        let granted = self.locks.acquire(file_id, request)?;
        let expires = now_secs() + self.config.default_lease.as_secs();
        self.open_files
            .lock()
            .add_client_lease(file_id, &granted.holder.client_uuid, expires);
        Ok(granted)
    }

    pub fn check_lock(&self, file_id: &str, candidate: &AdvisoryLock) -> AdvisoryLock {
        self.locks.check(file_id, candidate)
    }

    pub fn unlock(&self, file_id: &str, holder: &LockHolder) -> Option<AdvisoryLock> {
        self.locks.release(file_id, holder)
    }

    pub fn locks(&self, file_id: &str) -> Vec<AdvisoryLock> {
        self.locks.locks(file_id)
    }

    /// Read a whole object as bytes, zero-filling padding to the object's
    /// full stripe. Missing objects yield `None`.
    pub async fn read_full_object(
        &self,
        file_id: &str,
        policy: StripingPolicy,
        obj_no: u64,
        version: ReadVersion,
    ) -> OsdResult<Option<Vec<u8>>> {
        let info = self
            .read(file_id, policy, obj_no, 0, FULL_OBJECT_LENGTH, version)
            .await?;
        Ok(match info {
            ObjectInformation::DoesNotExist => None,
            ObjectInformation::Padding => {
                Some(vec![0; policy.stripe_size_for_object(obj_no) as usize])
            }
            ObjectInformation::Exists(data) => Some(data),
        })
    }
}

/// Close expired files every `interval` until `shutdown` fires.
pub async fn run_sweep_loop(
    engine: Arc<StorageEngine>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    info!("engine: starting lease sweep (interval={:?})", interval);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let closed = engine.sweep(now_secs()).await;
                if !closed.is_empty() {
                    info!("engine: sweep closed {} files", closed.len());
                }
            }
            _ = shutdown.notified() => {
                info!("engine: lease sweep shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const STRIPE: u32 = 4096;

    fn policy() -> StripingPolicy {
        StripingPolicy::new(STRIPE, 1).unwrap()
    }

    async fn engine(name: &str, layout: &str) -> (StorageEngine, PathBuf) {
        engine_with(name, layout, |_| {}).await
    }

    async fn engine_with(
        name: &str,
        layout: &str,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> (StorageEngine, PathBuf) {
        let tmp = std::env::temp_dir().join(format!("osd_test_engine_{}_{}", name, layout));
        let _ = std::fs::remove_dir_all(&tmp);
        let mut cfg = EngineConfig::new(&tmp).with_layout(layout);
        configure(&mut cfg);
        (StorageEngine::open(cfg, true).await.unwrap(), tmp)
    }

    fn wide() -> StripingPolicy {
        StripingPolicy::new(STRIPE, 2).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        closed: Mutex<Vec<ClosedFile>>,
    }

    #[async_trait]
    impl CloseListener for Recorder {
        async fn file_closed(&self, closed: ClosedFile) {
            self.closed.lock().push(closed);
        }
    }

    #[tokio::test]
    async fn test_sparse_object_reads_as_padding() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("sparse", layout).await;
            engine.write("f", policy(), 0, 0, b"zero", 0).await.unwrap();
            engine.write("f", policy(), 3, 0, b"three", 0).await.unwrap();

            let hole = engine
                .read("f", policy(), 1, 0, FULL_OBJECT_LENGTH, ReadVersion::Latest)
                .await
                .unwrap();
            assert!(matches!(
                hole,
                ObjectInformation::Padding | ObjectInformation::DoesNotExist
            ));
            assert!(hole.into_padded(STRIPE as usize).iter().all(|&b| b == 0));

            // beyond the last object nothing exists
            let past = engine
                .read("f", policy(), 4, 0, FULL_OBJECT_LENGTH, ReadVersion::Latest)
                .await
                .unwrap();
            assert_eq!(past, ObjectInformation::DoesNotExist);

            let size = engine
                .file_size("f", policy(), ReadVersion::Latest)
                .await
                .unwrap();
            assert_eq!(size, 3 * STRIPE as u64 + 5);

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_truncate_extend_then_read() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("extend", layout).await;
            let original: Vec<u8> = (1..=64).collect();
            engine.write("f", policy(), 0, 0, &original, 0).await.unwrap();

            engine.truncate("f", policy(), 32, 1).await.unwrap();
            engine.truncate("f", policy(), 64, 2).await.unwrap();

            let data = engine
                .read("f", policy(), 0, 0, FULL_OBJECT_LENGTH, ReadVersion::Latest)
                .await
                .unwrap()
                .into_padded(64);
            assert_eq!(&data[..32], &original[..32]);
            assert!(data[32..64].iter().all(|&b| b == 0));

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_truncate_across_objects() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("across", layout).await;
            let p = policy();
            engine.write("f", p, 0, 0, b"abc", 0).await.unwrap();

            // extend to the middle of object 2
            engine.truncate("f", p, 2 * STRIPE as u64 + 10, 1).await.unwrap();
            let obj0 = engine.read_full_object("f", p, 0, ReadVersion::Latest).await.unwrap().unwrap();
            assert_eq!(obj0.len(), STRIPE as usize);
            assert_eq!(&obj0[..3], b"abc");
            let obj1 = engine.read_full_object("f", p, 1, ReadVersion::Latest).await.unwrap().unwrap();
            assert!(obj1.iter().all(|&b| b == 0));
            let obj2 = engine.read_full_object("f", p, 2, ReadVersion::Latest).await.unwrap().unwrap();
            assert_eq!(obj2, vec![0; 10]);

            // shrink back into object 0
            engine.truncate("f", p, 2, 2).await.unwrap();
            assert_eq!(
                engine.read_full_object("f", p, 2, ReadVersion::Latest).await.unwrap(),
                None
            );
            let obj0 = engine.read_full_object("f", p, 0, ReadVersion::Latest).await.unwrap().unwrap();
            assert_eq!(obj0, b"ab");
            assert_eq!(engine.object_set("f", p).await.unwrap(), BTreeSet::from([0]));

            // truncate to zero
            engine.truncate("f", p, 0, 3).await.unwrap();
            assert_eq!(engine.file_size("f", p, ReadVersion::Latest).await.unwrap(), 0);
            assert!(engine.object_set("f", p).await.unwrap().is_empty());

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_stale_epoch_rejected() {
        let (engine, tmp) = engine("epoch", "hash").await;
        engine.write("f", policy(), 0, 0, b"data", 0).await.unwrap();
        engine.truncate("f", policy(), 2, 5).await.unwrap();

        assert_eq!(
            engine.write("f", policy(), 0, 0, b"x", 4).await,
            Err(OsdError::StaleEpoch)
        );
        assert_eq!(
            engine.truncate("f", policy(), 100, 3).await,
            Err(OsdError::StaleEpoch)
        );
        // same epoch again is a no-op
        engine.truncate("f", policy(), 100, 5).await.unwrap();
        assert_eq!(
            engine.file_size("f", policy(), ReadVersion::Latest).await.unwrap(),
            2
        );
        engine.write("f", policy(), 0, 0, b"y", 5).await.unwrap();

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_write_beyond_stripe_rejected() {
        let (engine, tmp) = engine("bounds", "hash").await;
        assert_eq!(
            engine.write("f", policy(), 0, STRIPE - 1, b"xy", 0).await,
            Err(OsdError::InvalidParms)
        );
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_delete_on_close() {
        let (engine, tmp) = engine("doc", "hash").await;
        let recorder = Arc::new(Recorder::default());
        let engine = engine.with_listener(recorder.clone());

        engine.open_file("f", policy(), Duration::from_secs(60), true, CowMode::NoCow);
        engine.write("f", policy(), 0, 0, b"data", 0).await.unwrap();

        assert!(!engine.delete_file("f").await.unwrap());
        assert!(engine.layout().file_exists("f").await.unwrap());

        let closed = engine.close("f").await.unwrap();
        assert!(closed.deleted);
        assert!(!engine.layout().file_exists("f").await.unwrap());
        assert_eq!(recorder.closed.lock().len(), 1);
        assert_eq!(engine.close("f").await, Err(OsdError::NotOpen));

        // a closed file is deleted right away
        engine.write("g", policy(), 0, 0, b"data", 0).await.unwrap();
        engine.close("g").await.unwrap();
        assert!(engine.delete_file("g").await.unwrap());
        assert!(!engine.layout().file_exists("g").await.unwrap());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_snapshot_read_after_close() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("snapshot", layout).await;
            let p = policy();

            engine.open_file("f", p, Duration::from_secs(60), true, CowMode::AlwaysCow);
            engine.write("f", p, 0, 0, b"first", 0).await.unwrap();
            engine.close("f").await.unwrap();
            let cut = now_millis();

            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.open_file("f", p, Duration::from_secs(60), true, CowMode::AlwaysCow);
            engine.write("f", p, 0, 0, b"SECOND!", 0).await.unwrap();

            let now = engine
                .read("f", p, 0, 0, FULL_OBJECT_LENGTH, ReadVersion::Latest)
                .await
                .unwrap();
            assert_eq!(now.data(), b"SECOND!");
            let then = engine
                .read("f", p, 0, 0, FULL_OBJECT_LENGTH, ReadVersion::Snapshot(cut))
                .await
                .unwrap();
            assert_eq!(then.data(), b"first");
            assert_eq!(
                engine.file_size("f", p, ReadVersion::Snapshot(cut)).await.unwrap(),
                5
            );
            // nothing existed before the first cut
            let before = engine
                .read("f", p, 0, 0, FULL_OBJECT_LENGTH, ReadVersion::Snapshot(1))
                .await
                .unwrap();
            assert_eq!(before, ObjectInformation::DoesNotExist);

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_cow_once_preserves_first_write_only() {
        let (engine, tmp) = engine("once", "hash").await;
        let p = policy();
        engine.write("f", p, 0, 0, b"base", 0).await.unwrap();
        engine.close("f").await.unwrap();

        engine.open_file("f", p, Duration::from_secs(60), true, CowMode::CowOnce);
        engine.write("f", p, 0, 0, b"one", 0).await.unwrap();
        engine.write("f", p, 0, 0, b"two", 0).await.unwrap();

        let md = engine.layout().get_file_metadata(p, "f").await.unwrap();
        assert_eq!(md.lock().latest_object_version(0), 2);
        assert_eq!(md.lock().largest_object_version(0), 2);
        let base = engine.layout().read_object("f", &md, 0, 0, FULL_OBJECT_LENGTH, 1).await.unwrap();
        assert_eq!(base.data(), b"base");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_lease_sweep() {
        let (engine, tmp) = engine("sweep", "hash").await;
        let recorder = Arc::new(Recorder::default());
        let engine = engine.with_listener(recorder.clone());
        let t0 = now_secs();

        engine.open_file("short", policy(), Duration::from_secs(5), false, CowMode::NoCow);
        engine.open_file("long", policy(), Duration::from_secs(5), false, CowMode::NoCow);
        engine.keep_open("long", Duration::from_secs(20)).unwrap();
        assert_eq!(engine.keep_open("none", Duration::from_secs(20)), Err(OsdError::NotOpen));

        let closed = engine.sweep(t0 + 7).await;
        let ids: Vec<_> = closed.iter().map(|c| c.file_id.as_str()).collect();
        assert_eq!(ids, vec!["short"]);
        assert_eq!(closed[0].reason, CloseReason::Expired);
        assert!(!engine.is_open("short"));
        assert!(engine.is_open("long"));
        assert_eq!(recorder.closed.lock().len(), 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_locks_through_engine() {
        let (engine, tmp) = engine("locks", "hash").await;
        let a = LockHolder::new("client-a", 1);
        let b = LockHolder::new("client-b", 1);
        engine.open_file("f", policy(), Duration::from_secs(60), false, CowMode::NoCow);

        engine
            .lock("f", AdvisoryLock::new(a.clone(), 100, 0, true))
            .unwrap();
        engine
            .lock("f", AdvisoryLock::new(b.clone(), 0, 100, true))
            .unwrap();
        let candidate = AdvisoryLock::new(b.clone(), 50, 100, true);
        assert_eq!(
            engine.lock("f", candidate.clone()),
            Err(OsdError::LockConflict)
        );
        assert_eq!(engine.check_lock("f", &candidate).holder, a);

        let leases = engine.open_files.lock().entry("f").unwrap().client_leases.len();
        assert_eq!(leases, 2);

        // closing drops every lock
        engine.close("f").await.unwrap();
        assert!(engine.locks("f").is_empty());
        engine.lock("f", candidate).unwrap();
        assert!(engine.unlock("f", &b).is_some());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_cleanup_versions() {
        let (engine, tmp) = engine("cleanup", "hash").await;
        let p = policy();
        for content in [b"v-one", b"v-two", b"v-thr"] {
            engine.open_file("f", p, Duration::from_secs(60), true, CowMode::AlwaysCow);
            engine.write("f", p, 0, 0, content, 0).await.unwrap();
            engine.close("f").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let md = engine.layout().get_file_metadata(p, "f").await.unwrap();
        let cuts: Vec<u64> = md.lock().version_table().versions().map(|v| v.timestamp).collect();
        assert_eq!(cuts.len(), 3);

        let report = engine
            .cleanup_versions("f", p, &BTreeSet::from([cuts[2]]))
            .await
            .unwrap();
        assert_eq!(report.snapshots_dropped, 2);
        assert_eq!(report.objects_deleted, 2);

        let v1 = engine.layout().read_object("f", &md, 0, 0, FULL_OBJECT_LENGTH, 1).await.unwrap();
        assert_eq!(v1, ObjectInformation::DoesNotExist);
        let latest = engine
            .read("f", p, 0, 0, FULL_OBJECT_LENGTH, ReadVersion::Latest)
            .await
            .unwrap();
        assert_eq!(latest.data(), b"v-thr");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_delete_of_expired_unswept_file() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("expired_delete", layout).await;
            let recorder = Arc::new(Recorder::default());
            let engine = engine.with_listener(recorder.clone());
            let p = policy();
            engine.open_file("f", p, Duration::from_secs(60), true, CowMode::AlwaysCow);
            engine.write("f", p, 0, 0, b"data", 0).await.unwrap();

            // the lease has run out but no sweep has seen it
            {
                let mut table = engine.open_files.lock();
                let entry = table.close("f").unwrap();
                table.open_file(
                    "f",
                    now_secs() - 10,
                    CowPolicy::new(CowMode::AlwaysCow),
                    p,
                    entry.written,
                );
            }
            assert!(!engine.is_open("f"));

            assert!(engine.delete_file("f").await.unwrap());
            assert!(!engine.layout().file_exists("f").await.unwrap());
            assert_eq!(engine.open_file_count(), 0);

            assert!(engine.sweep(now_secs() + 1).await.is_empty());
            assert!(!engine.layout().file_exists("f").await.unwrap());
            assert!(engine.file_id_list().await.unwrap().is_empty());

            let closed = recorder.closed.lock().clone();
            assert_eq!(closed.len(), 1);
            assert!(closed[0].deleted);
            assert_eq!(closed[0].reason, CloseReason::Expired);

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_truncate_excludes_racing_writes() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("race_truncate", layout).await;
            let engine = Arc::new(engine);
            let p = policy();
            engine.write("f", p, 0, 0, b"seed", 0).await.unwrap();

            let mut tasks = Vec::new();
            for i in 0..16u64 {
                let engine = engine.clone();
                tasks.push(tokio::spawn(async move {
                    if i == 8 {
                        return engine.truncate("f", p, 0, 1).await;
                    }
                    engine.write("f", p, i % 4, 0, b"racing", 0).await.map(|_| ())
                }));
            }
            for task in tasks {
                match task.await.unwrap() {
                    Ok(()) | Err(OsdError::StaleEpoch) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }

            // writes landed before the truncate or were refused after it
            let size = engine.file_size("f", p, ReadVersion::Latest).await.unwrap();
            assert_eq!(size, 0);
            assert!(engine.object_set("f", p).await.unwrap().is_empty());
            for obj_no in 0..4 {
                assert_eq!(
                    engine.read_full_object("f", p, obj_no, ReadVersion::Latest).await.unwrap(),
                    None
                );
            }

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_truncates_keep_highest_epoch() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("race_epochs", layout).await;
            let engine = Arc::new(engine);
            let p = policy();

            let tasks: Vec<_> = (1..=8u64)
                .rev()
                .map(|epoch| {
                    let engine = engine.clone();
                    tokio::spawn(async move { engine.truncate("f", p, epoch * 100, epoch).await })
                })
                .collect();
            for task in tasks {
                match task.await.unwrap() {
                    Ok(()) | Err(OsdError::StaleEpoch) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }

            let md = engine.layout().get_file_metadata(p, "f").await.unwrap();
            assert_eq!(md.lock().truncate_epoch(), 8);
            assert_eq!(md.lock().file_size(), 800);

            let loaded = engine.layout().load_file_metadata("f", p).await.unwrap();
            assert_eq!(loaded.truncate_epoch(), 8);

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_open_file_metadata_survives_cache_pressure() {
        for layout in storage::available_layouts() {
            let (engine, tmp) =
                engine_with("pinned", layout, |cfg| cfg.metadata_cache_size = 1).await;
            let p = policy();
            engine.write("f", p, 0, 0, b"open", 0).await.unwrap();
            let md = engine.layout().get_file_metadata(p, "f").await.unwrap();

            for other in ["a", "b", "c"] {
                engine.write(other, p, 0, 0, b"x", 0).await.unwrap();
                engine.close(other).await.unwrap();
            }

            let again = engine.layout().get_file_metadata(p, "f").await.unwrap();
            assert!(Arc::ptr_eq(&md, &again));
            engine.write("f", p, 1, 0, b"more", 0).await.unwrap();
            assert_eq!(md.lock().last_object(), Some(1));

            engine.close("f").await.unwrap();
            assert!(!engine.layout().metadata_cache().is_pinned("f"));

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_wide_stripe_shrink() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("wide_shrink", layout).await;
            let p = wide();
            engine.write("f", p, 0, 0, b"abc", 0).await.unwrap();
            engine.write("f", p, 4, 0, b"tail", 0).await.unwrap();
            assert_eq!(
                engine.file_size("f", p, ReadVersion::Latest).await.unwrap(),
                4 * STRIPE as u64 + 4
            );

            // the new end falls in object 1, held by the other node
            engine.truncate("f", p, STRIPE as u64 + 10, 1).await.unwrap();
            assert_eq!(engine.object_set("f", p).await.unwrap(), BTreeSet::from([0]));
            assert_eq!(
                engine.read_full_object("f", p, 4, ReadVersion::Latest).await.unwrap(),
                None
            );
            let obj0 = engine.read_full_object("f", p, 0, ReadVersion::Latest).await.unwrap().unwrap();
            assert_eq!(&obj0[..3], b"abc");
            assert_eq!(
                engine.file_size("f", p, ReadVersion::Latest).await.unwrap(),
                STRIPE as u64 + 10
            );

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_wide_stripe_extend_pads_local_object() {
        for layout in storage::available_layouts() {
            let (engine, tmp) = engine("wide_extend", layout).await;
            let p = wide();

            // row 1 is objects 2 and 3, node 0 holds object 2
            engine.truncate("f", p, 3 * STRIPE as u64 + 10, 1).await.unwrap();
            assert_eq!(engine.object_set("f", p).await.unwrap(), BTreeSet::from([2]));
            let obj2 = engine.read_full_object("f", p, 2, ReadVersion::Latest).await.unwrap();
            assert_eq!(obj2, Some(vec![0; STRIPE as usize]));
            let hole = engine
                .read("f", p, 0, 0, FULL_OBJECT_LENGTH, ReadVersion::Latest)
                .await
                .unwrap();
            assert_eq!(hole, ObjectInformation::Padding);
            assert_eq!(
                engine.file_size("f", p, ReadVersion::Latest).await.unwrap(),
                3 * STRIPE as u64 + 10
            );

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    #[tokio::test]
    async fn test_wide_stripe_extend_on_second_node() {
        for layout in storage::available_layouts() {
            let (engine, tmp) =
                engine_with("wide_node1", layout, |cfg| cfg.node_index = 1).await;
            let p = wide();

            // object 2 belongs to node 0, nothing to pad here
            engine.truncate("f", p, 2 * STRIPE as u64 + 5, 1).await.unwrap();
            assert!(engine.object_set("f", p).await.unwrap().is_empty());
            assert_eq!(
                engine.file_size("f", p, ReadVersion::Latest).await.unwrap(),
                2 * STRIPE as u64 + 5
            );

            engine.truncate("f", p, 3 * STRIPE as u64 + 7, 2).await.unwrap();
            assert_eq!(engine.object_set("f", p).await.unwrap(), BTreeSet::from([3]));
            let obj3 = engine.read_full_object("f", p, 3, ReadVersion::Latest).await.unwrap();
            assert_eq!(obj3, Some(vec![0; 7]));

            let _ = std::fs::remove_dir_all(&tmp);
        }
    }
}
