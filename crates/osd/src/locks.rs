//! POSIX-style advisory byte-range locks.
//!
//! Each holder, identified by client UUID and process id, owns at most one
//! lock per file. Shared locks coexist; an exclusive lock excludes every
//! overlapping lock of another holder.

use std::collections::HashMap;

use dashmap::DashMap;
use osd_proto::constants::LOCK_LENGTH_TO_EOF;
use osd_proto::error::{OsdError, OsdResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lock owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder {
    pub client_uuid: String,
    pub client_pid: u32,
}

impl LockHolder {
    pub fn new(client_uuid: impl Into<String>, client_pid: u32) -> Self {
        Self {
            client_uuid: client_uuid.into(),
            client_pid,
        }
    }
}

/// A granted or requested byte-range lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryLock {
    pub holder: LockHolder,
    pub offset: u64,
    /// Length in bytes; [`LOCK_LENGTH_TO_EOF`] extends to end of file.
    pub length: u64,
    pub exclusive: bool,
}

impl AdvisoryLock {
    pub fn new(holder: LockHolder, offset: u64, length: u64, exclusive: bool) -> Self {
        Self {
            holder,
            offset,
            length,
            exclusive,
        }
    }

    /// Exclusive end of the range, `None` when unbounded.
    fn end(&self) -> Option<u64> {
        if self.length == LOCK_LENGTH_TO_EOF {
            None
        } else {
            Some(self.offset.saturating_add(self.length))
        }
    }

    /// Whether the byte ranges of two locks intersect.
    pub fn overlaps(&self, other: &AdvisoryLock) -> bool {
        let starts_before_other_ends = other.end().map_or(true, |end| self.offset < end);
        let other_starts_before_end = self.end().map_or(true, |end| other.offset < end);
        starts_before_other_ends && other_starts_before_end
    }

    /// Whether `self` cannot be held at the same time as `other`.
    pub fn conflicts_with(&self, other: &AdvisoryLock) -> bool {
        self.holder != other.holder && (self.exclusive || other.exclusive) && self.overlaps(other)
    }
}

/// Advisory locks of all files on this node.
#[derive(Debug, Default)]
pub struct AdvisoryLockTable {
    files: DashMap<String, HashMap<LockHolder, AdvisoryLock>>,
}

impl AdvisoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `request`, replacing any lock its holder already has on the
    /// file. Fails with `LockConflict` if another holder's lock conflicts.
    pub fn acquire(&self, file_id: &str, request: AdvisoryLock) -> OsdResult<AdvisoryLock> {
        let mut locks = self.files.entry(file_id.to_string()).or_default();
        if let Some(conflict) = locks.values().find(|l| request.conflicts_with(l)) {
            debug!(
                "lock on {} [{}+{}] by {} conflicts with {}",
                file_id, request.offset, request.length, request.holder.client_uuid,
                conflict.holder.client_uuid
            );
            return Err(OsdError::LockConflict);
        }
        locks.insert(request.holder.clone(), request.clone());
        Ok(request)
    }

    /// Test `candidate` without changing anything.
    ///
    /// Returns the conflicting lock, or the candidate itself if it could be
    /// granted.
    pub fn check(&self, file_id: &str, candidate: &AdvisoryLock) -> AdvisoryLock {
        self.files
            .get(file_id)
            .and_then(|locks| locks.values().find(|l| candidate.conflicts_with(l)).cloned())
            .unwrap_or_else(|| candidate.clone())
    }

    /// Remove the lock `holder` has on `file_id`, if any.
    pub fn release(&self, file_id: &str, holder: &LockHolder) -> Option<AdvisoryLock> {
        let removed = self.files.get_mut(file_id)?.remove(holder);
        self.files.remove_if(file_id, |_, locks| locks.is_empty());
        removed
    }

    /// Drop every lock on `file_id`. Returns how many were held.
    pub fn release_file(&self, file_id: &str) -> usize {
        self.files
            .remove(file_id)
            .map(|(_, locks)| locks.len())
            .unwrap_or(0)
    }

    /// Locks currently held on `file_id`.
    pub fn locks(&self, file_id: &str) -> Vec<AdvisoryLock> {
        self.files
            .get(file_id)
            .map(|locks| locks.values().cloned().collect())
            .unwrap_or_default()
    }
}
