//! Open file table.
//!
//! Tracks which files are open on this node and until when. Every entry is
//! indexed twice: by file ID for request handling, and by `(expiration,
//! file ID)` in an ordered set so that a sweep can pop all expired entries
//! without scanning the table and a refresh can move one entry in
//! O(log n).
//!
//! The table does no I/O. Callers hold it behind one lock and act on the
//! returned entries (deletion, version cuts) after releasing that lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use osd_proto::striping::StripingPolicy;
use tracing::{debug, warn};

use crate::cow::CowPolicy;

/// A client known to hold state on an open file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLease {
    pub client_uuid: String,
    /// Lease end in seconds since the epoch.
    pub expires: u64,
}

/// State kept for one open file.
#[derive(Debug, Clone)]
pub struct OpenFileEntry {
    pub file_id: String,
    /// Lease end in seconds since the epoch.
    pub expires: u64,
    pub delete_on_close: bool,
    /// Set once the file was opened for writing or actually written.
    pub written: bool,
    pub cow: Arc<CowPolicy>,
    pub policy: StripingPolicy,
    pub client_leases: Vec<ClientLease>,
}

/// Lookup map plus expiration-ordered index.
#[derive(Debug, Default)]
pub struct OpenFileTable {
    entries: HashMap<String, OpenFileEntry>,
    by_expiry: BTreeSet<(u64, String)>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly opened file. An existing entry is refreshed instead
    /// and keeps its copy-on-write state.
    pub fn open_file(
        &mut self,
        file_id: &str,
        expires: u64,
        cow: CowPolicy,
        policy: StripingPolicy,
        write: bool,
    ) -> Arc<CowPolicy> {
        if let Some(cow) = self.refresh(file_id, expires, write) {
            return cow;
        }
        let cow = Arc::new(cow);
        self.entries.insert(
            file_id.to_string(),
            OpenFileEntry {
                file_id: file_id.to_string(),
                expires,
                delete_on_close: false,
                written: write,
                cow: cow.clone(),
                policy,
                client_leases: Vec::new(),
            },
        );
        self.by_expiry.insert((expires, file_id.to_string()));
        debug!("oft: opened {} until {} ({})", file_id, expires, cow.mode());
        cow
    }

    /// Extend the lease of an open file. The expiration only ever moves
    /// forward. Returns the file's COW policy, or `None` if it is not open.
    pub fn refresh(&mut self, file_id: &str, expires: u64, write: bool) -> Option<Arc<CowPolicy>> {
        let entry = self.entries.get_mut(file_id)?;
        if expires > entry.expires {
            self.by_expiry.remove(&(entry.expires, file_id.to_string()));
            entry.expires = expires;
            self.by_expiry.insert((expires, file_id.to_string()));
        }
        entry.written |= write;
        Some(entry.cow.clone())
    }

    /// Remove and return every entry whose lease ended strictly before
    /// `to_time`.
    pub fn clean(&mut self, to_time: u64) -> Vec<OpenFileEntry> {
        let mut closed = Vec::new();
        while let Some((expires, _)) = self.by_expiry.first() {
            if *expires >= to_time {
                break;
            }
            let Some((_, file_id)) = self.by_expiry.pop_first() else {
                break;
            };
            match self.entries.remove(&file_id) {
                Some(entry) => closed.push(entry),
                None => warn!("oft: expiry index out of sync for {}", file_id),
            }
        }
        if !closed.is_empty() {
            debug!("oft: {} leases expired before {}", closed.len(), to_time);
        }
        closed
    }

    /// Remove the entry for an explicit close.
    pub fn close(&mut self, file_id: &str) -> Option<OpenFileEntry> {
        let entry = self.entries.remove(file_id)?;
        self.by_expiry.remove(&(entry.expires, file_id.to_string()));
        Some(entry)
    }

    /// True if the file is absent or its lease has already run out, whether
    /// or not a sweep has removed it yet.
    pub fn is_closed(&self, file_id: &str, now: u64) -> bool {
        self.entries
            .get(file_id)
            .map_or(true, |entry| entry.expires < now)
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.entries.contains_key(file_id)
    }

    /// Mark an open file for deletion once it is closed. Returns false if
    /// the file is not open.
    pub fn set_delete_on_close(&mut self, file_id: &str) -> bool {
        match self.entries.get_mut(file_id) {
            Some(entry) => {
                entry.delete_on_close = true;
                true
            }
            None => false,
        }
    }

    pub fn is_delete_on_close(&self, file_id: &str) -> bool {
        self.entries
            .get(file_id)
            .is_some_and(|entry| entry.delete_on_close)
    }

    /// Note that the file has been written since it was opened.
    pub fn mark_written(&mut self, file_id: &str) {
        if let Some(entry) = self.entries.get_mut(file_id) {
            entry.written = true;
        }
    }

    /// Record or extend a client's lease on an open file.
    pub fn add_client_lease(&mut self, file_id: &str, client_uuid: &str, expires: u64) -> bool {
        let Some(entry) = self.entries.get_mut(file_id) else {
            return false;
        };
        match entry
            .client_leases
            .iter_mut()
            .find(|l| l.client_uuid == client_uuid)
        {
            Some(lease) => lease.expires = lease.expires.max(expires),
            None => entry.client_leases.push(ClientLease {
                client_uuid: client_uuid.to_string(),
                expires,
            }),
        }
        true
    }

    pub fn entry(&self, file_id: &str) -> Option<&OpenFileEntry> {
        self.entries.get(file_id)
    }

    pub fn cow_policy(&self, file_id: &str) -> Option<Arc<CowPolicy>> {
        self.entries.get(file_id).map(|entry| entry.cow.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
