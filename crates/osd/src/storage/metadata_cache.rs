//! File metadata cache.
//!
//! Loading a file's metadata means scanning its directory, so loaded
//! metadata is kept in an LRU keyed by file ID. Metadata of open files is
//! pinned outside the LRU: there must be exactly one in-memory copy per
//! open file, so it is only released when the file is closed or deleted.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::metadata::SharedMetadata;

struct CacheState {
    lru: LruCache<String, SharedMetadata>,
    pinned: HashMap<String, SharedMetadata>,
}

pub struct MetadataCache {
    state: Mutex<CacheState>,
}

impl MetadataCache {
    /// Create a cache holding at most `capacity` unpinned files (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                lru: LruCache::new(capacity),
                pinned: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, file_id: &str) -> Option<SharedMetadata> {
        let mut state = self.state.lock();
        if let Some(md) = state.pinned.get(file_id) {
            return Some(md.clone());
        }
        state.lru.get(file_id).cloned()
    }

    /// Cache `md` for `file_id`. If another request cached the same file
    /// first, that entry wins and is returned.
    pub fn insert(&self, file_id: &str, md: SharedMetadata) -> SharedMetadata {
        let mut state = self.state.lock();
        if let Some(existing) = state.pinned.get(file_id) {
            return existing.clone();
        }
        if let Some(existing) = state.lru.get(file_id) {
            return existing.clone();
        }
        if let Some((evicted, _)) = state.lru.push(file_id.to_string(), md.clone()) {
            if evicted != file_id {
                debug!("md_cache: evicted {}", evicted);
            }
        }
        md
    }

    /// Keep the metadata of `file_id` resident until [`unpin`](Self::unpin).
    ///
    /// An entry already cached for the file wins over `md`, so every caller
    /// ends up with the same copy. Returns that copy.
    pub fn pin(&self, file_id: &str, md: SharedMetadata) -> SharedMetadata {
        let mut state = self.state.lock();
        if let Some(existing) = state.pinned.get(file_id) {
            return existing.clone();
        }
        let md = state.lru.pop(file_id).unwrap_or(md);
        state.pinned.insert(file_id.to_string(), md.clone());
        md
    }

    /// Return a pinned entry to the LRU.
    pub fn unpin(&self, file_id: &str) {
        let mut state = self.state.lock();
        if let Some(md) = state.pinned.remove(file_id) {
            if let Some((evicted, _)) = state.lru.push(file_id.to_string(), md) {
                if evicted != file_id {
                    debug!("md_cache: evicted {}", evicted);
                }
            }
        }
    }

    pub fn is_pinned(&self, file_id: &str) -> bool {
        self.state.lock().pinned.contains_key(file_id)
    }

    pub fn remove(&self, file_id: &str) -> Option<SharedMetadata> {
        let mut state = self.state.lock();
        let pinned = state.pinned.remove(file_id);
        let cached = state.lru.pop(file_id);
        pinned.or(cached)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.pinned.clear();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.lru.len() + state.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::metadata::FileMetadata;
    use crate::version_table::VersionTable;
    use osd_proto::StripingPolicy;
    use std::sync::Arc;

    fn md() -> SharedMetadata {
        FileMetadata::new(StripingPolicy::default(), VersionTable::new("/nonexistent")).into_shared()
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = MetadataCache::new(4);
        let a = md();
        let b = md();
        let got = cache.insert("f", a.clone());
        assert!(Arc::ptr_eq(&got, &a));
        let got = cache.insert("f", b);
        assert!(Arc::ptr_eq(&got, &a));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = MetadataCache::new(2);
        cache.insert("a", md());
        cache.insert("b", md());
        cache.get("a");
        cache.insert("c", md());
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());

        assert!(cache.remove("a").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let cache = MetadataCache::new(0);
        cache.insert("a", md());
        cache.insert("b", md());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pinned_entry_survives_eviction() {
        let cache = MetadataCache::new(1);
        let open = cache.insert("open", md());
        let pinned = cache.pin("open", md());
        assert!(Arc::ptr_eq(&open, &pinned));
        assert!(cache.is_pinned("open"));

        cache.insert("a", md());
        cache.insert("b", md());
        let got = cache.get("open").unwrap();
        assert!(Arc::ptr_eq(&got, &open));
        // a reload racing with the pin loses
        let again = cache.insert("open", md());
        assert!(Arc::ptr_eq(&again, &open));

        cache.unpin("open");
        assert!(!cache.is_pinned("open"));
        cache.insert("c", md());
        assert!(cache.get("open").is_none());
    }

    #[test]
    fn test_remove_drops_pinned() {
        let cache = MetadataCache::new(2);
        let md = cache.pin("f", md());
        let removed = cache.remove("f").unwrap();
        assert!(Arc::ptr_eq(&md, &removed));
        assert!(cache.get("f").is_none());
        assert!(cache.is_empty());
    }
}
