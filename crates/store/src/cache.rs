//! Per-target change hash cache.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use objwatch_core::{CacheSnapshot, ChangeMask, ObjectKey, SegmentHashes};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Object key → last observed segment hashes, for exactly one watch target.
///
/// The map is only reachable through these methods, which take the lock.
/// `diff` followed by `upsert` for the same key must not be interleaved with
/// another writer; the supervisor owning the cache processes events one at a
/// time, which gives that for free.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: Mutex<FxHashMap<ObjectKey, SegmentHashes>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, SegmentHashes>> {
        // A poisoned lock still holds a consistent map: every mutation is a single insert/remove.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compare `hashes` with the cached entry. Returns the change mask and
    /// whether an entry existed; a missing entry yields an all-true mask.
    pub fn diff(&self, key: &ObjectKey, hashes: &SegmentHashes) -> (ChangeMask, bool) {
        match self.lock().get(key) {
            Some(prev) => (hashes.mask_against(prev), true),
            None => (ChangeMask::all(), false),
        }
    }

    pub fn upsert(&self, key: ObjectKey, hashes: SegmentHashes) {
        self.lock().insert(key, hashes);
    }

    /// Returns whether an entry was removed.
    pub fn delete(&self, key: &ObjectKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn keys(&self) -> BTreeSet<ObjectKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot { entries: self.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect() }
    }

    /// Replace the whole content with a loaded snapshot.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        let mut map = self.lock();
        map.clear();
        map.extend(snapshot.entries);
        debug!(entries = map.len(), "hash cache restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(spec: &str) -> SegmentHashes {
        SegmentHashes { metadata: "m".into(), spec: spec.into(), status: String::new(), other: "o".into() }
    }

    #[test]
    fn first_observation_is_all_true() {
        let cache = HashCache::new();
        let key = ObjectKey::new("Pod", Some("ns"), "a");
        let (mask, existed) = cache.diff(&key, &hashes("s1"));
        assert!(!existed);
        assert_eq!(mask, ChangeMask::all());
    }

    #[test]
    fn diff_is_idempotent_without_upsert_of_new_value() {
        let cache = HashCache::new();
        let key = ObjectKey::new("Pod", Some("ns"), "a");
        cache.upsert(key.clone(), hashes("s1"));
        for _ in 0..2 {
            let (mask, existed) = cache.diff(&key, &hashes("s1"));
            assert!(existed);
            assert!(!mask.any());
        }
        let (mask, _) = cache.diff(&key, &hashes("s2"));
        assert!(mask.spec && !mask.metadata && !mask.status && !mask.other);
    }

    #[test]
    fn delete_then_re_add_is_new() {
        let cache = HashCache::new();
        let key = ObjectKey::new("Pod", Some("ns"), "a");
        cache.upsert(key.clone(), hashes("s1"));
        assert!(cache.delete(&key));
        assert!(!cache.delete(&key));
        let (_, existed) = cache.diff(&key, &hashes("s1"));
        assert!(!existed);
    }

    #[test]
    fn snapshot_restore_replaces_content() {
        let cache = HashCache::new();
        cache.upsert(ObjectKey::new("Pod", Some("ns"), "a"), hashes("s1"));
        let snap = cache.snapshot();
        let other = HashCache::new();
        other.upsert(ObjectKey::new("Pod", Some("ns"), "stale"), hashes("x"));
        other.restore(snap);
        let keys: Vec<String> = other.keys().into_iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["Pod:ns#a".to_string()]);
    }
}
