//! Resource version resolver: full list, reconciliation against the hash
//! cache, baseline resourceVersion for the following watch.

use std::collections::BTreeSet;

use metrics::counter;
use objwatch_core::{ListWatchSource, ObjectKey, OutputEvent, WatchEventKind, WatchTarget, FALLBACK_RESOURCE_VERSION};
use objwatch_persist::SnapshotStore;
use objwatch_store::{hash_object, HashCache};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::translate::translate;

/// Outcome of one reconciliation pass.
#[derive(Debug)]
pub struct Resolution {
    pub resource_version: String,
    /// New or changed objects, in list order, all flagged as initial poll.
    pub events: Vec<OutputEvent>,
    /// Cache entries dropped because the object is gone from the live list.
    pub pruned: usize,
    /// Listed objects that could not be hashed.
    pub skipped: usize,
}

pub struct Resolver<'a> {
    target: &'a WatchTarget,
    source: &'a dyn ListWatchSource,
    cache: &'a HashCache,
    store: &'a SnapshotStore,
}

impl<'a> Resolver<'a> {
    pub fn new(
        target: &'a WatchTarget,
        source: &'a dyn ListWatchSource,
        cache: &'a HashCache,
        store: &'a SnapshotStore,
    ) -> Self {
        Self { target, source, cache, store }
    }

    /// Load the persisted snapshot into the cache. A missing or unreadable
    /// snapshot leaves the in-memory cache as it is.
    pub async fn load_snapshot(&self) {
        if !self.store.is_enabled() {
            return;
        }
        let store = self.store.clone();
        let key = self.target.store_key().to_string();
        let loaded = match tokio::task::spawn_blocking(move || store.load(&key)).await {
            Ok(r) => r,
            Err(e) => {
                counter!("objwatch_persist_errors_total", 1u64);
                warn!(watch = %self.target.name, error = %e, "snapshot load task failed; continuing without it");
                return;
            }
        };
        match loaded {
            Ok(Some(snap)) => {
                info!(watch = %self.target.name, entries = snap.len(), "hash cache loaded from store");
                self.cache.restore(snap);
            }
            Ok(None) => debug!(watch = %self.target.name, "no persisted hash cache"),
            Err(e) => {
                counter!("objwatch_persist_errors_total", 1u64);
                warn!(watch = %self.target.name, error = %e, "loading hash cache failed; continuing without it");
            }
        }
    }

    pub async fn resolve(&self) -> Result<Resolution, EngineError> {
        let list = self
            .source
            .list(&self.target.scope())
            .await
            .map_err(|source| EngineError::List { target: self.target.name.clone(), source })?;

        self.load_snapshot().await;

        let mut live: BTreeSet<ObjectKey> = BTreeSet::new();
        let mut events = Vec::new();
        let mut skipped = 0usize;
        for item in list.items {
            let (identity, hashes) = match hash_object(&item) {
                Ok(v) => v,
                Err(e) => {
                    skipped += 1;
                    counter!("objwatch_objects_skipped_total", 1u64);
                    warn!(watch = %self.target.name, error = %e, "skipping unhashable object");
                    continue;
                }
            };
            let key = identity.key();
            live.insert(key.clone());
            let (mask, existed) = self.cache.diff(&key, &hashes);
            if existed && !mask.any() {
                counter!("objwatch_events_suppressed_total", 1u64);
                continue;
            }
            let kind = if existed { WatchEventKind::Modified } else { WatchEventKind::Added };
            self.cache.upsert(key, hashes);
            events.push(translate(kind, item, identity, mask, true));
        }

        // Objects removed while nobody watched are dropped silently; no Deleted is synthesized.
        let mut pruned = 0usize;
        for key in self.cache.keys() {
            if !live.contains(&key) && self.cache.delete(&key) {
                pruned += 1;
            }
        }

        let resource_version = list
            .resource_version
            .filter(|rv| !rv.is_empty())
            .unwrap_or_else(|| FALLBACK_RESOURCE_VERSION.to_string());
        info!(
            watch = %self.target.name,
            rv = %resource_version,
            live = live.len(),
            emitted = events.len(),
            pruned,
            skipped,
            "initial list reconciled"
        );
        Ok(Resolution { resource_version, events, pruned, skipped })
    }
}
