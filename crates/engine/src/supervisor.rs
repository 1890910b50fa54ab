//! Watch supervisor: the list → watch → restart loop for one target.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use objwatch_core::{
    is_usable_resource_version, ChangeMask, ListWatchSource, ObjectRef, OutputEvent, WatchEvent, WatchEventKind,
    WatchTarget,
};
use objwatch_persist::SnapshotStore;
use objwatch_store::{hash_object, HashCache};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::EngineError;
use crate::resolver::Resolver;
use crate::sink::EventSink;
use crate::translate::translate;

/// First delay before reopening a watch that ended without delivering anything.
pub const RESTART_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
pub const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Capped exponential delay between watch restarts.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, next: initial }
    }

    /// Delay to wait now; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(RESTART_BACKOFF_INITIAL, RESTART_BACKOFF_MAX)
    }
}

#[derive(Debug)]
pub enum SupervisorState {
    Resolving,
    Watching,
    /// The server no longer accepts the current resourceVersion.
    GoneRestart,
    /// The watch ended without a Gone signal.
    ClosedRestart,
    FatalStop(EngineError),
    Terminated,
}

/// Why a supervisor returned.
#[derive(Debug)]
pub enum SupervisorExit {
    /// Cancellation was observed.
    Cancelled,
    /// The initial list of a resolving pass failed.
    ResolveFailed(EngineError),
    /// Opening the watch failed with something other than Gone.
    Fatal(EngineError),
}

pub struct Supervisor {
    target: WatchTarget,
    source: Arc<dyn ListWatchSource>,
    cache: HashCache,
    store: SnapshotStore,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    resource_version: String,
    backoff: RestartBackoff,
}

impl Supervisor {
    pub fn new(
        target: WatchTarget,
        source: Arc<dyn ListWatchSource>,
        store: SnapshotStore,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let resource_version = target.starting_resource_version.clone().unwrap_or_default();
        Self {
            target,
            source,
            cache: HashCache::new(),
            store,
            sink,
            cancel,
            resource_version,
            backoff: RestartBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RestartBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn cache(&self) -> &HashCache {
        &self.cache
    }

    /// Last resourceVersion seen on the list or watch stream.
    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.target, self.source.as_ref(), &self.cache, &self.store)
    }

    /// Drive the state machine until cancellation or a terminal failure.
    pub async fn run(&mut self) -> SupervisorExit {
        let mut state = if is_usable_resource_version(&self.resource_version) {
            info!(watch = %self.target.name, rv = %self.resource_version, "starting from configured resource version");
            self.resolver().load_snapshot().await;
            SupervisorState::Watching
        } else {
            SupervisorState::Resolving
        };

        loop {
            debug!(watch = %self.target.name, state = ?state, "supervisor step");
            state = match state {
                SupervisorState::Resolving => match self.resolve().await {
                    Ok(()) => SupervisorState::Watching,
                    Err(EngineError::Cancelled) => SupervisorState::Terminated,
                    Err(e) => {
                        error!(watch = %self.target.name, error = %e, "initial list failed; stopping target");
                        return SupervisorExit::ResolveFailed(e);
                    }
                },
                SupervisorState::Watching => match self.watch().await {
                    Ok(next) => next,
                    Err(EngineError::Cancelled) => SupervisorState::Terminated,
                    Err(e) => SupervisorState::FatalStop(e),
                },
                SupervisorState::GoneRestart => {
                    counter!("objwatch_watch_restarts_total", 1u64, "reason" => "gone");
                    info!(watch = %self.target.name, rv = %self.resource_version, "resource version gone; relisting");
                    self.resource_version.clear();
                    if self.pause().await.is_err() {
                        SupervisorState::Terminated
                    } else {
                        SupervisorState::Resolving
                    }
                }
                SupervisorState::ClosedRestart => {
                    counter!("objwatch_watch_restarts_total", 1u64, "reason" => "closed");
                    if self.pause().await.is_err() {
                        SupervisorState::Terminated
                    } else if is_usable_resource_version(&self.resource_version) {
                        debug!(watch = %self.target.name, rv = %self.resource_version, "watch closed; resuming");
                        SupervisorState::Watching
                    } else {
                        SupervisorState::Resolving
                    }
                }
                SupervisorState::FatalStop(e) => {
                    error!(watch = %self.target.name, error = %e, "watch failed; stopping target");
                    return SupervisorExit::Fatal(e);
                }
                SupervisorState::Terminated => {
                    info!(watch = %self.target.name, "supervisor terminated");
                    return SupervisorExit::Cancelled;
                }
            };
        }
    }

    /// Wait out the restart backoff unless cancelled first.
    async fn pause(&mut self) -> Result<(), EngineError> {
        let delay = self.backoff.next_delay();
        debug!(watch = %self.target.name, delay_ms = delay.as_millis() as u64, "restart backoff");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn resolve(&mut self) -> Result<(), EngineError> {
        let resolution = {
            let resolver = self.resolver();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                r = resolver.resolve() => r?,
            }
        };
        self.deliver(resolution.events).await?;
        self.persist().await;
        self.resource_version = resolution.resource_version;
        Ok(())
    }

    async fn watch(&mut self) -> Result<SupervisorState, EngineError> {
        let scope = self.target.scope();
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            r = self.source.watch(&scope, &self.resource_version) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_gone() => {
                debug!(watch = %self.target.name, error = %e, "watch refused resource version");
                return Ok(SupervisorState::GoneRestart);
            }
            Err(source) => return Err(EngineError::WatchOpen { target: self.target.name.clone(), source }),
        };
        info!(watch = %self.target.name, rv = %self.resource_version, "watch established");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                n = stream.next() => n,
            };
            let ev = match next {
                None => {
                    debug!(watch = %self.target.name, "watch stream ended");
                    return Ok(SupervisorState::ClosedRestart);
                }
                Some(Err(e)) if e.is_gone() => return Ok(SupervisorState::GoneRestart),
                Some(Err(e)) => {
                    warn!(watch = %self.target.name, error = %e, "watch stream error");
                    return Ok(SupervisorState::ClosedRestart);
                }
                Some(Ok(ev)) => ev,
            };
            let rv = ev.resource_version().map(|s| s.to_string());

            if self.target.excludes(ev.kind) {
                trace!(watch = %self.target.name, kind = %ev.kind, "excluded event dropped");
            } else {
                match ev.kind {
                    WatchEventKind::Bookmark => self.backoff.reset(),
                    WatchEventKind::Error if ev.is_gone() => return Ok(SupervisorState::GoneRestart),
                    WatchEventKind::Error => {
                        warn!(watch = %self.target.name, status = %ev.object, "watch error event");
                        return Ok(SupervisorState::ClosedRestart);
                    }
                    WatchEventKind::Added | WatchEventKind::Modified | WatchEventKind::Deleted => {
                        self.backoff.reset();
                        self.process(ev).await?;
                    }
                }
            }
            if let Some(rv) = rv {
                self.resource_version = rv;
            }
        }
    }

    /// Hash, diff and emit one object event, then persist the cache.
    async fn process(&self, ev: WatchEvent) -> Result<(), EngineError> {
        let out = match ev.kind {
            WatchEventKind::Deleted => match ObjectRef::from_object(&ev.object) {
                Some(identity) => {
                    self.cache.delete(&identity.key());
                    Some(translate(WatchEventKind::Deleted, ev.object, identity, ChangeMask::all(), false))
                }
                None => {
                    counter!("objwatch_objects_skipped_total", 1u64);
                    warn!(watch = %self.target.name, "deleted object without metadata.name skipped");
                    return Ok(());
                }
            },
            kind => {
                let (identity, hashes) = match hash_object(&ev.object) {
                    Ok(v) => v,
                    Err(e) => {
                        counter!("objwatch_objects_skipped_total", 1u64);
                        warn!(watch = %self.target.name, error = %e, "skipping unhashable object");
                        return Ok(());
                    }
                };
                let key = identity.key();
                let (mask, existed) = self.cache.diff(&key, &hashes);
                if existed && !mask.any() {
                    counter!("objwatch_events_suppressed_total", 1u64);
                    trace!(watch = %self.target.name, key = %key, "unchanged object suppressed");
                    None
                } else {
                    self.cache.upsert(key, hashes);
                    Some(translate(kind, ev.object, identity, mask, false))
                }
            }
        };
        if let Some(out) = out {
            self.deliver(vec![out]).await?;
        }
        self.persist().await;
        Ok(())
    }

    async fn deliver(&self, batch: Vec<OutputEvent>) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        let n = batch.len() as u64;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            r = self.sink.deliver(batch) => {
                match r {
                    Ok(()) => counter!("objwatch_events_emitted_total", n),
                    Err(e) => warn!(watch = %self.target.name, error = %e, events = n, "delivering events failed"),
                }
                Ok(())
            }
        }
    }

    /// Write-through of the whole cache. Encoding and the store write run on the
    /// blocking pool; failures are logged and never block emission.
    async fn persist(&self) {
        if !self.store.is_enabled() {
            return;
        }
        let store = self.store.clone();
        let key = self.target.store_key().to_string();
        let snapshot = self.cache.snapshot();
        match tokio::task::spawn_blocking(move || store.save(&key, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counter!("objwatch_persist_errors_total", 1u64);
                warn!(watch = %self.target.name, error = %e, "persisting hash cache failed");
            }
            Err(e) => {
                counter!("objwatch_persist_errors_total", 1u64);
                warn!(watch = %self.target.name, error = %e, "persist task failed");
            }
        }
    }
}
