//! Engine runner: one task per watch target, one shared cancellation signal.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use objwatch_core::{ListWatchSource, WatchTarget};
use objwatch_persist::SnapshotStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::sink::EventSink;
use crate::supervisor::{Supervisor, SupervisorExit};

/// Everything needed to start one supervisor.
pub struct TargetSpec {
    pub target: WatchTarget,
    pub source: Arc<dyn ListWatchSource>,
    /// Whether this target's hash cache goes to the shared store.
    pub persist: bool,
}

#[derive(Debug)]
pub enum TargetOutcome {
    Exited(SupervisorExit),
    Panicked(String),
    /// Still running when the shutdown grace period ran out.
    Aborted,
}

#[derive(Debug)]
pub struct TargetReport {
    pub target: String,
    pub outcome: TargetOutcome,
}

pub struct Engine {
    store: SnapshotStore,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(store: SnapshotStore, sink: Arc<dyn EventSink>, cancel: CancellationToken) -> Self {
        Self { store, sink, cancel }
    }

    /// Spawn one supervisor task per target. Targets share nothing but the store.
    pub fn spawn(&self, specs: Vec<TargetSpec>) -> EngineHandle {
        let mut tasks = JoinSet::new();
        let mut pending = BTreeSet::new();
        for spec in specs {
            let name = spec.target.name.clone();
            let store = if spec.persist { self.store.clone() } else { SnapshotStore::disabled() };
            let mut sup = Supervisor::new(spec.target, spec.source, store, self.sink.clone(), self.cancel.child_token());
            pending.insert(name.clone());
            info!(watch = %name, "spawning supervisor");
            tasks.spawn(async move {
                let outcome = match AssertUnwindSafe(sup.run()).catch_unwind().await {
                    Ok(exit) => TargetOutcome::Exited(exit),
                    Err(panic) => TargetOutcome::Panicked(panic_message(panic.as_ref())),
                };
                TargetReport { target: name, outcome }
            });
        }
        EngineHandle { tasks, pending, cancel: self.cancel.clone(), store: self.store.clone() }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct EngineHandle {
    tasks: JoinSet<TargetReport>,
    pending: BTreeSet<String>,
    cancel: CancellationToken,
    store: SnapshotStore,
}

impl EngineHandle {
    /// Number of targets whose task has not reported yet.
    pub fn running(&self) -> usize {
        self.pending.len()
    }

    /// Signal all supervisors to stop. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the next target to finish, e.g. one that failed on its own.
    pub async fn next_exit(&mut self) -> Option<TargetReport> {
        loop {
            match self.tasks.join_next().await? {
                Ok(report) => {
                    self.pending.remove(&report.target);
                    return Some(report);
                }
                Err(e) => warn!(error = %e, "supervisor task join failed"),
            }
        }
    }

    /// Cancel everything, wait up to `grace` for the supervisors to unwind,
    /// abort whatever is left and close the store.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<TargetReport> {
        self.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        let mut reports = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(report))) => {
                    self.pending.remove(&report.target);
                    reports.push(report);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "supervisor task join failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.pending.len(), "shutdown grace elapsed; aborting supervisors");
                    // Abort without waiting for the tasks to unwind.
                    self.tasks.abort_all();
                    self.tasks.detach_all();
                    break;
                }
            }
        }
        for target in std::mem::take(&mut self.pending) {
            reports.push(TargetReport { target, outcome: TargetOutcome::Aborted });
        }
        if let Err(e) = self.store.close() {
            warn!(error = %e, "closing store failed");
        }
        info!(targets = reports.len(), "engine stopped");
        reports
    }
}
