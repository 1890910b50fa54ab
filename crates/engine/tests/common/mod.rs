#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use objwatch_core::{ListResult, ListWatchSource, Scope, SourceError, WatchEvent, WatchEventKind, WatchStream, WatchTarget};
use objwatch_engine::{Supervisor, SupervisorExit};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub enum WatchScript {
    /// Opening the watch fails.
    Refuse(SourceError),
    /// The stream yields these items, then closes.
    Events(Vec<Result<WatchEvent, SourceError>>),
    Stream(WatchStream),
}

/// A list/watch source that replays scripted responses. Once the watch
/// scripts run out it hands out a stream that never yields and signals `idle`.
#[derive(Default)]
pub struct ScriptedSource {
    lists: Mutex<VecDeque<Result<ListResult, SourceError>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    list_calls: AtomicUsize,
    watch_rvs: Mutex<Vec<String>>,
    pub idle: Notify,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_list(&self, rv: Option<&str>, items: Vec<serde_json::Value>) {
        let res = ListResult { resource_version: rv.map(|s| s.to_string()), items };
        self.lists.lock().unwrap().push_back(Ok(res));
    }

    pub fn push_list_error(&self, e: SourceError) {
        self.lists.lock().unwrap().push_back(Err(e));
    }

    pub fn push_watch(&self, script: WatchScript) {
        self.watches.lock().unwrap().push_back(script);
    }

    pub fn push_events(&self, events: Vec<WatchEvent>) {
        self.push_watch(WatchScript::Events(events.into_iter().map(Ok).collect()));
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Resource versions each watch was opened with, in order.
    pub fn watch_rvs(&self) -> Vec<String> {
        self.watch_rvs.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ListWatchSource for ScriptedSource {
    async fn list(&self, _scope: &Scope) -> Result<ListResult, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(SourceError::Transport("list script exhausted".into())))
    }

    async fn watch(&self, _scope: &Scope, resource_version: &str) -> Result<WatchStream, SourceError> {
        self.watch_rvs.lock().unwrap().push(resource_version.to_string());
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(WatchScript::Refuse(e)) => Err(e),
            Some(WatchScript::Events(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(WatchScript::Stream(s)) => Ok(s),
            None => {
                self.idle.notify_one();
                Ok(futures::stream::pending::<Result<WatchEvent, SourceError>>().boxed())
            }
        }
    }
}

pub fn deployment(name: &str, replicas: i64, ready: i64, rv: &str, ts: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": "prod",
            "uid": format!("uid-{}", name),
            "resourceVersion": rv,
            "creationTimestamp": "2024-01-01T00:00:00Z",
            "labels": { "app": name }
        },
        "spec": { "replicas": replicas },
        "status": {
            "readyReplicas": ready,
            "conditions": [ { "type": "Available", "status": "True", "lastUpdateTime": ts } ]
        }
    })
}

pub fn ev(kind: WatchEventKind, object: serde_json::Value) -> WatchEvent {
    WatchEvent::new(kind, object)
}

pub fn gone() -> WatchEvent {
    WatchEvent::new(
        WatchEventKind::Error,
        serde_json::json!({ "kind": "Status", "status": "Failure", "reason": "Expired", "code": 410 }),
    )
}

pub fn bookmark(rv: &str) -> WatchEvent {
    WatchEvent::new(WatchEventKind::Bookmark, serde_json::json!({ "metadata": { "resourceVersion": rv } }))
}

pub fn target(name: &str) -> WatchTarget {
    WatchTarget::new(name, "apps/v1/Deployment").with_namespace("prod")
}

/// Run until the source runs out of scripts, then cancel and hand the supervisor back.
pub async fn run_until_idle(
    sup: Supervisor,
    source: &ScriptedSource,
    cancel: CancellationToken,
) -> (Supervisor, SupervisorExit) {
    let handle = tokio::spawn(async move {
        let mut sup = sup;
        let exit = sup.run().await;
        (sup, exit)
    });
    tokio::time::timeout(Duration::from_secs(5), source.idle.notified()).await.expect("supervisor never went idle");
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor did not stop after cancel")
        .expect("supervisor task panicked")
}

/// Run a supervisor expected to stop on its own.
pub async fn run_to_exit(mut sup: Supervisor) -> (Supervisor, SupervisorExit) {
    let exit = tokio::time::timeout(Duration::from_secs(5), sup.run()).await.expect("supervisor did not exit");
    (sup, exit)
}
