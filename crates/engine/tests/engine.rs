#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use objwatch_core::{ListResult, ListWatchSource, Scope, SourceError, WatchEventKind, WatchStream};
use objwatch_engine::{
    attributes, ChannelSink, CollectingSink, Engine, EngineError, SupervisorExit, TargetOutcome, TargetSpec,
};
use objwatch_persist::{KvStore, MemoryKv, SnapshotStore};
use tokio_util::sync::CancellationToken;

fn spec(name: &str, source: &Arc<ScriptedSource>) -> TargetSpec {
    TargetSpec { target: target(name), source: source.clone() as Arc<dyn ListWatchSource>, persist: true }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_target_does_not_disturb_others() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let store = SnapshotStore::new(kv);
    let sink = Arc::new(CollectingSink::new());
    let cancel = CancellationToken::new();

    let broken = ScriptedSource::new();
    broken.push_list(Some("1"), vec![deployment("x", 1, 1, "1", "2024-05-01T00:00:00Z")]);
    broken.push_watch(WatchScript::Refuse(SourceError::Transport("connection refused".into())));

    let healthy = ScriptedSource::new();
    healthy.push_list(Some("10"), vec![deployment("web", 2, 1, "10", "2024-05-01T00:00:00Z")]);
    healthy.push_events(vec![ev(WatchEventKind::Modified, deployment("web", 2, 2, "11", "2024-05-01T00:01:00Z"))]);

    let engine = Engine::new(store.clone(), sink.clone(), cancel.clone());
    let mut handle = engine.spawn(vec![spec("broken", &broken), spec("healthy", &healthy)]);
    assert_eq!(handle.running(), 2);

    let first = tokio::time::timeout(Duration::from_secs(5), handle.next_exit()).await.unwrap().unwrap();
    assert_eq!(first.target, "broken");
    assert!(matches!(first.outcome, TargetOutcome::Exited(SupervisorExit::Fatal(EngineError::WatchOpen { .. }))));

    tokio::time::timeout(Duration::from_secs(5), healthy.idle.notified()).await.unwrap();
    let reports = handle.shutdown(Duration::from_secs(2)).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].target, "healthy");
    assert!(matches!(reports[0].outcome, TargetOutcome::Exited(SupervisorExit::Cancelled)));

    let web: Vec<_> = sink.events().into_iter().filter(|e| e.identity.name == "web").collect();
    assert_eq!(web.len(), 2);
    assert!(web[1].change_mask.status);
    let healthy_snap = store.load("healthy").unwrap().expect("healthy cache persisted");
    assert_eq!(healthy_snap.len(), 1);
    let broken_snap = store.load("broken").unwrap().expect("broken cache persisted");
    assert_eq!(broken_snap.len(), 1);
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn channel_sink_receives_batches() {
    let (sink, mut rx) = ChannelSink::channel(16);
    let cancel = CancellationToken::new();
    let source = ScriptedSource::new();
    source.push_list(
        Some("10"),
        vec![
            deployment("web", 1, 1, "9", "2024-05-01T00:00:00Z"),
            deployment("api", 1, 1, "10", "2024-05-01T00:00:00Z"),
        ],
    );
    source.push_events(vec![ev(WatchEventKind::Deleted, deployment("api", 1, 1, "11", "2024-05-01T00:00:00Z"))]);

    let engine = Engine::new(SnapshotStore::disabled(), Arc::new(sink), cancel);
    let handle = engine.spawn(vec![spec("deploys", &source)]);

    let initial = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(initial.len(), 2, "initial list is delivered as one batch");
    assert!(initial.iter().all(|e| e.is_initial_poll && e.kind == WatchEventKind::Added));

    let deleted = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(deleted.len(), 1);
    let attrs = attributes(&deleted[0]);
    assert_eq!(attrs["event.kind"], "DELETED");
    assert_eq!(attrs["k8s.object.name"], "api");
    assert_eq!(attrs["is_initial_poll"], false);

    tokio::time::timeout(Duration::from_secs(5), source.idle.notified()).await.unwrap();
    let reports = handle.shutdown(Duration::from_secs(2)).await;
    assert!(matches!(reports[0].outcome, TargetOutcome::Exited(SupervisorExit::Cancelled)));
}

/// Blocks its worker thread inside `list`, so cancellation cannot be observed.
struct StuckSource;

#[async_trait::async_trait]
impl ListWatchSource for StuckSource {
    async fn list(&self, _scope: &Scope) -> Result<ListResult, SourceError> {
        std::thread::sleep(Duration::from_millis(400));
        Ok(ListResult::default())
    }

    async fn watch(&self, _scope: &Scope, _rv: &str) -> Result<WatchStream, SourceError> {
        Err(SourceError::Transport("unreachable".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_does_not_wait_forever() {
    let cancel = CancellationToken::new();
    let engine = Engine::new(SnapshotStore::disabled(), Arc::new(CollectingSink::new()), cancel);
    let handle = engine.spawn(vec![TargetSpec { target: target("stuck"), source: Arc::new(StuckSource), persist: false }]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let reports = handle.shutdown(Duration::from_millis(50)).await;

    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].target, "stuck");
    assert!(matches!(reports[0].outcome, TargetOutcome::Aborted));
}

/// A store whose writes hold the calling thread for a while.
struct SlowKv {
    inner: MemoryKv,
    delay: Duration,
}

impl KvStore for SlowKv {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        std::thread::sleep(self.delay);
        self.inner.set(key, value)
    }
}

#[tokio::test]
async fn slow_store_does_not_stall_other_targets() {
    let store = SnapshotStore::new(Arc::new(SlowKv { inner: MemoryKv::new(), delay: Duration::from_millis(500) }));
    let sink = Arc::new(CollectingSink::new());
    let cancel = CancellationToken::new();

    let persisted = ScriptedSource::new();
    persisted.push_list(Some("1"), vec![deployment("db", 1, 1, "1", "2024-05-01T00:00:00Z")]);

    let in_memory = ScriptedSource::new();
    in_memory.push_list(Some("10"), vec![deployment("web", 1, 1, "10", "2024-05-01T00:00:00Z")]);
    in_memory.push_events(vec![ev(WatchEventKind::Modified, deployment("web", 2, 1, "11", "2024-05-01T00:00:00Z"))]);

    let engine = Engine::new(store.clone(), sink.clone(), cancel);
    let started = std::time::Instant::now();
    // The persisted target is spawned first, so its save starts before the other target runs.
    let handle = engine.spawn(vec![
        spec("persisted", &persisted),
        TargetSpec { target: target("in-memory"), source: in_memory.clone() as Arc<dyn ListWatchSource>, persist: false },
    ]);

    tokio::time::timeout(Duration::from_secs(5), in_memory.idle.notified()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400), "took {:?}", started.elapsed());
    let web = sink.events().into_iter().filter(|e| e.identity.name == "web").count();
    assert_eq!(web, 2);

    tokio::time::timeout(Duration::from_secs(5), persisted.idle.notified()).await.unwrap();
    handle.shutdown(Duration::from_secs(2)).await;
    assert_eq!(store.load("persisted").unwrap().expect("saved").len(), 1);
}
