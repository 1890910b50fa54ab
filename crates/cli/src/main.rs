use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use objwatch_core::{ListWatchSource, OutputEvent, Segment};
use objwatch_engine::{ChannelSink, Engine, EngineConfig, PlannedTarget, TargetConfig, TargetSpec};
use objwatch_kubehub::KubeSource;
use objwatch_persist::{SnapshotStore, SqliteKv};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "objwatchctl", version, about = "Watch Kubernetes objects and print deduplicated changes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Watch one resource (or every target in --config) and print change events
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        #[arg(required_unless_present = "config")]
        resource: Option<String>,
        /// YAML file with a `targets:` list; overrides the per-resource flags
        #[arg(long = "config", env = "OBJWATCH_CONFIG")]
        config: Option<String>,
        /// Namespace to watch; repeat for several (default: cluster-wide)
        #[arg(long = "ns")]
        namespaces: Vec<String>,
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
        #[arg(long = "label-selector")]
        label_selector: Option<String>,
        /// Start watching at this resourceVersion instead of listing first
        #[arg(long = "resource-version")]
        resource_version: Option<String>,
        /// Event kinds to drop, e.g. --exclude bookmark --exclude deleted
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        /// SQLite file for hash cache snapshots (default: ~/.objwatch/objwatch.db)
        #[arg(long = "db", env = "OBJWATCH_DB_PATH")]
        db: Option<String>,
        /// Keep hash caches in memory only
        #[arg(long = "no-store", action = ArgAction::SetTrue)]
        no_store: bool,
    },
    /// Print the stored hash cache snapshot for a store key
    Cache {
        /// Target name, or `name/namespace` for per-namespace targets
        store_key: String,
        #[arg(long = "db", env = "OBJWATCH_DB_PATH")]
        db: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("OBJWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Events go to stdout; keep logs on stderr so the two can be piped apart.
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OBJWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OBJWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn open_store(db: Option<&str>) -> Result<SqliteKv> {
    match db {
        Some(path) => SqliteKv::open(path),
        None => SqliteKv::open_default(),
    }
}

fn render_event(ev: &OutputEvent) -> String {
    let id = &ev.identity;
    let key = match &id.namespace {
        Some(ns) => format!("{}/{}", ns, id.name),
        None => id.name.clone(),
    };
    let changed: Vec<&str> = Segment::ALL
        .iter()
        .filter(|s| ev.change_mask.changed(**s))
        .map(|s| s.field().unwrap_or("other"))
        .collect();
    let initial = if ev.is_initial_poll { " (initial)" } else { "" };
    format!("{:<8} {} {} [{}]{}", ev.kind, id.kind, key, changed.join(","), initial)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = kube::Client::try_default().await?;
            match objwatch_kubehub::discover(client).await {
                Ok(resources) => match cli.output {
                    Output::Human => {
                        for r in resources {
                            let scope = if r.namespaced { "namespaced" } else { "cluster" };
                            println!("{} • {}", r.gvk_key(), scope);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
                },
                Err(e) => {
                    error!(error = ?e, "discover failed");
                    eprintln!("discover error: {}", e);
                }
            }
        }
        Commands::Cache { store_key, db } => {
            let store = SnapshotStore::new(Arc::new(open_store(db.as_deref())?));
            match store.load(&store_key)? {
                Some(snap) => match cli.output {
                    Output::Human => {
                        println!("{} entries", snap.len());
                        for (key, hashes) in &snap.entries {
                            println!("{}  spec={} status={}", key, short(&hashes.spec), short(&hashes.status));
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&snap)?),
                },
                None => eprintln!("no snapshot stored under {:?}", store_key),
            }
            store.close()?;
        }
        Commands::Watch { resource, config, namespaces, field_selector, label_selector, resource_version, exclude, db, no_store } => {
            let cfg = match config {
                Some(path) => EngineConfig::from_path(&path)?,
                None => {
                    let Some(resource) = resource else { anyhow::bail!("a resource or --config is required") };
                    let mut t = TargetConfig::new(resource);
                    t.namespaces = namespaces;
                    t.field_selector = field_selector;
                    t.label_selector = label_selector;
                    t.resource_version = resource_version;
                    t.exclude_watch_type = exclude;
                    t.storage = !no_store;
                    EngineConfig { targets: vec![t] }
                }
            };
            let planned = cfg.plan()?;
            if planned.is_empty() {
                anyhow::bail!("no watch targets configured");
            }
            info!(targets = planned.len(), "watch invoked");

            let client = kube::Client::try_default().await?;
            let (specs, skipped) = build_specs(planned, |resource| {
                let client = client.clone();
                async move {
                    let source = KubeSource::connect(client, &resource).await?;
                    Ok(Arc::new(source) as Arc<dyn ListWatchSource>)
                }
            })
            .await;
            for (target, reason) in &skipped {
                eprintln!("skipping {}: {}", target, reason);
            }
            if specs.is_empty() {
                anyhow::bail!("none of the {} targets could be resolved", skipped.len());
            }

            let store = if no_store || specs.iter().all(|s| !s.persist) {
                SnapshotStore::disabled()
            } else {
                SnapshotStore::new(Arc::new(open_store(db.as_deref())?))
            };
            let cap = env_parse("OBJWATCH_QUEUE_CAP", 2048usize);
            let grace = Duration::from_millis(env_parse("OBJWATCH_SHUTDOWN_GRACE_MS", 5_000u64));
            let (sink, mut rx) = ChannelSink::channel(cap);
            let cancel = CancellationToken::new();
            let engine = Engine::new(store, Arc::new(sink), cancel.clone());
            let mut handle = engine.spawn(specs);

            let ctrl_c = signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(batch) = maybe else {
                            warn!("event channel closed; exiting watch loop");
                            break;
                        };
                        for ev in &batch {
                            match cli.output {
                                Output::Human => println!("{}", render_event(ev)),
                                Output::Json => println!("{}", serde_json::to_string(ev)?),
                            }
                        }
                    }
                    exit = handle.next_exit(), if handle.running() > 0 => {
                        if let Some(report) = exit {
                            warn!(watch = %report.target, outcome = ?report.outcome, "target stopped");
                        }
                        if handle.running() == 0 {
                            warn!("all targets stopped");
                            break;
                        }
                    }
                    _ = &mut ctrl_c => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }

            for report in handle.shutdown(grace).await {
                info!(watch = %report.target, outcome = ?report.outcome, "target finished");
            }
            // Batches delivered while shutting down.
            while let Ok(batch) = rx.try_recv() {
                for ev in &batch {
                    match cli.output {
                        Output::Human => println!("{}", render_event(ev)),
                        Output::Json => println!("{}", serde_json::to_string(ev)?),
                    }
                }
            }
            warn!("watch loop ended (graceful shutdown)");
        }
    }

    Ok(())
}

/// Resolve one source per distinct resource and pair it with its targets. A
/// resource that fails to resolve drops only its own targets, reported as
/// `(target, reason)`.
async fn build_specs<F, Fut>(planned: Vec<PlannedTarget>, mut connect: F) -> (Vec<TargetSpec>, Vec<(String, String)>)
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Arc<dyn ListWatchSource>>>,
{
    // One discovery lookup per resource, shared by its per-namespace targets.
    let mut sources: HashMap<String, Result<Arc<dyn ListWatchSource>, String>> = HashMap::new();
    let mut specs = Vec::with_capacity(planned.len());
    let mut skipped = Vec::new();
    for p in planned {
        let resource = p.target.resource.clone();
        if !sources.contains_key(&resource) {
            let resolved = connect(resource.clone()).await.map_err(|e| {
                error!(gvk = %resource, error = %format!("{:#}", e), "resource could not be resolved");
                format!("{:#}", e)
            });
            sources.insert(resource.clone(), resolved);
        }
        match &sources[&resource] {
            Ok(source) => specs.push(TargetSpec { target: p.target, source: source.clone(), persist: p.persist }),
            Err(reason) => skipped.push((p.target.name, reason.clone())),
        }
    }
    (specs, skipped)
}

fn short(hash: &str) -> &str {
    if hash.is_empty() { "-" } else { &hash[..hash.len().min(12)] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objwatch_core::{ListResult, Scope, SourceError, WatchStream, WatchTarget};

    struct NoopSource;

    #[async_trait::async_trait]
    impl ListWatchSource for NoopSource {
        async fn list(&self, _scope: &Scope) -> Result<ListResult, SourceError> {
            Ok(ListResult::default())
        }

        async fn watch(&self, _scope: &Scope, _rv: &str) -> Result<WatchStream, SourceError> {
            Err(SourceError::Transport("not used".into()))
        }
    }

    fn planned(name: &str, resource: &str) -> PlannedTarget {
        PlannedTarget { target: WatchTarget::new(name, resource), persist: true }
    }

    #[tokio::test]
    async fn unresolvable_resource_skips_only_its_targets() {
        let mut calls = Vec::new();
        let (specs, skipped) = build_specs(
            vec![
                planned("cm/default", "v1/ConfigMap"),
                planned("widgets/a", "example.com/v1/Widget"),
                planned("widgets/b", "example.com/v1/Widget"),
                planned("cm/kube-system", "v1/ConfigMap"),
            ],
            |resource: String| {
                calls.push(resource.clone());
                async move {
                    if resource.starts_with("example.com") {
                        anyhow::bail!("GVK not found: {}", resource)
                    }
                    Ok(Arc::new(NoopSource) as Arc<dyn ListWatchSource>)
                }
            },
        )
        .await;

        assert_eq!(calls, vec!["v1/ConfigMap", "example.com/v1/Widget"], "one lookup per resource");
        let names: Vec<&str> = specs.iter().map(|s| s.target.name.as_str()).collect();
        assert_eq!(names, vec!["cm/default", "cm/kube-system"]);
        let skipped_names: Vec<&str> = skipped.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(skipped_names, vec!["widgets/a", "widgets/b"]);
        assert!(skipped[0].1.contains("GVK not found"));
    }
}
