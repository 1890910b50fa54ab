//! objwatch kubehub – discovery and the kube-backed list/watch source

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta, WatchEvent as KubeWatchEvent},
    discovery::{Discovery, Scope as DiscoveryScope},
    Client,
};
use metrics::counter;
use objwatch_core::{ListResult, ListWatchSource, Scope, SourceError, WatchEvent, WatchEventKind, WatchStream};

/// Server-side watch timeout; kube rejects values of 295s and above.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, DiscoveryScope::Namespaced);
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced,
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, DiscoveryScope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn source_error(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => SourceError::Gone(resp.message),
        kube::Error::Api(resp) => SourceError::Api { code: resp.code, message: resp.message },
        other => SourceError::Transport(other.to_string()),
    }
}

/// List items come back without apiVersion/kind; fill them from the ApiResource
/// so identities and cache keys are complete.
fn object_json(mut obj: DynamicObject, types: &TypeMeta) -> serde_json::Value {
    if obj.types.is_none() {
        obj.types = Some(types.clone());
    }
    serde_json::to_value(&obj).unwrap_or_else(|e| {
        warn!(error = %e, "serializing DynamicObject");
        serde_json::Value::Null
    })
}

fn translate_event(ev: KubeWatchEvent<DynamicObject>, types: &TypeMeta) -> WatchEvent {
    match ev {
        KubeWatchEvent::Added(o) => WatchEvent::new(WatchEventKind::Added, object_json(o, types)),
        KubeWatchEvent::Modified(o) => WatchEvent::new(WatchEventKind::Modified, object_json(o, types)),
        KubeWatchEvent::Deleted(o) => WatchEvent::new(WatchEventKind::Deleted, object_json(o, types)),
        KubeWatchEvent::Bookmark(b) => WatchEvent::new(
            WatchEventKind::Bookmark,
            json!({ "metadata": { "resourceVersion": b.metadata.resource_version } }),
        ),
        KubeWatchEvent::Error(e) => WatchEvent::new(
            WatchEventKind::Error,
            json!({ "kind": "Status", "status": e.status, "code": e.code, "reason": e.reason, "message": e.message }),
        ),
    }
}

/// `ListWatchSource` over `Api<DynamicObject>` for one resource type.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    gvk_key: String,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeSource {
    /// Resolve the resource through discovery.
    pub async fn connect(client: Client, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        info!(gvk = %gvk_key, namespaced, plural = %ar.plural, "resource resolved");
        Ok(Self { client, gvk_key: gvk_key.to_string(), ar, namespaced })
    }

    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    fn types(&self) -> TypeMeta {
        TypeMeta { api_version: self.ar.api_version.clone(), kind: self.ar.kind.clone() }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            (false, Some(ns)) => {
                warn!(gvk = %self.gvk_key, ns = %ns, "namespace ignored for cluster-scoped resource");
                Api::all_with(self.client.clone(), &self.ar)
            }
            (_, None) => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

#[async_trait::async_trait]
impl ListWatchSource for KubeSource {
    async fn list(&self, scope: &Scope) -> Result<ListResult, SourceError> {
        let api = self.api(scope.namespace.as_deref());
        let mut lp = ListParams::default();
        lp.field_selector = scope.field_selector.clone();
        lp.label_selector = scope.label_selector.clone();
        let list = api.list(&lp).await.map_err(source_error)?;
        counter!("objwatch_list_total", 1u64);
        let types = self.types();
        let items: Vec<_> = list.items.into_iter().map(|o| object_json(o, &types)).collect();
        debug!(gvk = %self.gvk_key, ns = ?scope.namespace, items = items.len(), "list ok");
        Ok(ListResult { resource_version: list.metadata.resource_version, items })
    }

    async fn watch(&self, scope: &Scope, resource_version: &str) -> Result<WatchStream, SourceError> {
        let api = self.api(scope.namespace.as_deref());
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        wp.field_selector = scope.field_selector.clone();
        wp.label_selector = scope.label_selector.clone();
        wp.bookmarks = true;
        let stream = api.watch(&wp, resource_version).await.map_err(source_error)?;
        counter!("objwatch_watch_open_total", 1u64);
        let types = self.types();
        Ok(stream.map(move |item| item.map(|ev| translate_event(ev, &types)).map_err(source_error)).boxed())
    }
}
