//! objwatch core types.
//!
//! Everything the engine crates agree on lives here: watch targets, the
//! event kinds coming off a watch stream, per-segment hashes and change
//! masks, and the output event handed to sinks.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod source;

pub use source::{ListResult, ListWatchSource, Scope, SourceError, WatchStream};

/// Sentinel resourceVersion used when the server returned none on a list.
pub const FALLBACK_RESOURCE_VERSION: &str = "0";

/// True when `rv` can be handed to a watch call without a prior relist.
pub fn is_usable_resource_version(rv: &str) -> bool {
    !rv.is_empty() && rv != FALLBACK_RESOURCE_VERSION
}

/// Kind of a raw watch/list event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
    Error,
    Bookmark,
}

impl WatchEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventKind::Added => "ADDED",
            WatchEventKind::Modified => "MODIFIED",
            WatchEventKind::Deleted => "DELETED",
            WatchEventKind::Error => "ERROR",
            WatchEventKind::Bookmark => "BOOKMARK",
        }
    }
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown watch event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for WatchEventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADDED" => Ok(WatchEventKind::Added),
            "MODIFIED" => Ok(WatchEventKind::Modified),
            "DELETED" => Ok(WatchEventKind::Deleted),
            "ERROR" => Ok(WatchEventKind::Error),
            "BOOKMARK" => Ok(WatchEventKind::Bookmark),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

/// Logical sub-document of an object, hashed independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Metadata,
    Spec,
    Status,
    Other,
}

impl Segment {
    pub const ALL: [Segment; 4] = [Segment::Metadata, Segment::Spec, Segment::Status, Segment::Other];

    /// Top-level field holding this segment; `None` for the catch-all segment.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Segment::Metadata => Some("metadata"),
            Segment::Spec => Some("spec"),
            Segment::Status => Some("status"),
            Segment::Other => None,
        }
    }
}

/// One watched (resource type, namespace) pair. Immutable for the lifetime of a supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchTarget {
    /// Logical name; also the key the hash cache is persisted under.
    pub name: String,
    /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment".
    pub resource: String,
    /// `None` watches cluster-wide.
    pub namespace: Option<String>,
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
    pub starting_resource_version: Option<String>,
    pub excluded_kinds: BTreeSet<WatchEventKind>,
}

impl WatchTarget {
    pub fn new(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            namespace: None,
            field_selector: None,
            label_selector: None,
            starting_resource_version: None,
            excluded_kinds: BTreeSet::new(),
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn store_key(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        Scope {
            namespace: self.namespace.clone(),
            field_selector: self.field_selector.clone(),
            label_selector: self.label_selector.clone(),
        }
    }

    pub fn excludes(&self, kind: WatchEventKind) -> bool {
        self.excluded_kinds.contains(&kind)
    }
}

/// Cache key of an object within one target: `kind:namespace#name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        ObjectKey(format!("{}:{}#{}", kind, namespace.unwrap_or(""), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical identity of an object document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
}

impl ObjectRef {
    /// Read identity fields from a raw document. `None` when `metadata.name` is missing.
    pub fn from_object(obj: &serde_json::Value) -> Option<Self> {
        let meta = obj.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?.to_string();
        let str_at = |v: Option<&serde_json::Value>| v.and_then(|v| v.as_str()).map(|s| s.to_string());
        Some(Self {
            api_version: str_at(obj.get("apiVersion")).unwrap_or_default(),
            kind: str_at(obj.get("kind")).unwrap_or_default(),
            namespace: str_at(meta.get("namespace")).filter(|s| !s.is_empty()),
            name,
            uid: str_at(meta.get("uid")),
        })
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, self.namespace.as_deref(), &self.name)
    }
}

/// Hex digests of the four segments; empty string when the segment is absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SegmentHashes {
    pub metadata: String,
    pub spec: String,
    pub status: String,
    pub other: String,
}

impl SegmentHashes {
    pub fn get(&self, segment: Segment) -> &str {
        match segment {
            Segment::Metadata => &self.metadata,
            Segment::Spec => &self.spec,
            Segment::Status => &self.status,
            Segment::Other => &self.other,
        }
    }

    /// Per-segment inequality against a previous observation.
    pub fn mask_against(&self, prev: &SegmentHashes) -> ChangeMask {
        ChangeMask {
            metadata: self.metadata != prev.metadata,
            spec: self.spec != prev.spec,
            status: self.status != prev.status,
            other: self.other != prev.other,
        }
    }
}

/// Which segments differ between two observations of the same object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChangeMask {
    pub metadata: bool,
    pub spec: bool,
    pub status: bool,
    pub other: bool,
}

impl ChangeMask {
    /// Mask for a first observation.
    pub fn all() -> Self {
        Self { metadata: true, spec: true, status: true, other: true }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.metadata || self.spec || self.status || self.other
    }

    pub fn changed(&self, segment: Segment) -> bool {
        match segment {
            Segment::Metadata => self.metadata,
            Segment::Spec => self.spec,
            Segment::Status => self.status,
            Segment::Other => self.other,
        }
    }
}

/// Persistable form of a target's hash cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CacheSnapshot {
    pub entries: BTreeMap<ObjectKey, SegmentHashes>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Raw event coming from a list or watch call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub object: serde_json::Value,
    pub from_initial_list: bool,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, object: serde_json::Value) -> Self {
        Self { kind, object, from_initial_list: false }
    }

    /// `metadata.resourceVersion` of the carried object, if any.
    pub fn resource_version(&self) -> Option<&str> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// True for an `Error` event whose status says the resourceVersion expired (HTTP 410).
    pub fn is_gone(&self) -> bool {
        if self.kind != WatchEventKind::Error {
            return false;
        }
        let code = self.object.get("code").and_then(|v| v.as_u64());
        let reason = self.object.get("reason").and_then(|v| v.as_str()).unwrap_or("");
        code == Some(410) || reason == "Gone" || reason == "Expired"
    }
}

/// Change event handed to sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputEvent {
    pub kind: WatchEventKind,
    pub identity: ObjectRef,
    pub change_mask: ChangeMask,
    pub is_initial_poll: bool,
    pub observed_at: DateTime<Utc>,
    pub object: serde_json::Value,
}

pub mod prelude {
    pub use super::{
        is_usable_resource_version, CacheSnapshot, ChangeMask, ListResult, ListWatchSource, ObjectKey, ObjectRef,
        OutputEvent, Scope, Segment, SegmentHashes, SourceError, WatchEvent, WatchEventKind, WatchStream,
        WatchTarget, FALLBACK_RESOURCE_VERSION,
    };
}
