//! Event translator: raw event + change mask → [`OutputEvent`].

use std::collections::BTreeMap;

use chrono::Utc;
use objwatch_core::{ChangeMask, ObjectRef, OutputEvent, WatchEventKind};
use serde_json::Value;

pub fn translate(
    kind: WatchEventKind,
    object: Value,
    identity: ObjectRef,
    change_mask: ChangeMask,
    is_initial_poll: bool,
) -> OutputEvent {
    OutputEvent { kind, identity, change_mask, is_initial_poll, observed_at: Utc::now(), object }
}

/// Attributes a sink attaches to the record it produces for `event`.
pub fn attributes(event: &OutputEvent) -> BTreeMap<&'static str, Value> {
    let id = &event.identity;
    let mut out = BTreeMap::new();
    out.insert("event.kind", Value::from(event.kind.as_str()));
    out.insert("k8s.object.api_version", Value::from(id.api_version.as_str()));
    out.insert("k8s.object.kind", Value::from(id.kind.as_str()));
    out.insert("k8s.namespace.name", Value::from(id.namespace.as_deref().unwrap_or("")));
    out.insert("k8s.object.name", Value::from(id.name.as_str()));
    if let Some(uid) = &id.uid {
        out.insert("k8s.object.uid", Value::from(uid.as_str()));
    }
    out.insert("change.metadata", Value::from(event.change_mask.metadata));
    out.insert("change.spec", Value::from(event.change_mask.spec));
    out.insert("change.status", Value::from(event.change_mask.status));
    out.insert("change.other", Value::from(event.change_mask.other));
    out.insert("is_initial_poll", Value::from(event.is_initial_poll));
    out
}
