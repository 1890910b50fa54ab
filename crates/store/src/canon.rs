//! Canonicalizer and segment hasher.

use objwatch_core::{ObjectRef, Segment, SegmentHashes};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CanonError {
    #[error("object is not a JSON map")]
    NotAnObject,
    #[error("object missing metadata.name")]
    MissingName,
    #[error("serializing canonical form: {0}")]
    Serialize(#[from] serde_json::Error),
}

// RFC3339 and the looser ISO-8601 shapes controllers write.
static TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}(:?\d{2})?)?$")
        .expect("timestamp pattern compiles")
});

pub fn is_timestamp_like(s: &str) -> bool {
    TIMESTAMP.is_match(s)
}

/// Remove churn that carries no user-visible change.
///
/// `metadata.resourceVersion` is always dropped (and `metadata.managedFields`
/// with the default `strip-managed-fields` feature). Timestamp-shaped strings
/// are dropped anywhere: map entries disappear, array slots become `null` so
/// positions of the remaining elements do not shift.
pub fn canonicalize(doc: &Value) -> Result<Value, CanonError> {
    if !doc.is_object() {
        return Err(CanonError::NotAnObject);
    }
    let mut out = doc.clone();
    if let Some(meta) = out.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("resourceVersion");
        #[cfg(feature = "strip-managed-fields")]
        meta.remove("managedFields");
    }
    strip_timestamps(&mut out);
    Ok(out)
}

fn strip_timestamps(v: &mut Value) {
    match v {
        Value::Object(map) => {
            map.retain(|_, val| !matches!(val, Value::String(s) if is_timestamp_like(s)));
            for val in map.values_mut() {
                strip_timestamps(val);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                if matches!(item, Value::String(s) if is_timestamp_like(s)) {
                    *item = Value::Null;
                } else {
                    strip_timestamps(item);
                }
            }
        }
        _ => {}
    }
}

/// Serialize with lexicographic key order regardless of the map implementation.
pub fn canonical_bytes(v: &Value) -> Result<Vec<u8>, CanonError> {
    let mut out = Vec::with_capacity(256);
    write_canonical(v, &mut out)?;
    Ok(out)
}

fn write_canonical(v: &Value, out: &mut Vec<u8>) -> Result<(), CanonError> {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, k)?;
                out.push(b':');
                if let Some(val) = map.get(k.as_str()) {
                    write_canonical(val, out)?;
                }
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

fn digest(v: &Value) -> Result<String, CanonError> {
    let bytes = canonical_bytes(v)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn segment_value(canon: &Map<String, Value>, segment: Segment) -> Option<Value> {
    match segment.field() {
        Some(field) => canon.get(field).filter(|v| !v.is_null()).cloned(),
        None => {
            let rest: Map<String, Value> = canon
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "metadata" | "spec" | "status"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if rest.is_empty() {
                None
            } else {
                Some(Value::Object(rest))
            }
        }
    }
}

/// Canonicalize `doc` and hash each present segment; absent segments hash to `""`.
pub fn hash_segments(doc: &Value) -> Result<SegmentHashes, CanonError> {
    let canon = canonicalize(doc)?;
    let map = canon.as_object().ok_or(CanonError::NotAnObject)?;
    let mut hashes = SegmentHashes::default();
    for segment in Segment::ALL {
        let h = match segment_value(map, segment) {
            Some(v) => digest(&v)?,
            None => String::new(),
        };
        match segment {
            Segment::Metadata => hashes.metadata = h,
            Segment::Spec => hashes.spec = h,
            Segment::Status => hashes.status = h,
            Segment::Other => hashes.other = h,
        }
    }
    Ok(hashes)
}

/// Identity plus segment hashes for one object; the unit the engine diffs.
pub fn hash_object(doc: &Value) -> Result<(ObjectRef, SegmentHashes), CanonError> {
    if !doc.is_object() {
        return Err(CanonError::NotAnObject);
    }
    let identity = ObjectRef::from_object(doc).ok_or(CanonError::MissingName)?;
    let hashes = hash_segments(doc)?;
    Ok((identity, hashes))
}
