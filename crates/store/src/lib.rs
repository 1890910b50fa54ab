//! objwatch store: turns raw object documents into per-segment hashes and
//! keeps the per-target cache those hashes are diffed against.

#![forbid(unsafe_code)]

pub mod cache;
pub mod canon;

pub use cache::HashCache;
pub use canon::{canonical_bytes, canonicalize, hash_object, hash_segments, is_timestamp_like, CanonError};
