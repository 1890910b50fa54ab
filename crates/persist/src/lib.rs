//! objwatch persistence: a tiny key/value seam plus the snapshot adapter
//! that keeps a target's hash cache across restarts.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use objwatch_core::CacheSnapshot;
use tracing::debug;

/// Key/value store shared by all supervisors. Implementations must be safe
/// for concurrent use from independent callers.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed store. Simple, synchronous; one row per store key.
pub struct SqliteKv {
    db: Mutex<Option<rusqlite::Connection>>,
}

impl SqliteKv {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("OBJWATCH_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                ts    INTEGER NOT NULL
            )",
            [],
        )
        .context("creating kv table")?;
        let me = Self { db: Mutex::new(Some(db)) };
        histogram!("objwatch_persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn with_db<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let guard = self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
        let db = guard.as_ref().ok_or_else(|| anyhow!("sqlite store closed"))?;
        f(db)
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let started = std::time::Instant::now();
        let out = self.with_db(|db| {
            let mut stmt = db.prepare("SELECT value FROM kv WHERE key = ?1")?;
            let mut rows = stmt.query([key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, Vec<u8>>(0)?)),
                None => Ok(None),
            }
        })?;
        histogram!("objwatch_persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let started = std::time::Instant::now();
        self.with_db(|db| {
            db.execute(
                "INSERT INTO kv(key, value, ts) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, ts = excluded.ts",
                (key, value, now_ts()),
            )
            .with_context(|| format!("writing key {}", key))?;
            Ok(())
        })?;
        histogram!("objwatch_persist_set_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("objwatch_persist_set_total", 1u64);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
        if let Some(db) = guard.take() {
            db.close().map_err(|(_, e)| anyhow!(e)).context("closing sqlite db")?;
        }
        Ok(())
    }
}

/// In-process store; shared via `Arc` it behaves like an external store that
/// outlives the supervisors using it.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.map.lock().map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = self.map.lock().map_err(|_| anyhow!("memory store lock poisoned"))?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".objwatch");
        let _ = std::fs::create_dir_all(&p);
        p.push("objwatch.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "objwatch.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(raw: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("OBJWATCH_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(raw, lvl).unwrap_or_else(|_| raw.to_vec());
    }
    raw.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("store: {0}")]
    Store(String),
    #[error("corrupt snapshot under {key}: {source}")]
    Corrupt { key: String, source: serde_json::Error },
    #[error("encoding snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reads and writes hash cache snapshots. Without a backing store every
/// load finds nothing and every save is a no-op.
#[derive(Clone, Default)]
pub struct SnapshotStore {
    kv: Option<Arc<dyn KvStore>>,
}

impl SnapshotStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv: Some(kv) }
    }

    pub fn disabled() -> Self {
        Self { kv: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.kv.is_some()
    }

    pub fn load(&self, store_key: &str) -> Result<Option<CacheSnapshot>, PersistError> {
        let Some(kv) = &self.kv else { return Ok(None) };
        let Some(blob) = kv.get(store_key).map_err(|e| PersistError::Store(format!("{:#}", e)))? else {
            return Ok(None);
        };
        let raw = maybe_decompress(&blob);
        let snap: CacheSnapshot = serde_json::from_slice(&raw)
            .map_err(|source| PersistError::Corrupt { key: store_key.to_string(), source })?;
        debug!(key = %store_key, entries = snap.len(), "snapshot loaded");
        Ok(Some(snap))
    }

    pub fn save(&self, store_key: &str, snapshot: &CacheSnapshot) -> Result<(), PersistError> {
        let Some(kv) = &self.kv else { return Ok(()) };
        let started = std::time::Instant::now();
        let raw = serde_json::to_vec(snapshot)?;
        kv.set(store_key, &maybe_compress(&raw)).map_err(|e| PersistError::Store(format!("{:#}", e)))?;
        histogram!("objwatch_persist_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    pub fn close(&self) -> Result<(), PersistError> {
        match &self.kv {
            Some(kv) => kv.close().map_err(|e| PersistError::Store(format!("{:#}", e))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objwatch_core::{ObjectKey, SegmentHashes};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("objwatch-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn snapshot(n: usize) -> CacheSnapshot {
        let mut snap = CacheSnapshot::default();
        for i in 0..n {
            snap.entries.insert(
                ObjectKey::new("ConfigMap", Some("ns"), &format!("cm-{}", i)),
                SegmentHashes { metadata: format!("m{}", i), spec: String::new(), status: String::new(), other: "o".into() },
            );
        }
        snap
    }

    #[test]
    fn sqlite_set_get_overwrite() {
        let path = temp_db();
        let kv = SqliteKv::open(&path).unwrap();
        assert!(kv.get("a").unwrap().is_none());
        kv.set("a", b"one").unwrap();
        kv.set("a", b"two").unwrap();
        kv.set("b", b"three").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(kv.get("b").unwrap().as_deref(), Some(&b"three"[..]));
        kv.close().unwrap();
        assert!(kv.get("a").is_err(), "closed store refuses reads");

        let reopened = SqliteKv::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn snapshot_survives_reopen() {
        let path = temp_db();
        let store = SnapshotStore::new(Arc::new(SqliteKv::open(&path).unwrap()));
        store.save("configmaps/ns", &snapshot(3)).unwrap();
        store.close().unwrap();

        let store = SnapshotStore::new(Arc::new(SqliteKv::open(&path).unwrap()));
        let loaded = store.load("configmaps/ns").unwrap().expect("snapshot");
        assert_eq!(loaded, snapshot(3));
        assert!(store.load("other").unwrap().is_none());
    }

    #[test]
    fn disabled_store_is_inert() {
        let store = SnapshotStore::disabled();
        store.save("k", &snapshot(1)).unwrap();
        assert!(store.load("k").unwrap().is_none());
        assert!(!store.is_enabled());
    }

    #[test]
    fn corrupt_payload_reported() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("k", b"{not json").unwrap();
        let store = SnapshotStore::new(kv);
        assert!(matches!(store.load("k"), Err(PersistError::Corrupt { .. })));
    }
}
