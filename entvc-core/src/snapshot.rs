//! Content-addressed snapshot store
//!
//! Snapshots are never updated or deleted. `put` of bytes that already exist
//! returns the existing id without writing a row.

use crate::backend::{Backend, opt_blob_at};
use crate::error::{EngineError, Result};
use crate::object::SnapshotId;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Snapshot store with a small in-process read cache
pub struct SnapshotStore {
    cache: Option<Mutex<LruCache<SnapshotId, Arc<Vec<u8>>>>>,
}

impl SnapshotStore {
    /// Create a store; a capacity of zero disables the read cache
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Store content, returning its id (deduplicated by hash)
    pub fn put(&self, backend: &dyn Backend, content: &[u8]) -> Result<SnapshotId> {
        let id = SnapshotId::from_content(content);
        let inserted = backend.execute(
            "INSERT INTO snapshot (id, content) VALUES (?1, ?2) ON CONFLICT (id) DO NOTHING",
            &[id.as_str().into(), content.into()],
        )?;
        if inserted.rows_affected == 0 {
            debug!(snapshot_id = %id, "snapshot already stored");
        }
        Ok(id)
    }

    /// Load the content of a snapshot
    pub fn get(&self, backend: &dyn Backend, id: &SnapshotId) -> Result<Arc<Vec<u8>>> {
        if id.is_tombstone() {
            return Err(EngineError::InvalidOperation(
                "the tombstone snapshot has no content".to_string(),
            ));
        }
        if let Some(hit) = self.cached(id) {
            return Ok(hit);
        }

        let result = backend.execute(
            "SELECT content FROM snapshot WHERE id = ?1",
            &[id.as_str().into()],
        )?;
        let row = result
            .first()
            .ok_or_else(|| EngineError::not_found("snapshot", id.as_str()))?;
        let content = Arc::new(opt_blob_at(row, 0, "content")?.unwrap_or_default());

        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                cache.put(id.clone(), Arc::clone(&content));
            }
        }
        Ok(content)
    }

    /// Whether a snapshot row exists
    pub fn exists(&self, backend: &dyn Backend, id: &SnapshotId) -> Result<bool> {
        let result = backend.execute(
            "SELECT 1 FROM snapshot WHERE id = ?1",
            &[id.as_str().into()],
        )?;
        Ok(!result.is_empty())
    }

    /// Drop cached content; called when a transaction rolls back
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                cache.clear();
            }
        }
    }

    fn cached(&self, id: &SnapshotId) -> Option<Arc<Vec<u8>>> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock().ok()?;
        cache.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SqliteBackend, Value};
    use crate::schema;

    fn setup() -> SqliteBackend {
        let backend = SqliteBackend::open_in_memory().unwrap();
        schema::install(&backend).unwrap();
        backend
    }

    fn snapshot_rows(backend: &SqliteBackend) -> i64 {
        match &backend.execute("SELECT COUNT(*) FROM snapshot", &[]).unwrap().rows[0][0] {
            Value::Integer(n) => *n,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_put_get() {
        let backend = setup();
        let store = SnapshotStore::new(8);
        let id = store.put(&backend, b"hello world").unwrap();
        assert_eq!(store.get(&backend, &id).unwrap().as_slice(), b"hello world");
    }

    #[test]
    fn test_put_deduplicates() {
        let backend = setup();
        let store = SnapshotStore::new(0);
        let before = snapshot_rows(&backend);
        let a = store.put(&backend, b"same").unwrap();
        let b = store.put(&backend, b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(snapshot_rows(&backend), before + 1);
    }

    #[test]
    fn test_missing_snapshot() {
        let backend = setup();
        let store = SnapshotStore::new(8);
        let id = SnapshotId::from_content(b"never stored");
        assert!(matches!(
            store.get(&backend, &id),
            Err(EngineError::NotFound { kind: "snapshot", .. })
        ));
        assert!(!store.exists(&backend, &id).unwrap());
    }

    #[test]
    fn test_tombstone_has_no_content() {
        let backend = setup();
        let store = SnapshotStore::new(8);
        assert!(store.exists(&backend, &SnapshotId::tombstone()).unwrap());
        assert!(store.get(&backend, &SnapshotId::tombstone()).is_err());
    }

    #[test]
    fn test_empty_content() {
        let backend = setup();
        let store = SnapshotStore::new(8);
        let id = store.put(&backend, b"").unwrap();
        store.clear_cache();
        assert!(store.get(&backend, &id).unwrap().is_empty());
    }
}
