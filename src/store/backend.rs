//! The persistence seam for the durable cache tier.
//!
//! The engine talks to durable storage only through [`PersistentStore`] — a
//! narrow read/write/delete/scan interface. TTL enforcement at this layer is
//! advisory: a backend may drop expired blobs early, but the engine remains
//! the authority on expiry via the record's own timestamps.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

/// Narrow interface to a persistent key/value store with advisory TTLs.
///
/// Implementations must be safe to share across tasks. Blobs are opaque to
/// the backend; the engine encodes and decodes records itself.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Reads the blob stored under `key`, or `None` if absent.
    async fn read(&self, key: &str) -> Option<Bytes>;

    /// Writes `blob` under `key`. A `ttl` of `None` means the blob should be
    /// kept until deleted or evicted.
    async fn write(&self, key: &str, blob: Bytes, ttl: Option<Duration>);

    /// Deletes the blob stored under `key`, if any.
    async fn delete(&self, key: &str);

    /// Lists every key currently present.
    async fn keys(&self) -> Vec<String>;

    /// Removes every stored blob.
    async fn clear(&self);
}

struct StoredBlob {
    blob: Bytes,
    expires_at: Option<SystemTime>,
}

/// An in-process [`PersistentStore`] backed by a plain map.
///
/// The default backend: useful for tests, for single-process deployments
/// that want the tiering behavior without real durability, and as the
/// reference implementation of the advisory-TTL contract.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredBlob>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredBlob>> {
        // A poisoned map is still structurally valid; recover rather than
        // propagate the panic into unrelated callers.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn read(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.lock();
        let expired = match entries.get(key) {
            Some(stored) => matches!(stored.expires_at, Some(at) if SystemTime::now() > at),
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|stored| stored.blob.clone())
    }

    async fn write(&self, key: &str, blob: Bytes, ttl: Option<Duration>) {
        let stored = StoredBlob {
            blob,
            expires_at: ttl.map(|ttl| SystemTime::now() + ttl),
        };
        self.lock().insert(key.to_owned(), stored);
    }

    async fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    async fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    async fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_delete() {
        let store = MemoryStore::new();
        store.write("k", Bytes::from_static(b"v"), None).await;
        assert_eq!(store.read("k").await, Some(Bytes::from_static(b"v")));

        store.delete("k").await;
        assert_eq!(store.read("k").await, None);
        // Deleting again is a no-op.
        store.delete("k").await;
    }

    #[tokio::test]
    async fn advisory_ttl_drops_expired_blobs() {
        let store = MemoryStore::new();
        store
            .write("k", Bytes::from_static(b"v"), Some(Duration::ZERO))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.read("k").await, None);
        assert!(store.keys().await.contains(&"k".to_string()) || store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn clear_wipes_everything() {
        let store = MemoryStore::new();
        store.write("a", Bytes::from_static(b"1"), None).await;
        store.write("b", Bytes::from_static(b"2"), None).await;
        store.clear().await;
        assert!(store.keys().await.is_empty());
    }
}
