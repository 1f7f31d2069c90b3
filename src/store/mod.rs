//! Two-tier cache storage.
//!
//! [`CacheStore`] owns a small, bounded in-memory hot tier and delegates to
//! a [`PersistentStore`] backend for the durable tier. It is the authority
//! on TTL expiry, performs size-bounded eviction on both tiers, and handles
//! pattern/namespace invalidation and corrupted-entry self-healing.
//!
//! Both tiers keep incremental byte accounting: sizes are adjusted on every
//! put/delete, never recomputed by rescanning — except for pattern and
//! namespace sweeps, which reconcile against the backend's key listing so
//! entries written by earlier process lifetimes are still found.

pub mod backend;

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::key::{RequestKey, namespace_of};
use crate::record::CacheRecord;

pub use backend::{MemoryStore, PersistentStore};

/// Tunables for both cache tiers.
///
/// The hot tier is capped at a fraction of the total byte budget plus a hard
/// entry ceiling; the persistent tier is capped at the total budget and
/// evicted down to the low-water fraction once exceeded (hysteresis, so a
/// single put at the boundary does not thrash).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Absolute byte budget for the persistent tier.
    pub total_size_budget: usize,
    /// Fraction of the total budget granted to the hot tier.
    pub hot_tier_fraction: f64,
    /// Hard cap on hot-tier entry count, independent of byte size.
    pub hot_entry_ceiling: usize,
    /// Fraction of the budget to evict down to once the persistent tier
    /// exceeds it.
    pub persistent_low_water: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_size_budget: 50 * 1024 * 1024,
            hot_tier_fraction: 0.2,
            hot_entry_ceiling: 256,
            persistent_low_water: 0.9,
        }
    }
}

impl CacheConfig {
    /// Byte cap of the hot tier.
    pub fn hot_byte_cap(&self) -> usize {
        (self.total_size_budget as f64 * self.hot_tier_fraction) as usize
    }

    /// Byte level the persistent tier is swept down to after overflowing.
    pub fn persistent_eviction_target(&self) -> usize {
        (self.total_size_budget as f64 * self.persistent_low_water) as usize
    }

    fn hot_entry_ceiling_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.hot_entry_ceiling).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Entry/byte counts for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierStats {
    pub entries: usize,
    pub bytes: usize,
}

/// A point-in-time snapshot of both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hot: TierStats,
    pub persistent: TierStats,
}

/// Hot-tier map plus its running byte counter.
///
/// The [`LruCache`] is used strictly in insertion order: reads go through
/// `peek` (no recency bump), so `pop_lru` always removes the
/// least-recently-inserted entry. This is the deliberate insertion-order
/// approximation of LRU, not true access-time LRU.
struct HotTier {
    entries: LruCache<String, CacheRecord>,
    bytes: usize,
}

impl HotTier {
    fn new(config: &CacheConfig) -> Self {
        Self {
            entries: LruCache::new(config.hot_entry_ceiling_non_zero()),
            bytes: 0,
        }
    }

    fn insert(&mut self, record: CacheRecord, byte_cap: usize) {
        let key = record.canonical_key().to_owned();
        self.bytes += record.size_bytes();

        // `push` hands back either the value replaced under `key` or the
        // oldest entry displaced by the entry-count ceiling.
        if let Some((_, displaced)) = self.entries.push(key, record) {
            self.bytes = self.bytes.saturating_sub(displaced.size_bytes());
        }

        while self.bytes > byte_cap {
            match self.entries.pop_lru() {
                Some((_, victim)) => {
                    self.bytes = self.bytes.saturating_sub(victim.size_bytes());
                }
                None => {
                    self.bytes = 0;
                    break;
                }
            }
        }
    }

    fn remove(&mut self, canonical: &str) -> bool {
        match self.entries.pop(canonical) {
            Some(removed) => {
                self.bytes = self.bytes.saturating_sub(removed.size_bytes());
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Per-key size index for the persistent tier, so eviction never rescans
/// the backend.
#[derive(Default)]
struct PersistentIndex {
    sizes: HashMap<String, usize>,
    bytes: usize,
}

impl PersistentIndex {
    fn record_write(&mut self, canonical: &str, size: usize) {
        if let Some(old) = self.sizes.insert(canonical.to_owned(), size) {
            self.bytes = self.bytes.saturating_sub(old);
        }
        self.bytes += size;
    }

    fn record_delete(&mut self, canonical: &str) -> bool {
        match self.sizes.remove(canonical) {
            Some(size) => {
                self.bytes = self.bytes.saturating_sub(size);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.sizes.clear();
        self.bytes = 0;
    }

    /// Picks eviction victims, largest entries first, until the tracked size
    /// would drop to `target`.
    ///
    /// Largest-first is kept from the original engine on purpose: it trades
    /// recency-of-use fidelity for fewer deletions per sweep. Callers may
    /// depend on that trade-off, so it is not "fixed" to LRU/LFU here.
    fn plan_eviction(&self, target: usize) -> Vec<String> {
        let mut entries: Vec<(&String, &usize)> = self.sizes.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        let mut victims = Vec::new();
        let mut projected = self.bytes;
        for (key, size) in entries {
            if projected <= target {
                break;
            }
            projected = projected.saturating_sub(*size);
            victims.push(key.clone());
        }
        victims
    }
}

/// The two-tier cache store.
///
/// All shared mutable state (the hot map and the size index) sits behind a
/// single mutex each; locks are never held across an await into the backend.
pub struct CacheStore {
    config: CacheConfig,
    backend: Arc<dyn PersistentStore>,
    hot: Mutex<HotTier>,
    index: Mutex<PersistentIndex>,
}

impl CacheStore {
    /// Creates a store over the given backend.
    pub fn new(config: CacheConfig, backend: Arc<dyn PersistentStore>) -> Self {
        Self {
            hot: Mutex::new(HotTier::new(&config)),
            index: Mutex::new(PersistentIndex::default()),
            config,
            backend,
        }
    }

    /// Creates a store with default tunables over an in-process backend.
    pub fn in_memory() -> Self {
        Self::new(CacheConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Looks up a non-expired record.
    ///
    /// Checks the hot tier first, then the persistent tier; a persistent hit
    /// repopulates the hot tier. An expired hot-tier entry is silently
    /// skipped — not deleted — so [`get_stale`](Self::get_stale) can still
    /// retrieve it for stale-while-revalidate flows.
    pub async fn get(&self, key: &RequestKey) -> Option<CacheRecord> {
        let canonical = key.canonical();

        match self.hot_lookup(canonical) {
            HotLookup::Fresh(record) => {
                debug!(key = canonical, tier = "hot", "cache hit");
                return Some(record);
            }
            HotLookup::Expired(_) => {
                debug!(key = canonical, tier = "hot", "expired entry skipped");
                return None;
            }
            HotLookup::Miss => {}
        }

        let record = self.read_persistent(canonical).await?;
        if record.is_expired() {
            debug!(key = canonical, tier = "persistent", "expired entry skipped");
            return None;
        }

        debug!(key = canonical, tier = "persistent", "cache hit");
        self.lock_hot().insert(record.clone(), self.config.hot_byte_cap());
        Some(record)
    }

    /// Looks up a record regardless of expiry.
    ///
    /// Used by stale-while-revalidate and stale-on-error fallbacks.
    pub async fn get_stale(&self, key: &RequestKey) -> Option<CacheRecord> {
        let canonical = key.canonical();

        match self.hot_lookup(canonical) {
            HotLookup::Fresh(record) | HotLookup::Expired(record) => return Some(record),
            HotLookup::Miss => {}
        }

        self.read_persistent(canonical).await
    }

    /// Inserts or replaces a record in both tiers.
    ///
    /// The persistent write carries the record's remaining TTL (absent for
    /// non-expiring records, which live until evicted by size pressure).
    /// Triggers the persistent-tier eviction check afterward.
    pub async fn put(&self, record: CacheRecord) {
        let canonical = record.canonical_key().to_owned();
        let blob = record.to_bytes();
        let blob_len = blob.len();
        let ttl = record.remaining_ttl();

        self.lock_hot().insert(record, self.config.hot_byte_cap());
        self.backend.write(&canonical, blob, ttl).await;

        let victims = {
            let mut index = self.lock_index();
            index.record_write(&canonical, blob_len);
            if index.bytes > self.config.total_size_budget {
                let victims = index.plan_eviction(self.config.persistent_eviction_target());
                for victim in &victims {
                    index.record_delete(victim);
                }
                victims
            } else {
                Vec::new()
            }
        };

        for victim in victims {
            debug!(key = %victim, "evicting persistent entry (size pressure)");
            self.backend.delete(&victim).await;
        }
    }

    /// Removes a record from both tiers.
    ///
    /// Idempotent: returns `true` only if something was actually removed.
    pub async fn delete(&self, key: &RequestKey) -> bool {
        self.delete_canonical(key.canonical()).await
    }

    async fn delete_canonical(&self, canonical: &str) -> bool {
        let hot_removed = self.lock_hot().remove(canonical);
        let tracked = self.lock_index().record_delete(canonical);
        self.backend.delete(canonical).await;
        hot_removed || tracked
    }

    /// Removes every record whose canonical key matches `pattern`.
    ///
    /// Returns the number of keys removed.
    pub async fn delete_pattern(&self, pattern: &Regex) -> usize {
        self.sweep(|key| pattern.is_match(key), false).await
    }

    /// Pattern removal scoped by expiry: with `only_expired`, fresh matches
    /// are left in place.
    pub async fn delete_pattern_filtered(&self, pattern: &Regex, only_expired: bool) -> usize {
        self.sweep(|key| pattern.is_match(key), only_expired).await
    }

    /// Removes every record whose namespace — the first colon-delimited
    /// segment of the canonical key — starts with `prefix`.
    pub async fn delete_namespace(&self, prefix: &str) -> usize {
        self.sweep(|key| namespace_of(key).starts_with(prefix), false)
            .await
    }

    /// Namespace removal scoped by expiry, as
    /// [`delete_pattern_filtered`](Self::delete_pattern_filtered).
    pub async fn delete_namespace_filtered(&self, prefix: &str, only_expired: bool) -> usize {
        self.sweep(|key| namespace_of(key).starts_with(prefix), only_expired)
            .await
    }

    /// Wipes both tiers entirely. Idempotent.
    pub async fn clear(&self) {
        self.lock_hot().clear();
        self.lock_index().clear();
        self.backend.clear().await;
    }

    /// Scans for expired records and removes them, optionally scoped to a
    /// namespace prefix. Returns the number removed.
    pub async fn cleanup_expired(&self, namespace: Option<&str>) -> usize {
        let removed = self
            .sweep(
                |key| match namespace {
                    Some(prefix) => namespace_of(key).starts_with(prefix),
                    None => true,
                },
                true,
            )
            .await;
        if removed > 0 {
            debug!(removed, "expired cache entries cleaned up");
        }
        removed
    }

    /// Returns current entry/byte counts for both tiers.
    pub fn stats(&self) -> CacheStats {
        let hot = self.lock_hot();
        let index = self.lock_index();
        CacheStats {
            hot: TierStats {
                entries: hot.entries.len(),
                bytes: hot.bytes,
            },
            persistent: TierStats {
                entries: index.sizes.len(),
                bytes: index.bytes,
            },
        }
    }

    fn hot_lookup(&self, canonical: &str) -> HotLookup {
        let hot = self.lock_hot();
        match hot.entries.peek(canonical) {
            Some(record) if !record.is_expired() => HotLookup::Fresh(record.clone()),
            Some(record) => HotLookup::Expired(record.clone()),
            None => HotLookup::Miss,
        }
    }

    /// Reads and decodes a persistent blob; a blob that fails to decode is
    /// treated as a miss and deleted (self-healing).
    async fn read_persistent(&self, canonical: &str) -> Option<CacheRecord> {
        let blob = self.backend.read(canonical).await?;
        match CacheRecord::from_bytes(blob) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(key = canonical, error = %error, "corrupted cache entry deleted");
                self.lock_index().record_delete(canonical);
                self.backend.delete(canonical).await;
                None
            }
        }
    }

    /// Removes every key accepted by `matches` from both tiers.
    ///
    /// Candidates are the union of hot keys, tracked persistent keys, and
    /// the backend's own listing (the one place a reconciling scan is
    /// allowed, since the backend may hold keys this process never tracked).
    async fn sweep<F>(&self, matches: F, only_expired: bool) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let backend_keys: BTreeSet<String> = self.backend.keys().await.into_iter().collect();
        let mut candidates = backend_keys.clone();
        candidates.extend(self.lock_hot().keys());
        candidates.extend(self.lock_index().sizes.keys().cloned());

        let mut removed = 0;
        for canonical in candidates {
            if !matches(&canonical) {
                continue;
            }

            if only_expired {
                match self.hot_lookup(&canonical) {
                    HotLookup::Fresh(_) => continue,
                    HotLookup::Expired(_) => {}
                    HotLookup::Miss => match self.read_persistent(&canonical).await {
                        Some(record) if record.is_expired() => {}
                        Some(_) => continue,
                        // The backend already dropped the blob (advisory
                        // TTL) or the read healed a corrupt entry. Purge any
                        // leftover index entry so tracked sizes stay honest.
                        None => {
                            self.delete_canonical(&canonical).await;
                            removed += 1;
                            continue;
                        }
                    },
                }
            }

            // A key known only from the backend listing is untracked in
            // both tiers, so `delete_canonical` reports nothing removed;
            // deleting it still counts.
            if self.delete_canonical(&canonical).await || backend_keys.contains(&canonical) {
                removed += 1;
            }
        }
        removed
    }

    fn lock_hot(&self) -> MutexGuard<'_, HotTier> {
        match self.hot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("recovered from poisoned hot-tier lock");
                poisoned.into_inner()
            }
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, PersistentIndex> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("recovered from poisoned size-index lock");
                poisoned.into_inner()
            }
        }
    }
}

enum HotLookup {
    Fresh(CacheRecord),
    Expired(CacheRecord),
    Miss,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RawResponse, RequestDescriptor};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Backend wrapper that counts reads, for asserting tier behavior.
    struct CountingStore {
        inner: MemoryStore,
        reads: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl PersistentStore for CountingStore {
        async fn read(&self, key: &str) -> Option<Bytes> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(key).await
        }
        async fn write(&self, key: &str, blob: Bytes, ttl: Option<Duration>) {
            self.inner.write(key, blob, ttl).await;
        }
        async fn delete(&self, key: &str) {
            self.inner.delete(key).await;
        }
        async fn keys(&self) -> Vec<String> {
            self.inner.keys().await
        }
        async fn clear(&self) {
            self.inner.clear().await;
        }
    }

    fn key_for(url: &str) -> RequestKey {
        RequestKey::for_request(&RequestDescriptor::get(url))
    }

    fn record_for(url: &str, body_len: usize, ttl: Option<Duration>) -> CacheRecord {
        let key = key_for(url);
        let response = RawResponse::new(200).body(Bytes::from(vec![b'x'; body_len]));
        CacheRecord::from_response(&key, &response, ttl)
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            total_size_budget: 4096,
            hot_tier_fraction: 0.25,
            hot_entry_ceiling: 8,
            persistent_low_water: 0.9,
        }
    }

    #[tokio::test]
    async fn hot_hit_never_touches_backend() {
        let backend = Arc::new(CountingStore::new());
        let store = CacheStore::new(CacheConfig::default(), backend.clone());

        store.put(record_for("/a", 10, None)).await;
        assert!(store.get(&key_for("/a")).await.is_some());
        assert_eq!(backend.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistent_hit_repopulates_hot_tier() {
        let backend = Arc::new(CountingStore::new());
        let store = CacheStore::new(CacheConfig::default(), backend.clone());

        store.put(record_for("/a", 10, None)).await;
        // Drop the hot copy; the persistent copy remains.
        store.lock_hot().clear();

        assert!(store.get(&key_for("/a")).await.is_some());
        assert_eq!(backend.reads.load(Ordering::SeqCst), 1);

        // Second read is served hot again.
        assert!(store.get(&key_for("/a")).await.is_some());
        assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_records_miss_but_remain_stale_readable() {
        let store = CacheStore::in_memory();
        store
            .put(record_for("/a", 10, Some(Duration::ZERO)))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(store.get(&key_for("/a")).await.is_none());
        assert!(store.get_stale(&key_for("/a")).await.is_some());
    }

    #[tokio::test]
    async fn hot_eviction_removes_oldest_inserted_first() {
        let config = small_config();
        let hot_cap = config.hot_byte_cap();
        let store = CacheStore::new(config, Arc::new(MemoryStore::new()));

        // Each record is ~400 bytes charged; the cap fits two comfortably
        // but not four.
        for url in ["/one", "/two", "/three", "/four"] {
            store.put(record_for(url, 300, None)).await;
        }

        let stats = store.stats();
        assert!(stats.hot.bytes <= hot_cap, "hot tier over cap after put");

        let hot = store.lock_hot();
        assert!(!hot.entries.contains("GET:/one"));
        assert!(hot.entries.contains("GET:/four"));
    }

    #[tokio::test]
    async fn hot_entry_ceiling_enforced() {
        let config = CacheConfig {
            hot_entry_ceiling: 2,
            ..CacheConfig::default()
        };
        let store = CacheStore::new(config, Arc::new(MemoryStore::new()));

        for url in ["/one", "/two", "/three"] {
            store.put(record_for(url, 10, None)).await;
        }
        assert_eq!(store.stats().hot.entries, 2);
    }

    #[tokio::test]
    async fn persistent_eviction_prefers_largest_entries() {
        let config = CacheConfig {
            total_size_budget: 2000,
            hot_tier_fraction: 0.2,
            hot_entry_ceiling: 8,
            persistent_low_water: 0.9,
        };
        let store = CacheStore::new(config, Arc::new(MemoryStore::new()));

        store.put(record_for("/small", 50, None)).await;
        store.put(record_for("/large", 1500, None)).await;
        // Pushes the tier over 2000 tracked bytes; the sweep should drop the
        // largest entry rather than the oldest.
        store.put(record_for("/medium", 600, None)).await;

        let index = store.lock_index();
        assert!(!index.sizes.contains_key("GET:/large"));
        assert!(index.sizes.contains_key("GET:/small"));
        assert!(index.bytes <= 2000);
    }

    #[tokio::test]
    async fn corrupted_blob_is_healed() {
        let backend = Arc::new(MemoryStore::new());
        let store = CacheStore::new(CacheConfig::default(), backend.clone());

        backend
            .write("GET:/bad", Bytes::from_static(b"\xff\xfegarbage"), None)
            .await;

        assert!(store.get(&key_for("/bad")).await.is_none());
        assert!(backend.read("GET:/bad").await.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = CacheStore::in_memory();
        store.put(record_for("/a", 10, None)).await;

        assert!(store.delete(&key_for("/a")).await);
        assert!(!store.delete(&key_for("/a")).await);

        // clear() on an empty store never errors.
        store.clear().await;
        store.clear().await;
        assert_eq!(store.stats().hot.entries, 0);
    }

    #[tokio::test]
    async fn pattern_deletion_spans_both_tiers() {
        let store = CacheStore::in_memory();
        store.put(record_for("/posts/1", 10, None)).await;
        store.put(record_for("/posts/2", 10, None)).await;
        store.put(record_for("/users/1", 10, None)).await;

        let pattern = Regex::new(r"^GET:/posts/").unwrap();
        assert_eq!(store.delete_pattern(&pattern).await, 2);

        assert!(store.get(&key_for("/posts/1")).await.is_none());
        assert!(store.get(&key_for("/users/1")).await.is_some());
    }

    #[tokio::test]
    async fn namespace_deletion_matches_first_segment() {
        let store = CacheStore::in_memory();
        store.put(record_for("/a", 10, None)).await;

        let post_key =
            RequestKey::for_request(&RequestDescriptor::new(crate::http::Method::Post, "/a"));
        let response = RawResponse::new(201).body(Bytes::from_static(b"created"));
        store
            .put(CacheRecord::from_response(&post_key, &response, None))
            .await;

        assert_eq!(store.delete_namespace("GET").await, 1);
        assert!(store.get(&key_for("/a")).await.is_none());
        assert!(store.get(&post_key).await.is_some());
    }

    #[tokio::test]
    async fn filtered_deletion_scopes_to_expired() {
        let store = CacheStore::in_memory();
        store
            .put(record_for("/stale", 10, Some(Duration::ZERO)))
            .await;
        store.put(record_for("/fresh", 10, None)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pattern = Regex::new(r"^GET:").unwrap();
        assert_eq!(store.delete_pattern_filtered(&pattern, true).await, 1);
        assert!(store.get(&key_for("/fresh")).await.is_some());
        assert!(store.get_stale(&key_for("/stale")).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_expired_counts_removals() {
        let store = CacheStore::in_memory();
        store
            .put(record_for("/a", 10, Some(Duration::ZERO)))
            .await;
        store
            .put(record_for("/b", 10, Some(Duration::ZERO)))
            .await;
        store.put(record_for("/c", 10, None)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.cleanup_expired(None).await, 2);
        assert_eq!(store.cleanup_expired(None).await, 0);
        assert!(store.get(&key_for("/c")).await.is_some());
    }

    #[tokio::test]
    async fn cleanup_purges_index_when_backend_dropped_expired_blob() {
        let config = CacheConfig {
            hot_entry_ceiling: 1,
            ..CacheConfig::default()
        };
        let store = CacheStore::new(config, Arc::new(MemoryStore::new()));

        store
            .put(record_for("/stale", 10, Some(Duration::ZERO)))
            .await;
        // Displaces /stale from the hot tier, so the cleanup scan has to go
        // through the backend, which drops the expired blob on read.
        store.put(record_for("/fresh", 10, None)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.cleanup_expired(None).await, 1);

        // The size index must not keep a ghost entry for the dropped blob.
        let stats = store.stats();
        assert_eq!(stats.persistent.entries, 1);
        assert!(store.get(&key_for("/fresh")).await.is_some());
        assert_eq!(store.cleanup_expired(None).await, 0);
    }

    #[tokio::test]
    async fn sweep_counts_entries_persisted_by_earlier_lifetimes() {
        let backend = Arc::new(MemoryStore::new());

        // A record written by a previous process: present in the backend but
        // never tracked by this store's index or hot tier.
        let record = record_for("/old", 10, None);
        backend
            .write(record.canonical_key(), record.to_bytes(), None)
            .await;

        let store = CacheStore::new(CacheConfig::default(), backend.clone());
        let pattern = Regex::new(r"^GET:/old$").unwrap();
        assert_eq!(store.delete_pattern(&pattern).await, 1);
        assert!(backend.read("GET:/old").await.is_none());
    }

    #[test]
    fn tracked_sizes_survive_replacement() {
        let mut index = PersistentIndex::default();
        index.record_write("k", 100);
        index.record_write("k", 40);
        assert_eq!(index.bytes, 40);
        assert!(index.record_delete("k"));
        assert_eq!(index.bytes, 0);
        assert!(!index.record_delete("k"));
    }
}
