//! Cache Store
//!
//! Content-addressable result cache with TTL expiry and LRU capacity bounds.
//!
//! The store keeps an in-memory index (expiry, recency, owning document) in
//! front of a byte-oriented [`CacheBackend`]. Backend I/O never happens while
//! the index lock is held. Expiry is lazy: entries are checked on read and
//! removed when found stale; [`CacheStore::purge_expired`] sweeps explicitly.
//!
//! Damaged records are never surfaced. A record that fails to decode is
//! logged, evicted and reported as a miss so the caller recomputes it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::{CacheBackend, CacheError, MemoryBackend};
use super::key::CacheKey;
use crate::error::CacheCorruption;

/// Cache tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied when `put` is not given one
    pub default_ttl: Duration,
    /// Entry count above which least-recently-used entries are evicted
    pub max_entries: usize,
    /// Persist records under this directory instead of in memory
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 60 * 60),
            max_entries: 10_000,
            directory: None,
        }
    }
}

/// A cache hit
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResult {
    /// Result payload as produced by the provider
    pub payload: Value,
    /// Identity of the provider that produced it
    pub produced_by: String,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Reads served from this entry, including this one
    pub access_count: u64,
}

/// Point-in-time cache counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Live index entries
    pub entries: usize,
    /// Reads answered from the cache
    pub hits: u64,
    /// Reads that found nothing usable
    pub misses: u64,
    /// Entries removed for capacity
    pub evictions: u64,
    /// Entries removed for TTL
    pub expirations: u64,
    /// Entries removed because they could not be decoded
    pub corruptions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    corruptions: AtomicU64,
}

/// On-backend record layout
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    content_hash: String,
    operation: String,
    produced_by: String,
    payload: Value,
    created_at: DateTime<Utc>,
    ttl_ms: u64,
}

struct IndexEntry {
    content_hash: String,
    expires_at: DateTime<Utc>,
    access_count: u64,
    tick: u64,
}

impl IndexEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Fingerprint -> entry plus a recency order for LRU eviction
#[derive(Default)]
struct Index {
    entries: HashMap<String, IndexEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Index {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn insert(&mut self, fingerprint: &str, content_hash: &str, expires_at: DateTime<Utc>) {
        let tick = self.bump();
        if let Some(old) = self.entries.insert(
            fingerprint.to_string(),
            IndexEntry {
                content_hash: content_hash.to_string(),
                expires_at,
                access_count: 0,
                tick,
            },
        ) {
            self.recency.remove(&old.tick);
        }
        self.recency.insert(tick, fingerprint.to_string());
    }

    fn touch(&mut self, fingerprint: &str) -> Option<u64> {
        let tick = self.bump();
        let entry = self.entries.get_mut(fingerprint)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        entry.access_count += 1;
        self.recency.insert(tick, fingerprint.to_string());
        Some(entry.access_count)
    }

    fn remove(&mut self, fingerprint: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<String> {
        let (_, fingerprint) = self.recency.pop_first()?;
        self.entries.remove(&fingerprint);
        Some(fingerprint)
    }
}

fn expiry(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result cache
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    index: Mutex<Index>,
    counters: Counters,
}

impl CacheStore {
    /// In-memory store
    #[must_use]
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()), config)
    }

    /// Store over an empty backend; existing records are not indexed
    pub fn with_backend(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            index: Mutex::new(Index::default()),
            counters: Counters::default(),
        }
    }

    /// Store over a backend that may already hold records
    ///
    /// The index is rebuilt oldest-first, so older records are evicted first
    /// if the backend holds more than `max_entries`. Expired and damaged
    /// records are deleted.
    ///
    /// # Errors
    ///
    /// Propagates failures to list the backend's keys.
    pub fn open(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Result<Self, CacheError> {
        let store = Self::with_backend(backend, config);
        let now = Utc::now();

        let mut live = Vec::new();
        let mut dropped = Vec::new();
        for fingerprint in store.backend.keys()? {
            match store.backend.get(&fingerprint) {
                Ok(Some(bytes)) => match serde_json::from_slice::<StoredRecord>(&bytes) {
                    Ok(record) => {
                        let expires_at =
                            expiry(record.created_at, Duration::from_millis(record.ttl_ms));
                        if now >= expires_at {
                            dropped.push(fingerprint);
                        } else {
                            live.push((
                                record.created_at,
                                fingerprint,
                                record.content_hash,
                                expires_at,
                            ));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            cache_key = %fingerprint,
                            error = %e,
                            "Dropping undecodable cache record"
                        );
                        store.counters.corruptions.fetch_add(1, Ordering::Relaxed);
                        dropped.push(fingerprint);
                    }
                },
                Ok(None) => {}
                Err(CacheError::Corrupt(c)) => {
                    tracing::warn!(
                        cache_key = %fingerprint,
                        reason = %c.reason,
                        "Dropping corrupt cache record"
                    );
                    store.counters.corruptions.fetch_add(1, Ordering::Relaxed);
                    dropped.push(fingerprint);
                }
                Err(e) => return Err(e),
            }
        }

        live.sort_by(|a, b| a.0.cmp(&b.0));
        let loaded = live.len();
        let evicted = {
            let mut index = store.index.lock();
            for (_, fingerprint, content_hash, expires_at) in &live {
                index.insert(fingerprint, content_hash, *expires_at);
            }
            store.collect_overflow(&mut index)
        };
        dropped.extend(evicted);
        store.delete_records(&dropped);

        tracing::info!(
            backend = store.backend.name(),
            loaded,
            dropped = dropped.len(),
            "Cache index rebuilt"
        );
        Ok(store)
    }

    /// Look up a key
    ///
    /// Expired entries and undecodable records count as misses and are removed.
    pub fn get(&self, key: &CacheKey) -> Option<CachedResult> {
        let fingerprint = key.fingerprint();

        let expired = {
            let mut index = self.index.lock();
            let expired = index
                .entries
                .get(fingerprint)
                .map(|entry| entry.is_expired(Utc::now()));
            if expired == Some(true) {
                index.remove(fingerprint);
            }
            expired
        };
        match expired {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(true) => {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = %key, "Cache entry expired");
                self.delete_records(&[fingerprint.to_string()]);
                return None;
            }
            Some(false) => {}
        }

        let record = match self.backend.get(fingerprint) {
            Ok(Some(bytes)) => self.decode(key, &bytes),
            Ok(None) => {
                // Index outlived the record, e.g. an eviction raced a rewrite
                self.index.lock().remove(fingerprint);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(CacheError::Corrupt(c)) => Err(c),
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Cache read failed");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match record {
            Ok(record) => {
                let Some(access_count) = self.index.lock().touch(fingerprint) else {
                    // Invalidated while we were reading
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                };
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(CachedResult {
                    payload: record.payload,
                    produced_by: record.produced_by,
                    created_at: record.created_at,
                    access_count,
                })
            }
            Err(corruption) => {
                tracing::warn!(
                    cache_key = %key,
                    reason = %corruption.reason,
                    "Evicting corrupt cache entry"
                );
                self.index.lock().remove(fingerprint);
                self.delete_records(&[fingerprint.to_string()]);
                self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn decode(&self, key: &CacheKey, bytes: &[u8]) -> Result<StoredRecord, CacheCorruption> {
        let record: StoredRecord =
            serde_json::from_slice(bytes).map_err(|e| CacheCorruption {
                key: key.fingerprint().to_string(),
                reason: e.to_string(),
            })?;
        if record.content_hash != key.content_hash() || record.operation != key.operation() {
            return Err(CacheCorruption {
                key: key.fingerprint().to_string(),
                reason: "record does not belong to this key".to_string(),
            });
        }
        Ok(record)
    }

    /// Store a result, replacing any previous entry for the key
    ///
    /// # Errors
    ///
    /// Propagates backend write failures; the index is left unchanged.
    pub fn put(
        &self,
        key: &CacheKey,
        payload: &Value,
        produced_by: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let created_at = Utc::now();
        let record = StoredRecord {
            content_hash: key.content_hash().to_string(),
            operation: key.operation().to_string(),
            produced_by: produced_by.to_string(),
            payload: payload.clone(),
            created_at,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.backend.put(key.fingerprint(), &bytes)?;

        let evicted = {
            let mut index = self.index.lock();
            index.insert(key.fingerprint(), key.content_hash(), expiry(created_at, ttl));
            self.collect_overflow(&mut index)
        };
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted least recently used cache entries");
            self.delete_records(&evicted);
        }
        Ok(())
    }

    fn collect_overflow(&self, index: &mut Index) -> Vec<String> {
        let mut evicted = Vec::new();
        while index.entries.len() > self.config.max_entries {
            match index.pop_lru() {
                Some(fingerprint) => evicted.push(fingerprint),
                None => break,
            }
        }
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    fn delete_records(&self, fingerprints: &[String]) {
        for fingerprint in fingerprints {
            if let Err(e) = self.backend.delete(fingerprint) {
                tracing::warn!(
                    cache_key = %fingerprint,
                    error = %e,
                    "Failed to delete cache record"
                );
            }
        }
    }

    /// Remove every entry for a document, across all operations
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, content_hash: &str) -> usize {
        let removed: Vec<String> = {
            let mut index = self.index.lock();
            let matching: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, entry)| entry.content_hash == content_hash)
                .map(|(fingerprint, _)| fingerprint.clone())
                .collect();
            for fingerprint in &matching {
                index.remove(fingerprint);
            }
            matching
        };
        self.delete_records(&removed);
        tracing::debug!(content_hash, removed = removed.len(), "Invalidated document");
        removed.len()
    }

    /// Remove a single entry; returns whether it existed
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        let existed = self.index.lock().remove(key.fingerprint()).is_some();
        if existed {
            self.delete_records(&[key.fingerprint().to_string()]);
        }
        existed
    }

    /// Remove every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut index = self.index.lock();
            let stale: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(fingerprint, _)| fingerprint.clone())
                .collect();
            for fingerprint in &stale {
                index.remove(fingerprint);
            }
            stale
        };
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.delete_records(&expired);
        expired.len()
    }

    /// Remove everything
    pub fn clear(&self) {
        let all: Vec<String> = {
            let mut index = self.index.lock();
            let all = index.entries.keys().cloned().collect();
            *index = Index::default();
            all
        };
        self.delete_records(&all);
    }

    /// Number of indexed entries (expired entries not yet swept included)
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TTL applied when none is given
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Name of the storage backend
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            corruptions: self.counters.corruptions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::DiskBackend;
    use crate::document::{DocumentDescriptor, DocumentSource};
    use serde_json::json;
    use tempfile::TempDir;

    fn key(hash: &str, operation: &str) -> CacheKey {
        let doc = DocumentDescriptor::from_parts(hash, "pdf", 10, DocumentSource::Inline);
        CacheKey::new(&doc, operation, &json!({})).unwrap()
    }

    fn store(max_entries: usize) -> CacheStore {
        CacheStore::in_memory(CacheConfig {
            max_entries,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_put_then_get() {
        let cache = store(10);
        let k = key("abc", "deep-analysis");
        assert!(cache.get(&k).is_none());

        cache.put(&k, &json!({"summary": "ok"}), "deep-remote", None).unwrap();
        let hit = cache.get(&k).unwrap();
        assert_eq!(hit.payload, json!({"summary": "ok"}));
        assert_eq!(hit.produced_by, "deep-remote");
        assert_eq!(hit.access_count, 1);
        assert_eq!(cache.get(&k).unwrap().access_count, 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = store(10);
        let k = key("abc", "op");
        cache
            .put(&k, &json!(1), "p", Some(Duration::from_millis(30)))
            .unwrap();
        assert!(cache.get(&k).is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&k).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_prefers_least_recently_read() {
        let cache = store(2);
        let (a, b, c) = (key("a", "op"), key("b", "op"), key("c", "op"));
        cache.put(&a, &json!("a"), "p", None).unwrap();
        cache.put(&b, &json!("b"), "p", None).unwrap();

        // Reading `a` makes `b` the least recently used
        assert!(cache.get(&a).is_some());
        cache.put(&c, &json!("c"), "p", None).unwrap();

        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_by_content_hash() {
        let cache = store(10);
        cache.put(&key("abc", "extract-text"), &json!(1), "p", None).unwrap();
        cache.put(&key("abc", "extract-tables"), &json!(2), "p", None).unwrap();
        cache.put(&key("other", "extract-text"), &json!(3), "p", None).unwrap();

        assert_eq!(cache.invalidate("abc"), 2);
        assert!(cache.get(&key("abc", "extract-text")).is_none());
        assert!(cache.get(&key("abc", "extract-tables")).is_none());
        assert!(cache.get(&key("other", "extract-text")).is_some());
        assert_eq!(cache.invalidate("abc"), 0);
    }

    #[test]
    fn test_invalidate_key() {
        let cache = store(10);
        let k = key("abc", "op");
        cache.put(&k, &json!(1), "p", None).unwrap();
        assert!(cache.invalidate_key(&k));
        assert!(!cache.invalidate_key(&k));
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_corrupt_record_is_a_miss_and_evicted() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheStore::with_backend(backend.clone(), CacheConfig::default());
        let k = key("abc", "op");
        cache.put(&k, &json!(1), "p", None).unwrap();

        backend.put_raw(k.fingerprint(), b"{not json".to_vec());
        assert!(cache.get(&k).is_none());
        assert!(cache.is_empty());
        assert_eq!(backend.get(k.fingerprint()).unwrap(), None);
        assert_eq!(cache.stats().corruptions, 1);

        // Recomputed entry works again
        cache.put(&k, &json!(2), "p", None).unwrap();
        assert_eq!(cache.get(&k).unwrap().payload, json!(2));
    }

    #[test]
    fn test_purge_expired() {
        let cache = store(10);
        cache
            .put(&key("a", "op"), &json!(1), "p", Some(Duration::from_millis(10)))
            .unwrap();
        cache.put(&key("b", "op"), &json!(2), "p", None).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_open_rebuilds_from_disk() {
        let dir = TempDir::new().unwrap();
        let k = key("abc", "op");
        {
            let backend = Arc::new(DiskBackend::open(dir.path()).unwrap());
            let cache = CacheStore::open(backend, CacheConfig::default()).unwrap();
            cache.put(&k, &json!({"v": 1}), "fast-local", None).unwrap();
            cache
                .put(&key("old", "op"), &json!(0), "p", Some(Duration::from_millis(1)))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(10));
        std::fs::write(dir.path().join("deadbeef.entry"), b"garbage").unwrap();

        let backend = Arc::new(DiskBackend::open(dir.path()).unwrap());
        let cache = CacheStore::open(backend.clone(), CacheConfig::default()).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().corruptions, 1);
        assert_eq!(backend.keys().unwrap(), vec![k.fingerprint().to_string()]);

        let hit = cache.get(&k).unwrap();
        assert_eq!(hit.produced_by, "fast-local");
        assert_eq!(hit.payload, json!({"v": 1}));
    }

    #[test]
    fn test_clear() {
        let cache = store(10);
        cache.put(&key("a", "op"), &json!(1), "p", None).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&key("a", "op")).is_none());
    }
}
