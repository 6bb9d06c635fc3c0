//! Deterministic, content-addressed memoization of pipeline stages.
//!
//! Entries are keyed by [`Fingerprint`] and stored as JSON. Two tiers:
//! - an in-memory LRU bounded by `memory_capacity`
//! - an optional on-disk store, one `<fingerprint>.json` file per entry,
//!   written atomically (tmp + rename) and expired after `max_age_days`
//!
//! Concurrent callers asking for the same fingerprint are coalesced: one
//! computes, the rest wait and then read the stored payload. A failed
//! computation stores nothing and wakes the waiters, who retry.
//!
//! Unreadable or mismatched entries are counted, logged, and treated as
//! misses. Corruption never surfaces as an error.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pitfolio_core::domain::Fingerprint;

use crate::config::CacheSection;

/// Bump when the on-disk envelope changes shape.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to clear cache directory {path}: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub memory_capacity: usize,
    pub disk_dir: Option<PathBuf>,
    pub max_age_days: Option<u32>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            memory_capacity: 512,
            disk_dir: None,
            max_age_days: None,
        }
    }
}

impl From<&CacheSection> for CacheOptions {
    fn from(section: &CacheSection) -> Self {
        Self {
            memory_capacity: section.memory_capacity,
            disk_dir: section.cache_dir.clone(),
            max_age_days: section.max_cache_age_days,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub expired: u64,
    pub corrupt_recovered: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    corrupt_recovered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            corrupt_recovered: self.corrupt_recovered.load(Ordering::Relaxed),
        }
    }
}

/// On-disk entry layout.
#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    schema_version: u32,
    fingerprint: Fingerprint,
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
}

/// LRU over serialized payloads. `order` maps access tick → key.
#[derive(Default)]
struct MemoryTier {
    entries: HashMap<Fingerprint, (u64, Arc<Vec<u8>>)>,
    order: BTreeMap<u64, Fingerprint>,
    tick: u64,
}

impl MemoryTier {
    fn get(&mut self, key: &Fingerprint) -> Option<Arc<Vec<u8>>> {
        self.tick += 1;
        let tick = self.tick;
        let (old_tick, bytes) = self.entries.get_mut(key)?;
        self.order.remove(&*old_tick);
        *old_tick = tick;
        self.order.insert(tick, key.clone());
        Some(Arc::clone(bytes))
    }

    /// Insert and return the number of entries evicted.
    fn insert(&mut self, key: Fingerprint, bytes: Arc<Vec<u8>>, capacity: usize) -> u64 {
        self.tick += 1;
        if let Some((old_tick, _)) = self.entries.remove(&key) {
            self.order.remove(&old_tick);
        }
        self.order.insert(self.tick, key.clone());
        self.entries.insert(key, (self.tick, bytes));

        let mut evicted = 0;
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, key: &Fingerprint) {
        if let Some((tick, _)) = self.entries.remove(key) {
            self.order.remove(&tick);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// One in-progress computation that other callers can wait on.
#[derive(Default)]
struct InFlight {
    done: Mutex<bool>,
    cond: Condvar,
}

impl InFlight {
    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn complete(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }
}

/// Releases the in-flight slot even if the computation panics.
struct FlightGuard<'a> {
    cache: &'a RebalanceCache,
    key: &'a Fingerprint,
    flight: Arc<InFlight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(&self.cache.in_flight).remove(self.key);
        self.flight.complete();
    }
}

/// A poisoned lock only means another thread panicked mid-update of
/// bookkeeping that stays structurally valid, so keep going.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared handle: `Send + Sync`, pass by reference or wrap in `Arc`.
pub struct RebalanceCache {
    options: CacheOptions,
    memory: Mutex<MemoryTier>,
    in_flight: Mutex<HashMap<Fingerprint, Arc<InFlight>>>,
    counters: Counters,
}

impl std::fmt::Debug for RebalanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceCache")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RebalanceCache {
    /// Creates the cache. The disk directory is created if missing.
    pub fn new(options: CacheOptions) -> Result<Self, CacheError> {
        if let Some(dir) = &options.disk_dir {
            fs::create_dir_all(dir).map_err(|source| CacheError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            options: CacheOptions {
                memory_capacity: options.memory_capacity.max(1),
                ..options
            },
            memory: Mutex::new(MemoryTier::default()),
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self {
            options: CacheOptions {
                memory_capacity: capacity.max(1),
                ..CacheOptions::default()
            },
            memory: Mutex::new(MemoryTier::default()),
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Entries currently held in memory.
    pub fn len(&self) -> usize {
        lock(&self.memory).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entry files in the disk tier (0 without one).
    pub fn disk_entries(&self) -> usize {
        let Some(dir) = &self.options.disk_dir else {
            return 0;
        };
        match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| is_entry_file(&e.path()))
                .count(),
            Err(_) => 0,
        }
    }

    /// Return the payload for `key`, computing and storing it on a miss.
    ///
    /// The boolean is `true` when the value came from the cache.
    pub fn get_or_compute<T, E, F>(&self, key: &Fingerprint, compute: F) -> Result<(T, bool), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        let flight = loop {
            if let Some(value) = self.lookup(key) {
                Counters::bump(&self.counters.hits);
                return Ok((value, true));
            }

            let (flight, leader) = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get(key) {
                    Some(flight) => (Arc::clone(flight), false),
                    None => {
                        let flight = Arc::new(InFlight::default());
                        in_flight.insert(key.clone(), Arc::clone(&flight));
                        (flight, true)
                    }
                }
            };
            if leader {
                break flight;
            }
            debug!("cache {}: waiting on in-flight computation", short(key));
            flight.wait();
        };

        let _guard = FlightGuard {
            cache: self,
            key,
            flight,
        };

        // Another leader may have finished between the lookup and the claim.
        if let Some(value) = self.lookup(key) {
            Counters::bump(&self.counters.hits);
            return Ok((value, true));
        }

        Counters::bump(&self.counters.misses);
        let value = compute()?;
        self.store(key, &value);
        Ok((value, false))
    }

    /// Empty both tiers.
    pub fn clear(&self) -> Result<(), CacheError> {
        lock(&self.memory).clear();
        let Some(dir) = &self.options.disk_dir else {
            return Ok(());
        };
        let to_err = |source| CacheError::Clear {
            path: dir.clone(),
            source,
        };
        for entry in fs::read_dir(dir).map_err(to_err)? {
            let path = entry.map_err(to_err)?.path();
            if is_entry_file(&path) || is_tmp_file(&path) {
                fs::remove_file(&path).map_err(to_err)?;
            }
        }
        Ok(())
    }

    fn lookup<T: DeserializeOwned>(&self, key: &Fingerprint) -> Option<T> {
        let cached = lock(&self.memory).get(key);
        if let Some(bytes) = cached {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!("cache {}: unreadable memory entry, recomputing: {e}", short(key));
                    Counters::bump(&self.counters.corrupt_recovered);
                    lock(&self.memory).remove(key);
                }
            }
        }
        self.lookup_disk(key)
    }

    fn lookup_disk<T: DeserializeOwned>(&self, key: &Fingerprint) -> Option<T> {
        let path = self.entry_path(key)?;
        let bytes = fs::read(&path).ok()?;

        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.discard_corrupt(key, &path, &format!("unparseable envelope: {e}"));
                return None;
            }
        };
        if entry.schema_version != CACHE_SCHEMA_VERSION || &entry.fingerprint != key {
            self.discard_corrupt(key, &path, "schema or fingerprint mismatch");
            return None;
        }
        if let Some(days) = self.options.max_age_days {
            if Utc::now() - entry.created_at > Duration::days(i64::from(days)) {
                debug!("cache {}: entry older than {days} days, expiring", short(key));
                Counters::bump(&self.counters.expired);
                let _ = fs::remove_file(&path);
                return None;
            }
        }

        let payload = match serde_json::to_vec(&entry.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.discard_corrupt(key, &path, &format!("payload re-encode failed: {e}"));
                return None;
            }
        };
        match serde_json::from_slice::<T>(&payload) {
            Ok(value) => {
                self.remember(key, Arc::new(payload));
                Some(value)
            }
            Err(e) => {
                self.discard_corrupt(key, &path, &format!("payload does not match type: {e}"));
                None
            }
        }
    }

    fn discard_corrupt(&self, key: &Fingerprint, path: &Path, why: &str) {
        warn!("cache {}: discarding corrupt entry {}: {why}", short(key), path.display());
        Counters::bump(&self.counters.corrupt_recovered);
        let _ = fs::remove_file(path);
    }

    fn store<T: Serialize>(&self, key: &Fingerprint, value: &T) {
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("cache {}: payload not serializable, not caching: {e}", short(key));
                return;
            }
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cache {}: payload not serializable, not caching: {e}", short(key));
                return;
            }
        };
        Counters::bump(&self.counters.puts);
        self.remember(key, Arc::new(bytes));

        if let Some(path) = self.entry_path(key) {
            let entry = DiskEntry {
                schema_version: CACHE_SCHEMA_VERSION,
                fingerprint: key.clone(),
                created_at: Utc::now(),
                payload,
            };
            if let Err(e) = write_atomic(&path, &entry) {
                warn!("cache {}: disk write failed, memory only: {e}", short(key));
            }
        }
    }

    fn remember(&self, key: &Fingerprint, bytes: Arc<Vec<u8>>) {
        let evicted = lock(&self.memory).insert(key.clone(), bytes, self.options.memory_capacity);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    fn entry_path(&self, key: &Fingerprint) -> Option<PathBuf> {
        self.options
            .disk_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", key.as_str())))
    }
}

/// Write to `<path>.tmp` then rename over `path`.
fn write_atomic(path: &Path, entry: &DiskEntry) -> std::io::Result<()> {
    let json = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}

fn is_entry_file(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("json")
}

fn is_tmp_file(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("tmp")
}

fn short(key: &Fingerprint) -> &str {
    let s = key.as_str();
    &s[..s.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(s: &str) -> Fingerprint {
        Fingerprint::from_bytes(s.as_bytes())
    }

    #[test]
    fn miss_then_hit() {
        let cache = RebalanceCache::in_memory(8);
        let (v, hit) = cache
            .get_or_compute(&key("a"), || Ok::<_, String>(vec![1.5, 2.5]))
            .unwrap();
        assert!(!hit);
        assert_eq!(v, vec![1.5, 2.5]);

        let (v, hit) = cache
            .get_or_compute(&key("a"), || -> Result<Vec<f64>, String> { panic!("must not recompute") })
            .unwrap();
        assert!(hit);
        assert_eq!(v, vec![1.5, 2.5]);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.puts), (1, 1, 1));
    }

    #[test]
    fn failed_compute_is_not_cached() {
        let cache = RebalanceCache::in_memory(8);
        let err = cache
            .get_or_compute::<u32, _, _>(&key("a"), || Err("boom".to_string()))
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.is_empty());

        let (v, hit) = cache.get_or_compute(&key("a"), || Ok::<_, String>(7u32)).unwrap();
        assert_eq!((v, hit), (7, false));
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = RebalanceCache::in_memory(2);
        let put = |k: &str| cache.get_or_compute(&key(k), || Ok::<_, String>(k.to_string())).unwrap();
        put("a");
        put("b");
        put("a"); // touch a
        put("c"); // evicts b
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);

        let (_, hit_a) = put("a");
        let (_, hit_b) = put("b");
        assert!(hit_a);
        assert!(!hit_b);
    }

    #[test]
    fn type_mismatch_is_recovered_as_miss() {
        let cache = RebalanceCache::in_memory(8);
        cache.get_or_compute(&key("a"), || Ok::<_, String>("text".to_string())).unwrap();
        let (v, hit) = cache.get_or_compute(&key("a"), || Ok::<_, String>(42u64)).unwrap();
        assert_eq!((v, hit), (42, false));
        assert_eq!(cache.stats().corrupt_recovered, 1);
    }

    #[test]
    fn concurrent_callers_compute_once() {
        let cache = RebalanceCache::in_memory(8);
        let calls = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let (v, _) = cache
                        .get_or_compute(&key("shared"), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(50));
                            Ok::<_, String>(99u32)
                        })
                        .unwrap();
                    assert_eq!(v, 99);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 7);
    }

    #[test]
    fn waiters_retry_after_failed_leader() {
        let cache = RebalanceCache::in_memory(8);
        let calls = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _ = cache.get_or_compute(&key("flaky"), || {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        if n == 0 {
                            Err("first attempt fails".to_string())
                        } else {
                            Ok(n as u32)
                        }
                    });
                });
            }
        });
        // One failure, then exactly one successful computation.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().puts, 1);
    }

    #[test]
    fn hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < 1e-12);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
