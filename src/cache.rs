//! Content-addressed build cache.
//!
//! Critical-CSS extraction and bundle compression are the expensive parts of
//! a build: every bundle is compressed once per candidate asset set while the
//! builder searches for a set that fits the budget. This module lets a build
//! skip that work when its inputs haven't changed since a previous build.
//!
//! # Design
//!
//! ## Cache keys
//!
//! Keys are **content-addressed**: a SHA-256 over everything that affects the
//! output (asset hashes, page HTML, budget and compression settings), fed
//! through [`CacheKey`]. Two builds with identical effective inputs derive
//! the same key and therefore reuse the same artifact. Renaming an output
//! directory or touching a file without changing it does not bust the cache.
//!
//! ## Expiry
//!
//! An entry is a hit only while `now - created_at <= ttl`. Expired entries
//! are treated exactly like missing ones and are reclaimed lazily: on
//! [`BuildCache::put`] when the cache is over capacity, by
//! [`BuildCache::prune_expired`], or by the orchestrator's background sweep.
//! When pruning expired entries is not enough, the oldest entries by
//! `created_at` go first.
//!
//! ## Storage
//!
//! The cache lives in memory behind a read/write lock so the background
//! sweep and a running build can share it. [`BuildCache::save`] writes a
//! versioned JSON manifest (`build-cache.json`) to the cache directory and
//! [`BuildCache::load`] reads it back. A missing, corrupt or
//! version-mismatched manifest loads as an empty cache: the cache is never a
//! source of truth, every miss is recomputed.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Name of the cache manifest file within the cache directory.
const MANIFEST_FILENAME: &str = "build-cache.json";

/// Version of the cache manifest format. Bump this to invalidate all
/// existing caches when the format or key computation changes.
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A previously computed build artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub input_hash: String,
    pub artifact: Vec<u8>,
    pub size: usize,
    pub compliance_ok: bool,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        input_hash: impl Into<String>,
        artifact: Vec<u8>,
        compliance_ok: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            input_hash: input_hash.into(),
            size: artifact.len(),
            artifact,
            compliance_ok,
            created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheManifest {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

/// Summary of cache performance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
    pub expired: u32,
    pub evicted: u32,
}

impl CacheStats {
    pub fn lookups(&self) -> u32 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lookups() == 0 {
            return write!(f, "unused");
        }
        write!(
            f,
            "{} hits, {} misses ({} lookups)",
            self.hits,
            self.misses,
            self.lookups()
        )?;
        if self.expired > 0 || self.evicted > 0 {
            write!(f, ", {} expired, {} evicted", self.expired, self.evicted)?;
        }
        Ok(())
    }
}

/// In-memory, TTL-bounded build cache.
pub struct BuildCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    stats: Mutex<CacheStats>,
    ttl: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl BuildCache {
    pub fn new(ttl: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            ttl,
            max_entries: max_entries.max(1),
            clock,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - entry.created_at <= ttl,
            // TTL too large to represent: never expires
            Err(_) => true,
        }
    }

    /// Look up a fresh entry. Expired entries are reported as misses.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let found = self.entries.read().get(key).cloned();
        let mut stats = self.stats.lock();
        match found {
            Some(entry) if self.is_fresh(&entry, now) => {
                stats.hits += 1;
                debug!("cache hit {}", short_key(key));
                Some(entry)
            }
            Some(_) => {
                stats.misses += 1;
                stats.expired += 1;
                debug!("cache entry {} expired", short_key(key));
                None
            }
            None => {
                stats.misses += 1;
                debug!("cache miss {}", short_key(key));
                None
            }
        }
    }

    /// Insert or overwrite, then enforce the entry limit.
    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        entries.insert(key.into(), entry);
        if entries.len() <= self.max_entries {
            return;
        }

        let before = entries.len();
        entries.retain(|_, e| self.is_fresh(e, now));
        let mut evicted = 0;
        if entries.len() > self.max_entries {
            let mut by_age: Vec<(DateTime<Utc>, String)> = entries
                .iter()
                .map(|(k, e)| (e.created_at, k.clone()))
                .collect();
            by_age.sort();
            let excess = entries.len() - self.max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                entries.remove(&key);
                evicted += 1;
            }
        }
        let expired = (before - entries.len()) as u32 - evicted;
        drop(entries);

        let mut stats = self.stats.lock();
        stats.expired += expired;
        stats.evicted += evicted;
        debug!("cache pruned {expired} expired and {evicted} oldest entries");
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| self.is_fresh(e, now));
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            self.stats.lock().expired += removed as u32;
            debug!("cache sweep removed {removed} expired entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Load entries from `dir`, replacing the in-memory contents. Anything
    /// unreadable leaves the cache empty.
    pub fn load(&self, dir: &Path) {
        let path = manifest_path(dir);
        let loaded = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<CacheManifest>(&content).ok())
            .filter(|m| m.version == MANIFEST_VERSION)
            .map(|m| m.entries)
            .unwrap_or_default();
        debug!("loaded {} cache entries from {}", loaded.len(), path.display());
        *self.entries.write() = loaded;
    }

    /// Persist all entries (including expired ones; they are pruned lazily).
    pub fn save(&self, dir: &Path) -> Result<(), CacheError> {
        std::fs::create_dir_all(dir)?;
        let manifest = CacheManifest {
            version: MANIFEST_VERSION,
            entries: self.entries.read().clone(),
        };
        let json = serde_json::to_string(&manifest)?;
        std::fs::write(manifest_path(dir), json)?;
        Ok(())
    }
}

/// Resolve the cache manifest path for a cache directory.
pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILENAME)
}

fn short_key(key: &str) -> &str {
    &key[..key.len().min(12)]
}

/// Incremental SHA-256 key derivation.
///
/// Every field is written as a tag, a length and the bytes, so adjacent
/// fields can't run together (`"ab" + "c"` and `"a" + "bc"` differ).
pub struct CacheKey {
    hasher: Sha256,
}

impl CacheKey {
    /// Start a key for one kind of artifact (`"bundles"`, `"critical-css"`).
    pub fn new(domain: &str) -> Self {
        let mut key = Self {
            hasher: Sha256::new(),
        };
        key.hasher.update(b"first-packet\0");
        key.bytes(domain.as_bytes());
        key
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.hasher.update(b"s");
        self.bytes(value.as_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(b"u");
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.hasher.update(if value { b"t" } else { b"f" });
        self
    }

    pub fn finish(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }
}

/// SHA-256 of a byte buffer, returned as a hex string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::fs;
    use tempfile::TempDir;

    fn cache_with(clock: &Arc<ManualClock>, ttl_secs: u64, max: usize) -> BuildCache {
        BuildCache::new(Duration::from_secs(ttl_secs), max, clock.clone())
    }

    fn entry(clock: &ManualClock, data: &str) -> CacheEntry {
        CacheEntry::new(hash_bytes(data.as_bytes()), data.as_bytes().to_vec(), true, clock.now())
    }

    // =========================================================================
    // Get / put
    // =========================================================================

    #[test]
    fn put_then_get_returns_entry() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        let e = entry(&clock, "body{margin:0}");
        cache.put("k", e.clone());
        assert_eq!(cache.get("k"), Some(e));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn get_missing_is_miss() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        assert_eq!(cache.get("nope"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn put_overwrites() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        cache.put("k", entry(&clock, "one"));
        cache.put("k", entry(&clock, "two"));
        assert_eq!(cache.get("k").unwrap().artifact, b"two");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entry_at_exact_ttl_is_still_fresh() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        cache.put("k", entry(&clock, "x"));
        clock.advance(chrono::Duration::seconds(60));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        cache.put("k", entry(&clock, "x"));
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.get("k"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
        // Lazy: still stored until pruned
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.prune_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn over_capacity_prunes_expired_first() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 2);
        cache.put("old", entry(&clock, "old"));
        clock.advance(chrono::Duration::seconds(30));
        cache.put("mid", entry(&clock, "mid"));
        clock.advance(chrono::Duration::seconds(40)); // "old" is now expired
        cache.put("new", entry(&clock, "new"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("old").is_none());
        assert!(cache.get("mid").is_some());
        assert!(cache.get("new").is_some());
        assert_eq!(cache.stats().expired, 1);
        assert_eq!(cache.stats().evicted, 0);
    }

    #[test]
    fn over_capacity_evicts_oldest_created() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 3600, 2);
        cache.put("a", entry(&clock, "a"));
        clock.advance(chrono::Duration::seconds(1));
        cache.put("b", entry(&clock, "b"));
        clock.advance(chrono::Duration::seconds(1));
        // Reading "a" does not protect it: eviction is by creation time
        cache.get("a");
        cache.put("c", entry(&clock, "c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evicted, 1);
    }

    // =========================================================================
    // Save / Load
    // =========================================================================

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        cache.put("k1", entry(&clock, "one"));
        cache.put("k2", entry(&clock, "two"));
        cache.save(tmp.path()).unwrap();

        let loaded = cache_with(&clock, 60, 10);
        loaded.load(tmp.path());
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("k1").unwrap().artifact, b"one");
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        cache.load(tmp.path());
        assert!(cache.is_empty());
    }

    #[test]
    fn load_corrupt_json_returns_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(manifest_path(tmp.path()), "not json").unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        cache.put("stale", entry(&clock, "x"));
        cache.load(tmp.path());
        assert!(cache.is_empty());
    }

    #[test]
    fn load_wrong_version_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let json = format!(r#"{{"version": {}, "entries": {{}}}}"#, MANIFEST_VERSION + 1);
        fs::write(manifest_path(tmp.path()), json).unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(&clock, 60, 10);
        cache.load(tmp.path());
        assert!(cache.is_empty());
    }

    // =========================================================================
    // Keys
    // =========================================================================

    #[test]
    fn cache_key_deterministic() {
        let a = CacheKey::new("bundles").str("css/a.css").u64(14336).finish();
        let b = CacheKey::new("bundles").str("css/a.css").u64(14336).finish();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn cache_key_field_boundaries_matter() {
        let a = CacheKey::new("x").str("ab").str("c").finish();
        let b = CacheKey::new("x").str("a").str("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_varies_with_domain_and_values() {
        let base = CacheKey::new("bundles").u64(1).finish();
        assert_ne!(base, CacheKey::new("critical-css").u64(1).finish());
        assert_ne!(base, CacheKey::new("bundles").u64(2).finish());
        assert_ne!(
            CacheKey::new("b").bool(true).finish(),
            CacheKey::new("b").bool(false).finish()
        );
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display() {
        let mut s = CacheStats::default();
        assert_eq!(format!("{}", s), "unused");
        s.hits = 3;
        s.misses = 1;
        assert_eq!(format!("{}", s), "3 hits, 1 misses (4 lookups)");
        s.evicted = 2;
        assert_eq!(format!("{}", s), "3 hits, 1 misses (4 lookups), 0 expired, 2 evicted");
    }
}
