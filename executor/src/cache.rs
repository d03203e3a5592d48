use crate::metrics_defs::{CACHE_EVICTED, CACHE_SIZE};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use shared::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn cache_key(name: &str, version: &str) -> String {
    format!("{name}@{version}")
}

/// A verified artifact. Only the executor constructs these, after the
/// artifact passed verification against `hash`.
#[derive(Debug)]
pub struct CacheEntry {
    pub name: String,
    pub version: String,
    pub hash: String,
    pub artifact: Bytes,
    /// False when the artifact was accepted without a signature.
    pub signed: bool,
    pub loaded_at: Instant,
    last_used_at: Mutex<Instant>,
}

impl CacheEntry {
    pub fn new(name: &str, version: &str, hash: &str, artifact: Bytes, signed: bool) -> Self {
        let now = Instant::now();
        CacheEntry {
            name: name.to_string(),
            version: version.to_string(),
            hash: hash.to_string(),
            artifact,
            signed,
            loaded_at: now,
            last_used_at: Mutex::new(now),
        }
    }

    pub fn key(&self) -> String {
        cache_key(&self.name, &self.version)
    }

    pub fn last_used_at(&self) -> Instant {
        *self.last_used_at.lock()
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    // Strictly increasing, even when the clock has not advanced.
    fn touch(&self) {
        let mut last_used = self.last_used_at.lock();
        let now = Instant::now();
        *last_used = if now > *last_used {
            now
        } else {
            *last_used + Duration::from_nanos(1)
        };
    }
}

/// Verified artifacts keyed by `name@version`. Holds the current and the
/// previous version of a policy side by side until the older one ages out.
///
/// Eviction is by age since load only; recency is tracked but not used.
pub struct VersionedCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    ttl: Duration,
}

impl VersionedCache {
    pub fn new(ttl: Duration) -> Self {
        VersionedCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, name: &str, version: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.read().get(&cache_key(name, version)).cloned()?;
        entry.touch();
        Some(entry)
    }

    /// Inserts `entry`, replacing whatever was cached under the same key.
    pub fn set(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        let size = {
            let mut entries = self.entries.write();
            entries.insert(entry.key(), entry.clone());
            entries.len()
        };
        gauge!(CACHE_SIZE).set(size as f64);
        entry
    }

    /// Removes every entry older than the TTL and returns how many went.
    pub fn evict(&self) -> usize {
        let (removed, size) = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| entry.age() <= self.ttl);
            (before - entries.len(), entries.len())
        };
        if removed > 0 {
            counter!(CACHE_EVICTED).increment(removed as u64);
        }
        gauge!(CACHE_SIZE).set(size as f64);
        removed
    }

    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    /// Sorted cache keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for VersionedCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: &str, hash: &str) -> CacheEntry {
        CacheEntry::new("auth", version, hash, Bytes::from_static(b"\0asm"), true)
    }

    #[test]
    fn test_set_then_get() {
        let cache = VersionedCache::default();
        cache.set(entry("1.0.0", "h1"));

        let found = cache.get("auth", "1.0.0").unwrap();
        assert_eq!(found.hash, "h1");
        assert!(cache.get("auth", "2.0.0").is_none());
    }

    #[test]
    fn test_get_bumps_last_used() {
        let cache = VersionedCache::default();
        cache.set(entry("1.0.0", "h1"));

        let mut previous = cache.get("auth", "1.0.0").unwrap().last_used_at();
        for _ in 0..100 {
            let current = cache.get("auth", "1.0.0").unwrap().last_used_at();
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn test_set_replaces_stale_hash() {
        let cache = VersionedCache::default();
        cache.set(entry("1.0.0", "old"));
        cache.set(entry("1.0.0", "new"));
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get("auth", "1.0.0").unwrap().hash, "new");
    }

    #[test]
    fn test_holds_n_and_n_minus_1() {
        let cache = VersionedCache::default();
        cache.set(entry("2.0.0", "h2"));
        cache.set(entry("1.0.0", "h1"));
        assert_eq!(cache.keys(), vec!["auth@1.0.0", "auth@2.0.0"]);
    }

    #[test]
    fn test_evict_after_ttl() {
        let cache = VersionedCache::new(Duration::from_millis(100));
        cache.set(entry("1.0.0", "h1"));
        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(cache.evict(), 1);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_evict_ignores_recent_use() {
        let cache = VersionedCache::new(Duration::from_millis(100));
        cache.set(entry("1.0.0", "h1"));
        std::thread::sleep(Duration::from_millis(150));
        cache.get("auth", "1.0.0").unwrap();

        assert_eq!(cache.evict(), 1);
    }

    #[test]
    fn test_evict_within_ttl() {
        let cache = VersionedCache::default();
        cache.set(entry("1.0.0", "h1"));
        cache.set(entry("2.0.0", "h2"));

        assert_eq!(cache.evict(), 0);
        assert_eq!(cache.size(), 2);
    }
}
