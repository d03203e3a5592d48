// Short-lived record of references the metadata store reported as missing, so
// repeated lookups for an unknown policy do not hit the store every time.
use crate::metrics_defs::{NEGATIVE_CACHE_HIT, NEGATIVE_CACHE_MISS};
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

const SIZE: u64 = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

pub struct NegativeCache {
    cache: Cache<String, ()>,
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(SIZE)
            .time_to_live(ttl)
            .build();

        NegativeCache { cache }
    }

    pub fn insert(&self, key: &str) {
        self.cache.insert(key.to_string(), ());
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        let cache_hit = self.cache.contains_key(key);
        let metric_def = if cache_hit {
            NEGATIVE_CACHE_HIT
        } else {
            NEGATIVE_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        cache_hit
    }
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_expire() {
        let cache = NegativeCache::new(Duration::from_millis(50));
        assert!(!cache.contains("auth@9.9.9"));
        cache.insert("auth@9.9.9");
        assert!(cache.contains("auth@9.9.9"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!cache.contains("auth@9.9.9"));
    }

    #[test]
    fn test_remove() {
        let cache = NegativeCache::default();
        cache.insert("auth@1.0.0");
        cache.remove("auth@1.0.0");
        assert!(!cache.contains("auth@1.0.0"));
    }
}
