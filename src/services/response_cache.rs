//! Edge response cache
//!
//! Bounded TTL cache mapping request fingerprints to the canonical JSON text
//! of a geocode response. Values stay text so cached entries survive backend
//! changes and stay debuggable. Requests asking for more than the configured
//! result ceiling skip the cache entirely.

use std::time::Duration;

use moka::sync::Cache;

use crate::types::GeocodeQuery;

pub struct ResponseCache {
    inner: Cache<String, String>,
    max_results_limit: u32,
}

impl ResponseCache {
    pub fn new(capacity: u64, ttl: Duration, max_results_limit: u32) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            max_results_limit,
        }
    }

    /// Large result sets dominate cache memory for little reuse; skip them.
    pub fn should_cache(&self, query: &GeocodeQuery) -> bool {
        query.max_results <= self.max_results_limit
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    /// Best-effort populate; never fails the originating request.
    pub fn set(&self, key: String, canonical: String) {
        self.inner.insert(key, canonical);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_canonical_text() {
        let cache = ResponseCache::new(64, Duration::from_secs(90), 10);
        cache.set("k".into(), "{\"num_results\":0}".into());
        assert_eq!(cache.get("k").as_deref(), Some("{\"num_results\":0}"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(64, Duration::from_millis(40), 10);
        cache.set("k".into(), "v".into());
        assert!(cache.get("k").is_some());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn large_result_requests_bypass_the_cache() {
        let cache = ResponseCache::new(64, Duration::from_secs(90), 10);
        assert!(cache.should_cache(&GeocodeQuery::forward("main st", 10)));
        assert!(!cache.should_cache(&GeocodeQuery::forward("main st", 11)));
    }
}
