use dashmap::DashMap;
use windowgate_common::RateLimitKey;

/// Last known aggregate for one key, as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub count: u64,
    /// Unix seconds of the counter store read that produced `count`.
    pub fetched_at: i64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: i64, invalidation_secs: i64) -> bool {
        now - self.fetched_at < invalidation_secs
    }
}

/// Per-process cache of durable counts, keyed by entity and window.
///
/// Entries are never shared with other processes and are replaced wholesale
/// on refresh.
pub struct LocalAggregateCache {
    entries: DashMap<RateLimitKey, CacheEntry>,
    invalidation_secs: i64,
}

impl LocalAggregateCache {
    pub fn new(invalidation_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            invalidation_secs: invalidation_secs as i64,
        }
    }

    pub fn get(&self, key: &RateLimitKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| *e.value())
    }

    /// The entry for `key` if it was fetched less than the invalidation
    /// interval ago.
    pub fn fresh(&self, key: &RateLimitKey, now: i64) -> Option<CacheEntry> {
        self.get(key)
            .filter(|entry| entry.is_fresh(now, self.invalidation_secs))
    }

    pub fn set(&self, key: RateLimitKey, count: u64, fetched_at: i64) {
        self.entries.insert(key, CacheEntry { count, fetched_at });
    }

    /// Fold increments that just left the pending buffer into the cached
    /// aggregate so this process keeps counting them until the next refresh.
    /// Keys without an entry are left alone; their next read goes to the store.
    pub fn absorb(&self, key: &RateLimitKey, flushed: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.count += flushed;
        }
    }

    /// Drop entries whose window identifier sorts before `current_window`.
    pub fn evict_before(&self, current_window: &str) {
        self.entries
            .retain(|key, _| key.window_identifier.as_str() >= current_window);

        tracing::debug!(remaining = self.entries.len(), "aggregate cache cleanup complete");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(window: &str) -> RateLimitKey {
        RateLimitKey::new("entity", window)
    }

    #[test]
    fn entry_is_fresh_until_invalidation_interval() {
        let cache = LocalAggregateCache::new(30);
        let k = key("2026-10-19-11-51");
        cache.set(k.clone(), 4, 1_000);

        assert_eq!(cache.fresh(&k, 1_000).map(|e| e.count), Some(4));
        assert!(cache.fresh(&k, 1_029).is_some());
        assert!(cache.fresh(&k, 1_030).is_none(), "stale at exactly the interval");
        // stale entries are still visible through get()
        assert_eq!(cache.get(&k).map(|e| e.fetched_at), Some(1_000));
    }

    #[test]
    fn set_replaces_wholesale() {
        let cache = LocalAggregateCache::new(30);
        let k = key("w");
        cache.set(k.clone(), 9, 1);
        cache.set(k.clone(), 2, 5);

        assert_eq!(cache.get(&k), Some(CacheEntry { count: 2, fetched_at: 5 }));
    }

    #[test]
    fn absorb_only_touches_existing_entries() {
        let cache = LocalAggregateCache::new(30);
        let present = key("a");
        let absent = key("b");
        cache.set(present.clone(), 3, 0);

        cache.absorb(&present, 2);
        cache.absorb(&absent, 7);

        assert_eq!(cache.get(&present).map(|e| e.count), Some(5));
        assert!(cache.get(&absent).is_none());
        // freshness is not extended by absorbing
        assert_eq!(cache.get(&present).map(|e| e.fetched_at), Some(0));
    }

    #[test]
    fn cleanup_removes_past_windows() {
        let cache = LocalAggregateCache::new(30);
        cache.set(key("2026-10-19-11-49"), 1, 0);
        cache.set(key("2026-10-19-11-50"), 1, 0);
        cache.set(key("2026-10-19-11-51"), 1, 0);

        cache.evict_before("2026-10-19-11-50");

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("2026-10-19-11-49")).is_none());
        assert!(cache.get(&key("2026-10-19-11-51")).is_some());
    }
}
