//! Bounded get-or-create cache deduplicating buffers by fingerprint

use crate::buffer::BufferEntity;
use crate::config::CacheConfig;
use crate::telemetry::Fingerprint;
use lru::LruCache;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Cache entry with TTL; `None` never expires
#[derive(Debug)]
struct CacheEntry<V> {
    value: Arc<V>,
    expires_at: Option<Instant>,
}

/// LRU + TTL map from fingerprint to buffer.
///
/// Eviction only stops tracking an entry, nothing is flushed; the evicted
/// value is told through [`BufferEntity::untracked`]. With
/// `pin_pending` set, entries whose buffer still holds pending or staged items
/// are never evicted or expired; if every entry is pinned the cache grows past
/// `max` until some of them drain.
#[derive(Debug)]
pub struct KeyedCache<V> {
    entries: LruCache<Fingerprint, CacheEntry<V>>,
    config: CacheConfig,
}

impl<V: BufferEntity> KeyedCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: LruCache::unbounded(),
            config,
        }
    }

    fn is_pinned(&self, value: &V) -> bool {
        self.config.pin_pending && value.is_pinned()
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        entry.expires_at.is_some_and(|at| at <= now) && !self.is_pinned(&entry.value)
    }

    /// A TTL too large to represent never expires
    fn expiry(&self, now: Instant) -> Option<Instant> {
        now.checked_add(self.config.ttl)
    }

    fn drop_entry(&mut self, key: &Fingerprint) {
        if let Some(entry) = self.entries.pop(key) {
            entry.value.untracked();
        }
    }

    /// Look up an entry, refreshing its recency (and age if configured)
    pub fn get(&mut self, key: &Fingerprint) -> Option<Arc<V>> {
        let now = Instant::now();
        let expired = match self.entries.peek(key) {
            None => return None,
            Some(entry) => self.is_expired(entry, now),
        };

        if expired {
            self.drop_entry(key);
            debug!("Cache entry {} expired", key);
            return None;
        }

        let expires_at = self.expiry(now);
        let update_age = self.config.update_age_on_get;
        let entry = self.entries.get_mut(key)?;
        if update_age {
            entry.expires_at = expires_at;
        }
        trace!("Cache hit for {}", key);
        Some(Arc::clone(&entry.value))
    }

    /// Look up an entry without touching recency or age
    pub fn peek(&self, key: &Fingerprint) -> Option<Arc<V>> {
        let now = Instant::now();
        self.entries
            .peek(key)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| Arc::clone(&entry.value))
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.peek(key).is_some()
    }

    /// Return the cached value for `key`, creating it on a miss.
    ///
    /// The flag is `true` when the value was created by this call.
    pub fn get_or_insert_with<E, F>(&mut self, key: Fingerprint, create: F) -> Result<(Arc<V>, bool), E>
    where
        F: FnOnce() -> Result<Arc<V>, E>,
    {
        self.purge_expired();

        if let Some(value) = self.get(&key) {
            return Ok((value, false));
        }

        let value = create()?;
        self.insert(key, Arc::clone(&value));
        Ok((value, true))
    }

    /// Insert or replace an entry, evicting the least recently used unpinned
    /// entry when full
    pub fn insert(&mut self, key: Fingerprint, value: Arc<V>) {
        if !self.entries.contains(&key) {
            self.make_room();
        }

        let expires_at = self.expiry(Instant::now());
        debug!("Caching {}", key);
        let replaced = self.entries.put(key, CacheEntry {
            value: Arc::clone(&value),
            expires_at,
        });

        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old.value, &value) {
                old.value.untracked();
            }
        }
    }

    /// Stop tracking an entry and hand it back; the value is not notified
    pub fn remove(&mut self, key: &Fingerprint) -> Option<Arc<V>> {
        self.entries.pop(key).map(|entry| entry.value)
    }

    fn make_room(&mut self) {
        let capacity = self.config.max.max(1);

        while self.entries.len() >= capacity {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| !self.is_pinned(&entry.value))
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    self.drop_entry(&key);
                    debug!("Evicted {} from cache", key);
                }
                None => {
                    warn!(
                        "All {} cached buffers hold pending data, growing past capacity {}",
                        self.entries.len(),
                        capacity
                    );
                    break;
                }
            }
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.drop_entry(key);
        }

        if !expired.is_empty() {
            debug!("Purged {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// All tracked values, most recently used first
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries
            .iter()
            .map(|(_, entry)| Arc::clone(&entry.value))
            .collect()
    }

    /// Number of tracked entries, expired ones included until purged
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
    use crate::buffer::Stream;
    use crate::telemetry::LabelSet;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(max: usize, ttl_ms: u64, pin_pending: bool) -> CacheConfig {
        CacheConfig {
            max,
            ttl: Duration::from_millis(ttl_ms),
            update_age_on_get: true,
            pin_pending,
        }
    }

    fn stream(job: &str) -> (Fingerprint, Arc<Stream>) {
        let stream = Stream::new(LabelSet::from([("job", job)])).unwrap();
        (stream.fingerprint().clone(), stream)
    }

    #[test]
    fn test_get_or_insert_reuses_entry() {
        let mut cache: KeyedCache<Stream> = KeyedCache::new(config(10, 60_000, true));
        let (key, first) = stream("a");

        let (created, fresh) = cache
            .get_or_insert_with(key.clone(), || Ok::<_, Infallible>(Arc::clone(&first)))
            .unwrap();
        assert!(fresh);
        assert!(Arc::ptr_eq(&created, &first));

        let (again, fresh) = cache
            .get_or_insert_with(key, || -> Result<Arc<Stream>, Infallible> {
                panic!("must not create twice")
            })
            .unwrap();
        assert!(!fresh);
        assert!(Arc::ptr_eq(&again, &first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache: KeyedCache<Stream> = KeyedCache::new(config(2, 60_000, true));
        let (a, sa) = stream("a");
        let (b, sb) = stream("b");
        let (c, sc) = stream("c");

        cache.insert(a.clone(), sa);
        cache.insert(b.clone(), sb);
        cache.get(&a);
        cache.insert(c.clone(), sc);

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let mut cache: KeyedCache<Stream> = KeyedCache::new(config(1, 60_000, true));
        let (a, sa) = stream("a");
        let (b, sb) = stream("b");
        sa.push_entry_millis(1000, "pending").unwrap();

        cache.insert(a.clone(), sa);
        cache.insert(b.clone(), sb);

        assert!(cache.contains(&a));
        assert!(cache.contains(&b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_unpinned_cache_evicts_pending_entries() {
        let mut cache: KeyedCache<Stream> = KeyedCache::new(config(1, 60_000, false));
        let (a, sa) = stream("a");
        let (b, sb) = stream("b");
        sa.push_entry_millis(1000, "pending").unwrap();

        cache.insert(a.clone(), sa);
        cache.insert(b, sb);

        assert!(!cache.contains(&a));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let mut cache: KeyedCache<Stream> = KeyedCache::new(config(10, 50, true));
        let (a, sa) = stream("a");
        let (b, sb) = stream("b");
        sb.push_entry_millis(1000, "pending").unwrap();
        cache.insert(a.clone(), sa);
        cache.insert(b.clone(), sb);

        tokio::time::advance(Duration::from_millis(100)).await;

        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some(), "pinned entries do not expire");
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_untracks_value() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let mut cache: KeyedCache<Stream> = KeyedCache::new(config(1, 60_000, false));
        let (a, sa) = stream("a");
        let (b, sb) = stream("b");
        sa.attach_gauge(&gauge);
        sa.push_entry_millis(1000, "pending").unwrap();
        assert_eq!(gauge.load(Ordering::SeqCst), 1);

        cache.insert(a, Arc::clone(&sa));
        cache.insert(b, sb);

        assert_eq!(gauge.load(Ordering::SeqCst), 0);
        assert_eq!(sa.pending_len(), 1);
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let mut huge = config(10, 0, true);
        huge.ttl = Duration::from_secs(u64::MAX);
        let mut cache: KeyedCache<Stream> = KeyedCache::new(huge);
        let (a, sa) = stream("a");

        let (created, fresh) = cache
            .get_or_insert_with(a.clone(), || Ok::<_, Infallible>(sa))
            .unwrap();
        assert!(fresh);
        assert!(cache.get(&a).is_some());
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(created.fingerprint(), &a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_age() {
        let mut cache: KeyedCache<Stream> = KeyedCache::new(config(10, 100, true));
        let (a, sa) = stream("a");
        cache.insert(a.clone(), sa);

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(cache.get(&a).is_some());
        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(cache.get(&a).is_some());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }
}
