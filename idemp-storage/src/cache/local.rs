//! In-memory local tier.
//!
//! A `DashMap` keyed by idempotency key, with a per-entry absolute expiry.
//! Expired entries are evicted lazily on lookup, in bulk by
//! [`LocalTier::purge_expired`], and whenever the tier is at capacity and a
//! new key arrives. If purging expired entries does not free a slot, a batch
//! of the entries closest to their expiry is dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use idemp_core::{IdempotencyError, IdempotencyResult, Timestamp};

use super::traits::{CacheStats, InsertOutcome, LocalTier};

/// At capacity, one scan evicts `capacity / EVICTION_BATCH_DIVISOR` entries.
const EVICTION_BATCH_DIVISOR: usize = 16;

#[derive(Debug, Clone)]
struct LocalEntry<V> {
    value: V,
    expiry: Timestamp,
}

impl<V> LocalEntry<V> {
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }
}

/// Concurrent in-memory local tier.
#[derive(Debug)]
pub struct InMemoryLocalTier<V> {
    entries: DashMap<String, LocalEntry<V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> InMemoryLocalTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a local tier holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently held, including not-yet-evicted expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, key: &str, now: Timestamp) -> Option<V> {
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        // Shard guard is released before evicting.
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Make room for one new key.
    ///
    /// Capacity is a soft bound: concurrent saves of new keys can each pass
    /// the length check and overshoot it by up to the number of writers. The
    /// next save at capacity evicts the overshoot as well. When nothing has
    /// expired, a batch of the soonest-expiring entries is evicted with one
    /// scan, so the scan cost is spread over the following inserts.
    fn make_room(&self, key: &str, now: Timestamp) {
        if self.entries.len() < self.capacity || self.entries.contains_key(key) {
            return;
        }

        self.purge_expired_at(now);
        let len = self.entries.len();
        if len < self.capacity {
            return;
        }

        let batch = (self.capacity / EVICTION_BATCH_DIVISOR).max(1);
        let target = (len + 1 - self.capacity).max(batch).min(len);

        let mut candidates: Vec<(Timestamp, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().expiry, entry.key().clone()))
            .collect();
        if target < candidates.len() {
            candidates.select_nth_unstable_by_key(target, |(expiry, _)| *expiry);
            candidates.truncate(target);
        }

        let mut evicted = 0u64;
        for (_, victim) in candidates {
            if self.entries.remove(&victim).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        tracing::debug!(evicted, capacity = self.capacity, "Evicted local records at capacity");
    }

    fn purge_expired_at(&self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }
}

fn validate_key(key: &str) -> IdempotencyResult<()> {
    if key.is_empty() {
        return Err(IdempotencyError::invalid_argument(
            "key",
            "idempotency key must not be empty",
        ));
    }
    Ok(())
}

impl<V> LocalTier<V> for InMemoryLocalTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn contains(&self, key: &str) -> bool {
        tracing::trace!(key, "Checking local tier");
        self.live(key, Utc::now()).is_some()
    }

    fn get(&self, key: &str) -> Option<V> {
        tracing::trace!(key, "Retrieving from local tier");
        let value = self.live(key, Utc::now());
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn save(&self, key: &str, value: V, expiry: Timestamp) -> IdempotencyResult<V> {
        validate_key(key)?;
        tracing::trace!(key, "Saving to local tier");
        self.make_room(key, Utc::now());
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.clone(),
                expiry,
            },
        );
        Ok(value)
    }

    fn insert_if_absent(
        &self,
        key: &str,
        value: V,
        expiry: Timestamp,
    ) -> IdempotencyResult<InsertOutcome<V>> {
        validate_key(key)?;
        let now = Utc::now();
        self.make_room(key, now);

        let outcome = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(LocalEntry {
                        value: value.clone(),
                        expiry,
                    });
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    InsertOutcome::Inserted(value)
                } else {
                    InsertOutcome::Existing(occupied.get().value.clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry {
                    value: value.clone(),
                    expiry,
                });
                InsertOutcome::Inserted(value)
            }
        };
        Ok(outcome)
    }

    fn remove(&self, key: &str) -> IdempotencyResult<()> {
        validate_key(key)?;
        tracing::trace!(key, "Removing from local tier");
        self.entries.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn in_secs(secs: i64) -> Timestamp {
        Utc::now() + Duration::seconds(secs)
    }

    #[test]
    fn test_save_then_get() {
        let tier = InMemoryLocalTier::new(8);
        tier.save("a", 1u32, in_secs(60)).unwrap();

        assert!(tier.contains("a"));
        assert_eq!(tier.get("a"), Some(1));
        assert_eq!(tier.get("b"), None);

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_evicted() {
        let tier = InMemoryLocalTier::new(8);
        tier.save("a", 1u32, in_secs(-1)).unwrap();

        assert!(!tier.contains("a"));
        assert_eq!(tier.get("a"), None);
        assert!(tier.is_empty());
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_save_replaces_value() {
        let tier = InMemoryLocalTier::new(8);
        tier.save("a", 1u32, in_secs(60)).unwrap();
        tier.save("a", 2u32, in_secs(60)).unwrap();
        assert_eq!(tier.get("a"), Some(2));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_empty_key_rejected() {
        let tier = InMemoryLocalTier::<u32>::new(8);
        assert!(tier.save("", 1, in_secs(60)).unwrap_err().is_invalid_argument());
        assert!(tier.remove("").unwrap_err().is_invalid_argument());
        assert!(tier
            .insert_if_absent("", 1, in_secs(60))
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn test_insert_if_absent() {
        let tier = InMemoryLocalTier::new(8);
        let first = tier.insert_if_absent("a", 1u32, in_secs(60)).unwrap();
        let second = tier.insert_if_absent("a", 2u32, in_secs(60)).unwrap();

        assert_eq!(first, InsertOutcome::Inserted(1));
        assert_eq!(second, InsertOutcome::Existing(1));
        assert_eq!(tier.get("a"), Some(1));
    }

    #[test]
    fn test_insert_if_absent_replaces_expired() {
        let tier = InMemoryLocalTier::new(8);
        tier.save("a", 1u32, in_secs(-1)).unwrap();
        let outcome = tier.insert_if_absent("a", 2u32, in_secs(60)).unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted(2));
    }

    #[test]
    fn test_remove() {
        let tier = InMemoryLocalTier::new(8);
        tier.save("a", 1u32, in_secs(60)).unwrap();
        tier.remove("a").unwrap();
        tier.remove("a").unwrap();
        assert!(!tier.contains("a"));
    }

    #[test]
    fn test_purge_expired() {
        let tier = InMemoryLocalTier::new(8);
        tier.save("live", 1u32, in_secs(60)).unwrap();
        tier.save("dead-1", 2u32, in_secs(-1)).unwrap();
        tier.save("dead-2", 3u32, in_secs(-5)).unwrap();

        assert_eq!(tier.purge_expired(), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.contains("live"));
    }

    #[test]
    fn test_capacity_evicts_soonest_batch() {
        let tier = InMemoryLocalTier::new(32);
        for i in 0..32 {
            tier.save(&format!("k{i}"), i, in_secs(60 + i as i64)).unwrap();
        }
        tier.save("new", 99, in_secs(30)).unwrap();

        // 32 / 16 entries go in one scan.
        assert_eq!(tier.len(), 31);
        assert!(!tier.contains("k0"));
        assert!(!tier.contains("k1"));
        assert!(tier.contains("k2"));
        assert!(tier.contains("new"));
        assert_eq!(tier.stats().evictions, 2);

        // The freed slot is reused without another scan.
        tier.save("next", 100, in_secs(30)).unwrap();
        assert_eq!(tier.len(), 32);
        assert_eq!(tier.stats().evictions, 2);
    }

    #[test]
    fn test_capacity_prefers_expired_victims() {
        let tier = InMemoryLocalTier::new(2);
        tier.save("live", 1u32, in_secs(60)).unwrap();
        tier.save("dead", 2u32, in_secs(-1)).unwrap();
        tier.save("new", 3u32, in_secs(60)).unwrap();

        assert_eq!(tier.len(), 2);
        assert!(tier.contains("live"));
        assert!(tier.contains("new"));
    }

    #[test]
    fn test_capacity_evicts_soonest_expiry() {
        let tier = InMemoryLocalTier::new(2);
        tier.save("long", 1u32, in_secs(600)).unwrap();
        tier.save("short", 2u32, in_secs(10)).unwrap();
        tier.save("new", 3u32, in_secs(60)).unwrap();

        assert_eq!(tier.len(), 2);
        assert!(tier.contains("long"));
        assert!(!tier.contains("short"));
        assert!(tier.contains("new"));
        assert_eq!(tier.stats().evictions, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: the tier never holds more than its capacity.
        #[test]
        fn prop_capacity_is_never_exceeded(
            capacity in 1usize..8,
            keys in proptest::collection::vec("[a-d]{1,2}", 1..40),
        ) {
            let tier = InMemoryLocalTier::new(capacity);
            for (i, key) in keys.iter().enumerate() {
                tier.save(key, i, in_secs(60)).unwrap();
                prop_assert!(tier.len() <= capacity);
                prop_assert_eq!(tier.get(key), Some(i));
            }
        }
    }
}
