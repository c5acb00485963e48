use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::key::CacheKey;
use crate::stats::{CacheStats, StatsCollector};
use chrono::{DateTime, Utc};
use getset::Getters;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const SHARD_COUNT: usize = 16;

/// Cached value with its bookkeeping
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    // Position in the shard's recency index. Drawn from a store-wide
    // sequence, so it orders entries like (last_accessed_at, inserted_at).
    recency: u64,
}

impl<V> CacheEntry<V> {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Timestamps of a stored entry, without its value
#[derive(Getters, Clone, Copy, Debug, PartialEq, Eq)]
#[get = "pub"]
pub struct EntryInfo {
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
}

impl EntryInfo {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Check if the entry will expire soon (within 10% of its TTL)
    pub fn expires_soon_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = self.expires_at - self.inserted_at;
        self.expires_at - now < ttl / 10
    }
}

#[derive(Debug)]
struct Shard<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    recency: BTreeMap<u64, CacheKey>,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }
}

/// Concurrent TTL + LRU map from [`CacheKey`] to cached values
///
/// Entries live in a fixed set of shards, each behind its own lock, so
/// operations on keys in different shards never contend. Capacity is
/// global: a `put` that grows the store past `max_entries` evicts the least
/// recently used entry across all shards before it returns.
///
/// Expiry is lazy. Reads treat expired entries as absent, and
/// [`remove_expired`](Self::remove_expired) reclaims them.
pub struct CacheStore<V> {
    shards: Box<[Mutex<Shard<V>>]>,
    len: AtomicUsize,
    recency_seq: AtomicU64,
    // Serializes capacity enforcement so concurrent puts never evict more
    // than the overflow they caused
    eviction: Mutex<()>,
    config: CacheConfig,
    clock: SharedClock,
    stats: Arc<StatsCollector>,
}

impl<V: Clone> CacheStore<V> {
    pub fn new(config: CacheConfig, clock: SharedClock, stats: Arc<StatsCollector>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect();
        Self {
            shards,
            len: AtomicUsize::new(0),
            recency_seq: AtomicU64::new(0),
            eviction: Mutex::new(()),
            config,
            clock,
            stats,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current time according to the store's clock
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Get the cached value if a live entry exists, refreshing its recency
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        if !self.config.stores_entries() {
            return None;
        }

        let now = self.clock.now();
        let mut shard = self.shard(key).lock();
        let Shard { entries, recency } = &mut *shard;
        let entry = entries.get_mut(key)?;

        if !entry.is_valid_at(now) {
            log::debug!("Cache expired for key: {:?}", key);
            return None;
        }

        recency.remove(&entry.recency);
        entry.recency = self.next_recency();
        entry.last_accessed_at = now;
        recency.insert(entry.recency, *key);

        log::debug!("Cache hit for key: {:?}", key);
        Some(entry.value.clone())
    }

    /// Store `value` under `key`, evicting least recently used entries if
    /// the store grew past capacity
    pub fn put(&self, key: CacheKey, value: V) {
        if !self.config.stores_entries() {
            return;
        }

        let now = self.clock.now();
        // A ttl reaching past the representable range never expires
        let expires_at = now
            .checked_add_signed(self.config.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        {
            let mut shard = self.shard(&key).lock();
            let Shard { entries, recency } = &mut *shard;
            let entry = CacheEntry {
                value,
                inserted_at: now,
                expires_at,
                last_accessed_at: now,
                recency: self.next_recency(),
            };
            recency.insert(entry.recency, key);

            match entries.entry(key) {
                Entry::Occupied(mut occupied) => {
                    let previous = occupied.insert(entry);
                    recency.remove(&previous.recency);
                    log::debug!("Replaced cache entry for key: {:?}", key);
                    return;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(entry);
                    self.len.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        log::debug!("Stored in cache with key: {:?}", key);

        let evicted = self.enforce_capacity();
        if evicted > 0 {
            self.stats.record_evictions(evicted);
        }
    }

    /// Remove the entry for `key`, live or expired
    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        let mut shard = self.shard(key).lock();
        let Shard { entries, recency } = &mut *shard;
        let entry = entries.remove(key)?;
        recency.remove(&entry.recency);
        self.len.fetch_sub(1, Ordering::SeqCst);
        Some(entry.value)
    }

    /// Remove expired entries from cache, returning how many went away
    ///
    /// Shards are swept one at a time, so readers and writers are held up
    /// for at most one shard's worth of removals.
    pub fn remove_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let Shard { entries, recency } = &mut *shard;
            let before = entries.len();
            entries.retain(|_, entry| {
                if entry.is_valid_at(now) {
                    true
                } else {
                    recency.remove(&entry.recency);
                    false
                }
            });
            let swept = before - entries.len();
            if swept > 0 {
                self.len.fetch_sub(swept, Ordering::SeqCst);
                removed += swept;
            }
        }

        log::debug!("Evicted {} expired cache entries", removed);
        removed
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let cleared = shard.entries.len();
            shard.entries.clear();
            shard.recency.clear();
            self.len.fetch_sub(cleared, Ordering::SeqCst);
        }
        log::info!("Cache cleared");
    }

    /// Whether a live entry exists for `key`. Does not touch recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.shard(key)
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_valid_at(now))
    }

    /// Timestamps of the entry for `key`, expired or not
    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.shard(key).lock().entries.get(key).map(|entry| EntryInfo {
            inserted_at: entry.inserted_at,
            expires_at: entry.expires_at,
            last_accessed_at: entry.last_accessed_at,
        })
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    ///
    /// The store knows nothing about running producers, so `in_flight` is
    /// always 0 here. [`CacheFacade::stats`](crate::CacheFacade::stats)
    /// reports it.
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let mut total_entries = 0;
        let mut expired_entries = 0;

        for shard in self.shards.iter() {
            let shard = shard.lock();
            total_entries += shard.entries.len();
            expired_entries += shard
                .entries
                .values()
                .filter(|entry| !entry.is_valid_at(now))
                .count();
        }

        CacheStats {
            total_entries,
            valid_entries: total_entries - expired_entries,
            expired_entries,
            max_entries: self.config.max_entries,
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            expirations: self.stats.expirations(),
            coalesced: self.stats.coalesced(),
            producer_failures: self.stats.producer_failures(),
            in_flight: 0,
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<Shard<V>> {
        &self.shards[key.shard_index(self.shards.len())]
    }

    fn next_recency(&self) -> u64 {
        self.recency_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn enforce_capacity(&self) -> usize {
        if self.len.load(Ordering::SeqCst) <= self.config.max_entries {
            return 0;
        }

        let _eviction = self.eviction.lock();
        let mut evicted = 0;
        while self.len.load(Ordering::SeqCst) > self.config.max_entries {
            match self.evict_lru() {
                Some(victim) => {
                    log::debug!("Evicted least recently used key: {:?}", victim);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// Remove the least recently used entry across all shards
    fn evict_lru(&self) -> Option<CacheKey> {
        loop {
            let (rank, index) = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(index, shard)| {
                    shard
                        .lock()
                        .recency
                        .first_key_value()
                        .map(|(rank, _)| (*rank, index))
                })
                .min()?;

            let mut shard = self.shards[index].lock();
            if self.len.load(Ordering::SeqCst) <= self.config.max_entries {
                return None;
            }
            let Shard { entries, recency } = &mut *shard;
            // A reader may have refreshed the candidate since the scan
            if let Some(key) = recency.remove(&rank) {
                entries.remove(&key);
                self.len.fetch_sub(1, Ordering::SeqCst);
                return Some(key);
            }
        }
    }
}
