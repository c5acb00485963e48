use crate::clock::{SharedClock, SystemClock};
use crate::coalescer::{CacheSource, Coalescer};
use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::janitor::Janitor;
use crate::key::CacheKey;
use crate::stats::{CacheStats, StatsCollector};
use crate::store::{CacheStore, EntryInfo};
use futures::Future;
use std::sync::Arc;

/// In-memory search cache with request coalescing and background expiry
///
/// Callers derive a [`CacheKey`] with [`KeyCodec`](crate::KeyCodec) and hand
/// the facade a producer that knows how to fetch a fresh value. The facade
/// answers from the cache when it can, and otherwise makes sure that at most
/// one producer runs per key.
///
/// Must be created inside a tokio runtime for expired entries to be swept in
/// the background. Without one the cache still works, but expired entries
/// only go away through [`purge_expired`](Self::purge_expired) or eviction.
pub struct CacheFacade<V, E> {
    store: Arc<CacheStore<V>>,
    coalescer: Coalescer<V, E>,
    stats: Arc<StatsCollector>,
    janitor: Option<Janitor>,
}

impl<V, E> CacheFacade<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a cache that reads time from `clock`
    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let sweep_period = config.sweep_period();
        log::info!(
            "Initialized search cache (TTL: {}s, Max entries: {})",
            config.ttl.num_seconds(),
            config.max_entries
        );

        let store = Arc::new(CacheStore::new(config, clock, stats.clone()));
        let coalescer = Coalescer::new(store.clone(), stats.clone());
        let janitor = match sweep_period {
            Some(period) => Janitor::spawn(store.clone(), stats.clone(), period),
            None => {
                log::info!("Cleanup interval is not positive, background sweeping disabled");
                None
            }
        };

        Self {
            store,
            coalescer,
            stats,
            janitor,
        }
    }

    /// Return the cached value for `key`, or run `producer` to obtain it
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        producer: F,
    ) -> Result<V, FetchError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.coalescer.get_or_compute(key, producer).await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), also reporting whether
    /// the value was a hit, computed by this caller, or shared from another
    pub async fn get_or_compute_with_source<F, Fut>(
        &self,
        key: CacheKey,
        producer: F,
    ) -> Result<(V, CacheSource), FetchError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.coalescer.get_or_compute_with_source(key, producer).await
    }

    /// Look up a live entry without computing anything
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let value = self.store.get(key);
        match value {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        value
    }

    /// Store a value directly
    pub fn insert(&self, key: CacheKey, value: V) {
        self.store.put(key, value);
    }

    /// Drop the entry for `key`, returning whether one existed
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.store.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    /// Sweep expired entries now instead of waiting for the janitor
    pub fn purge_expired(&self) -> usize {
        let removed = self.store.remove_expired();
        self.stats.record_expirations(removed);
        removed
    }

    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.store.entry_info(key)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            in_flight: self.coalescer.in_flight(),
            ..self.store.stats()
        }
    }

    pub fn config(&self) -> &CacheConfig {
        self.store.config()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn is_janitor_running(&self) -> bool {
        self.janitor.as_ref().is_some_and(Janitor::is_running)
    }

    /// Stop background sweeping. Lookups and inserts keep working.
    pub fn shutdown(&self) {
        if let Some(janitor) = &self.janitor {
            janitor.stop();
        }
    }
}

/// Thread-safe wrapper for the cache
pub type SharedCacheFacade<V, E> = Arc<CacheFacade<V, E>>;
