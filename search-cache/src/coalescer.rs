use crate::error::FetchError;
use crate::key::CacheKey;
use crate::stats::StatsCollector;
use crate::store::CacheStore;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use futures::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;

/// Where a value handed out by the cache came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CacheSource {
    /// Served from a live cache entry
    Hit,
    /// This caller ran the producer
    Computed,
    /// This caller waited on another caller's producer
    Coalesced,
}

type Outcome<V, E> = Result<V, FetchError<E>>;
type Computation<V, E> = Shared<BoxFuture<'static, Outcome<V, E>>>;

/// A producer invocation currently running for one key
struct InFlightRequest<V, E> {
    id: u64,
    computation: WeakShared<BoxFuture<'static, Outcome<V, E>>>,
    started_at: DateTime<Utc>,
}

type Registry<V, E> = DashMap<CacheKey, InFlightRequest<V, E>>;

enum Role<V, E> {
    Hit(V),
    Leader(Computation<V, E>),
    Follower(Computation<V, E>),
}

/// Request coalescing
///
/// When multiple identical requests miss the cache at the same time, only
/// the first one (the leader) runs its producer; every other caller for that
/// key awaits the leader's outcome. A successful value is stored before the
/// in-flight registration retires, so a caller arriving afterwards finds it in
/// the cache instead of starting a second producer. Failures are shared with
/// every waiter and never cached.
///
/// The computation is driven by whichever waiter polls it, so a leader that
/// gets cancelled does not strand its followers. If every waiter goes away,
/// the producer is dropped and the registration retires with it.
pub struct Coalescer<V, E> {
    store: Arc<CacheStore<V>>,
    stats: Arc<StatsCollector>,
    in_flight: Arc<Registry<V, E>>,
    next_id: AtomicU64,
    producer_timeout: Option<Duration>,
}

impl<V, E> Coalescer<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>, stats: Arc<StatsCollector>) -> Self {
        let producer_timeout = store.config().producer_time_limit();
        Self {
            store,
            stats,
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            producer_timeout,
        }
    }

    /// Return the cached value for `key`, or compute it with `producer`
    /// while making sure only one producer runs per key at a time
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, producer: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.get_or_compute_with_source(key, producer)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), also reporting where
    /// the value came from
    pub async fn get_or_compute_with_source<F, Fut>(
        &self,
        key: CacheKey,
        producer: F,
    ) -> Outcome<(V, CacheSource), E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.store.get(&key) {
            self.stats.record_hit();
            return Ok((value, CacheSource::Hit));
        }

        match self.join_or_lead(key, producer) {
            Role::Hit(value) => Ok((value, CacheSource::Hit)),
            Role::Leader(computation) => {
                log::debug!("Executing new request for key: {:?}", key);
                computation.await.map(|value| (value, CacheSource::Computed))
            }
            Role::Follower(computation) => {
                log::debug!("Request already pending for key: {:?}", key);
                computation.await.map(|value| (value, CacheSource::Coalesced))
            }
        }
    }

    /// Number of keys with a producer currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether a producer is currently running for `key`
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// When the producer currently running for `key` was started
    pub fn started_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.in_flight.get(key).map(|request| request.started_at)
    }

    fn join_or_lead<F, Fut>(&self, key: CacheKey, producer: F) -> Role<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        // The registry entry stays locked until this caller has either joined
        // or registered, which makes leader election atomic per key.
        let entry = self.in_flight.entry(key);

        if let Entry::Occupied(occupied) = &entry {
            if let Some(computation) = occupied.get().computation.upgrade() {
                self.stats.record_miss();
                self.stats.record_coalesced();
                return Role::Follower(computation);
            }
            log::debug!("Replacing abandoned request for key: {:?}", key);
        }

        // A leader that just finished has already stored its value
        if let Some(value) = self.store.get(&key) {
            self.stats.record_hit();
            return Role::Hit(value);
        }
        self.stats.record_miss();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let computation = self.computation(key, id, producer);
        if let Some(weak) = computation.downgrade() {
            let request = InFlightRequest {
                id,
                computation: weak,
                started_at: self.store.now(),
            };
            match entry {
                Entry::Occupied(mut occupied) => {
                    occupied.insert(request);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(request);
                }
            }
        }
        Role::Leader(computation)
    }

    fn computation<F, Fut>(&self, key: CacheKey, id: u64, producer: F) -> Computation<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let retirement = Retirement {
            registry: Arc::clone(&self.in_flight),
            key,
            id,
        };
        let timeout = self.producer_timeout;

        async move {
            let outcome = run_producer(producer, timeout).await;
            match &outcome {
                Ok(value) => store.put(key, value.clone()),
                Err(err) => {
                    stats.record_producer_failure();
                    log::warn!("Producer failed for key {:?}: {}", key, describe(err));
                }
            }
            drop(retirement);
            outcome
        }
        .boxed()
        .shared()
    }
}

/// Unregisters an in-flight request when its computation finishes or is
/// dropped
struct Retirement<V, E> {
    registry: Arc<Registry<V, E>>,
    key: CacheKey,
    id: u64,
}

impl<V, E> Drop for Retirement<V, E> {
    fn drop(&mut self) {
        let id = self.id;
        if self
            .registry
            .remove_if(&self.key, |_, request| request.id == id)
            .is_some()
        {
            log::trace!("Retired in-flight request for key: {:?}", self.key);
        }
    }
}

async fn run_producer<V, E, F, Fut>(producer: F, timeout: Option<Duration>) -> Outcome<V, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    let guarded = AssertUnwindSafe(async move { producer().await }).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => return Err(FetchError::Timeout(limit)),
        },
        None => guarded.await,
    };

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(FetchError::Producer(Arc::new(err))),
        Err(_) => Err(FetchError::Panicked),
    }
}

fn describe<E>(err: &FetchError<E>) -> &'static str {
    match err {
        FetchError::Producer(_) => "producer returned an error",
        FetchError::Timeout(_) => "producer timed out",
        FetchError::Panicked => "producer panicked",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock, SystemClock};
    use crate::config::CacheConfig;
    use crate::KeyCodec;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;
    use tokio::sync::Notify;

    fn coalescer(config: CacheConfig) -> Arc<Coalescer<Vec<String>, String>> {
        coalescer_with_clock(config, Arc::new(SystemClock))
    }

    fn coalescer_with_clock(
        config: CacheConfig,
        clock: SharedClock,
    ) -> Arc<Coalescer<Vec<String>, String>> {
        let stats = Arc::new(StatsCollector::new());
        let store = Arc::new(CacheStore::new(config, clock, stats.clone()));
        Arc::new(Coalescer::new(store, stats))
    }

    fn key(query: &str) -> CacheKey {
        KeyCodec::encode_scoped("search", query).unwrap()
    }

    #[tokio::test]
    async fn test_request_deduplication() {
        let coalescer = coalescer(CacheConfig::default());
        let execution_count = Arc::new(AtomicUsize::new(0));
        let key = key("test");

        // Execute multiple identical requests concurrently
        let mut handles = vec![];
        for _ in 0..5 {
            let coalescer = coalescer.clone();
            let execution_count = execution_count.clone();

            let handle = tokio::spawn(async move {
                coalescer
                    .get_or_compute(key, move || async move {
                        execution_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(StdDuration::from_millis(100)).await;
                        Ok(vec!["result".to_string()])
                    })
                    .await
            });

            handles.push(handle);
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), vec!["result".to_string()]);
        }

        // Should have executed only once due to deduplication
        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_not_deduplicated() {
        let coalescer = coalescer(CacheConfig::default());
        let execution_count = Arc::new(AtomicUsize::new(0));

        let execution_count1 = execution_count.clone();
        let execution_count2 = execution_count.clone();
        let coalescer1 = coalescer.clone();
        let coalescer2 = coalescer.clone();

        let handle1 = tokio::spawn(async move {
            coalescer1
                .get_or_compute(key("test1"), move || async move {
                    execution_count1.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![])
                })
                .await
        });

        let handle2 = tokio::spawn(async move {
            coalescer2
                .get_or_compute(key("test2"), move || async move {
                    execution_count2.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![])
                })
                .await
        });

        handle1.await.unwrap().unwrap();
        handle2.await.unwrap().unwrap();

        // Should have executed twice since keys are different
        assert_eq!(execution_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_roles_are_reported() {
        let coalescer = coalescer(CacheConfig::default());
        let release = Arc::new(Notify::new());
        let key = key("dune");

        let gate = release.clone();
        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .get_or_compute_with_source(key, move || async move {
                        gate.notified().await;
                        Ok(vec!["dune".to_string()])
                    })
                    .await
            })
        };

        while !coalescer.is_in_flight(&key) {
            tokio::task::yield_now().await;
        }
        assert!(coalescer.started_at(&key).is_some());

        let follower = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .get_or_compute_with_source(key, || async { Ok(vec!["never".to_string()]) })
                    .await
            })
        };

        while coalescer.stats.coalesced() == 0 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        let (_, leader_source) = leader.await.unwrap().unwrap();
        let (value, follower_source) = follower.await.unwrap().unwrap();
        assert_eq!(leader_source, CacheSource::Computed);
        assert_eq!(follower_source, CacheSource::Coalesced);
        assert_eq!(value, vec!["dune".to_string()]);

        let (_, source) = coalescer
            .get_or_compute_with_source(key, || async { Ok(vec![]) })
            .await
            .unwrap();
        assert_eq!(source, CacheSource::Hit);
        assert_eq!(source.to_string(), "hit");
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let coalescer = coalescer(CacheConfig::default());
        let execution_count = Arc::new(AtomicUsize::new(0));
        let key = key("flaky");

        let mut handles = vec![];
        for _ in 0..4 {
            let coalescer = coalescer.clone();
            let execution_count = execution_count.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .get_or_compute(key, move || async move {
                        execution_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(StdDuration::from_millis(50)).await;
                        Err("provider unavailable".to_string())
                    })
                    .await
            }));
        }

        let mut errors = vec![];
        for handle in handles {
            errors.push(handle.await.unwrap().unwrap_err());
        }

        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
        let first = match &errors[0] {
            FetchError::Producer(err) => err.clone(),
            other => panic!("unexpected error: {}", other),
        };
        for err in &errors {
            match err {
                FetchError::Producer(shared) => assert!(Arc::ptr_eq(shared, &first)),
                other => panic!("unexpected error: {}", other),
            }
        }

        assert!(coalescer.store.get(&key).is_none());
        assert_eq!(coalescer.in_flight(), 0);

        // The next call starts over and can succeed
        let value = coalescer
            .get_or_compute(key, || async { Ok(vec!["recovered".to_string()]) })
            .await
            .unwrap();
        assert_eq!(value, vec!["recovered".to_string()]);
        assert_eq!(coalescer.store.get(&key), Some(vec!["recovered".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_timeout() {
        let config = CacheConfig::default().with_producer_timeout(chrono::Duration::seconds(2));
        let coalescer = coalescer(config);
        let key = key("slow");

        let err = coalescer
            .get_or_compute(key, || async {
                tokio::time::sleep(StdDuration::from_secs(60)).await;
                Ok(vec![])
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(coalescer.in_flight(), 0);
        assert!(coalescer.store.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_panicking_producer_is_reported() {
        let coalescer = coalescer(CacheConfig::default());
        let key = key("boom");

        let err = coalescer
            .get_or_compute(key, || async {
                if true {
                    panic!("scraper exploded");
                }
                Ok(vec![])
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Panicked));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiters_retire_the_request() {
        let coalescer = coalescer(CacheConfig::default());
        let key = key("abandoned");

        let pending = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .get_or_compute(key, || async {
                        futures::future::pending::<()>().await;
                        Ok(vec![])
                    })
                    .await
            })
        };

        while !coalescer.is_in_flight(&key) {
            tokio::task::yield_now().await;
        }
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(!coalescer.is_in_flight(&key));

        let value = coalescer
            .get_or_compute(key, || async { Ok(vec!["fresh".to_string()]) })
            .await
            .unwrap();
        assert_eq!(value, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_strand_followers() {
        let coalescer = coalescer(CacheConfig::default());
        let release = Arc::new(Notify::new());
        let key = key("interstellar");

        let gate = release.clone();
        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .get_or_compute(key, move || async move {
                        gate.notified().await;
                        Ok(vec!["interstellar".to_string()])
                    })
                    .await
            })
        };

        while !coalescer.is_in_flight(&key) {
            tokio::task::yield_now().await;
        }

        let follower = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .get_or_compute_with_source(key, || async { Ok(vec!["never".to_string()]) })
                    .await
            })
        };

        while coalescer.stats.coalesced() == 0 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        // The follower still holds the computation
        assert!(coalescer.is_in_flight(&key));
        release.notify_one();

        let (value, source) = tokio::time::timeout(StdDuration::from_secs(2), follower)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, vec!["interstellar".to_string()]);
        assert_eq!(source, CacheSource::Coalesced);
        assert_eq!(coalescer.store.get(&key), Some(vec!["interstellar".to_string()]));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_shared_with_followers() {
        let config = CacheConfig::default().with_producer_timeout(chrono::Duration::seconds(2));
        let coalescer = coalescer(config);
        let execution_count = Arc::new(AtomicUsize::new(0));
        let key = key("hung tracker");

        let mut handles = vec![];
        for _ in 0..4 {
            let coalescer = coalescer.clone();
            let execution_count = execution_count.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .get_or_compute(key, move || async move {
                        execution_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(StdDuration::from_secs(60)).await;
                        Ok(vec![])
                    })
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_timeout());
            assert_eq!(err.to_string(), "Producer timed out after 2s");
        }

        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.stats.coalesced(), 3);
        assert_eq!(coalescer.stats.producer_failures(), 1);
        assert_eq!(coalescer.in_flight(), 0);
        assert!(coalescer.store.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_start_time_comes_from_the_store_clock() {
        let start = Utc::now() - chrono::Duration::hours(3);
        let coalescer = coalescer_with_clock(
            CacheConfig::default(),
            Arc::new(ManualClock::new(start)),
        );
        let release = Arc::new(Notify::new());
        let key = key("oppenheimer");

        let gate = release.clone();
        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .get_or_compute(key, move || async move {
                        gate.notified().await;
                        Ok(vec![])
                    })
                    .await
            })
        };

        while !coalescer.is_in_flight(&key) {
            tokio::task::yield_now().await;
        }
        assert_eq!(coalescer.started_at(&key), Some(start));

        release.notify_one();
        leader.await.unwrap().unwrap();
        assert_eq!(coalescer.started_at(&key), None);
    }
}
