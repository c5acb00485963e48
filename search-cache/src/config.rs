use chrono::Duration;

/// Configuration for the cache system
///
/// Supplied once when the [`CacheFacade`](crate::CacheFacade) is built and
/// never changed afterwards.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// How long an entry stays valid after insertion
    pub ttl: Duration,
    /// Maximum number of cached entries
    pub max_entries: usize,
    /// Period between background expiry sweeps
    pub cleanup_interval: Duration,
    /// Upper bound on a single producer invocation
    pub producer_timeout: Option<Duration>,
    /// Whether results are stored at all
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(15),
            max_entries: 1000,
            cleanup_interval: Duration::minutes(5),
            producer_timeout: Some(Duration::seconds(30)),
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new(ttl: Duration, max_entries: usize, cleanup_interval: Duration) -> Self {
        Self {
            ttl,
            max_entries,
            cleanup_interval,
            ..Self::default()
        }
    }

    pub fn with_producer_timeout(mut self, timeout: Duration) -> Self {
        self.producer_timeout = Some(timeout);
        self
    }

    /// Let producers run for as long as they need
    pub fn without_producer_timeout(mut self) -> Self {
        self.producer_timeout = None;
        self
    }

    /// Keep coalescing requests but never store results
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether inserted values can ever be read back.
    ///
    /// A zero capacity or a non-positive ttl makes every entry dead on
    /// arrival, so the store skips them entirely.
    pub fn stores_entries(&self) -> bool {
        self.enabled && self.max_entries > 0 && self.ttl > Duration::zero()
    }

    /// Sweep period for the janitor, `None` when sweeping is switched off
    pub(crate) fn sweep_period(&self) -> Option<std::time::Duration> {
        self.cleanup_interval
            .to_std()
            .ok()
            .filter(|period| !period.is_zero())
    }

    pub(crate) fn producer_time_limit(&self) -> Option<std::time::Duration> {
        self.producer_timeout
            .and_then(|timeout| timeout.to_std().ok())
            .filter(|limit| !limit.is_zero())
    }
}
