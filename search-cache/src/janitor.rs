use crate::stats::StatsCollector;
use crate::store::CacheStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Background task that periodically sweeps expired entries out of a store
///
/// The janitor is only needed to reclaim memory; reads already ignore
/// expired entries. Stopping it lets a sweep that is already running finish
/// and prevents any further ticks.
pub struct Janitor {
    shutdown: Arc<Notify>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Janitor {
    /// Start sweeping `store` every `period` on the current tokio runtime
    ///
    /// Returns `None` when called outside of a runtime.
    pub fn spawn<V>(
        store: Arc<CacheStore<V>>,
        stats: Arc<StatsCollector>,
        period: Duration,
    ) -> Option<Self>
    where
        V: Clone + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("No tokio runtime available, expired cache entries will not be swept");
                return None;
            }
        };

        let shutdown = Arc::new(Notify::new());
        let handle = runtime.spawn(run(store, stats, period, shutdown.clone()));
        log::info!("Cache janitor started (sweep every {:?})", period);

        Some(Self {
            shutdown,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the sweeper to stop, returning `false` if it was already stopped
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.notify_one();
        // notify_one leaves a permit if the task is mid-sweep, so it exits at
        // its next select
        self.handle.lock().take();
        log::info!("Cache janitor stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && self
                .handle
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<V>(
    store: Arc<CacheStore<V>>,
    stats: Arc<StatsCollector>,
    period: Duration,
    shutdown: Arc<Notify>,
) where
    V: Clone,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can have expired yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                let removed = store.remove_expired();
                if removed > 0 {
                    stats.record_expirations(removed);
                    log::info!("Janitor swept {} expired cache entries", removed);
                }
            }
        }
    }

    log::debug!("Cache janitor exited");
}
