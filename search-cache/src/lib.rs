// In-memory caching and request coalescing for upstream searches

pub mod clock;
pub mod coalescer;
pub mod config;
mod error;
pub mod facade;
pub mod janitor;
pub mod key;
pub mod stats;
pub mod store;


// Re-export for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use coalescer::{CacheSource, Coalescer};
pub use config::CacheConfig;
pub use error::{EncodingError, FetchError};
pub use facade::{CacheFacade, SharedCacheFacade};
pub use key::{canonical, CacheKey, KeyCodec, KEY_LEN};
pub use stats::{CacheStats, StatsCollector};
pub use store::{CacheStore, EntryInfo};
