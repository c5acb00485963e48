use std::sync::Arc;
use std::time::Duration;

/// Errors raised while turning request parameters into a [`CacheKey`](crate::CacheKey)
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Could not serialize cache key parameters: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Cache key parameters contain a non-finite number: {0}")]
    NonFiniteNumber(f64),
}

/// Failure of a coalesced fetch, shared by the leader and every follower
///
/// The producer's own error is wrapped in an [`Arc`] so that all callers
/// waiting on the same computation observe the very same error value.
#[derive(Debug, thiserror::Error)]
pub enum FetchError<E> {
    #[error("Producer failed: {0}")]
    Producer(Arc<E>),
    #[error("Producer timed out after {0:?}")]
    Timeout(Duration),
    #[error("Producer panicked")]
    Panicked,
}

impl<E> FetchError<E> {
    /// The producer's error, if that is what caused the failure
    pub fn producer_error(&self) -> Option<&E> {
        match self {
            FetchError::Producer(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout(_))
    }
}

impl<E> Clone for FetchError<E> {
    fn clone(&self) -> Self {
        match self {
            FetchError::Producer(err) => FetchError::Producer(Arc::clone(err)),
            FetchError::Timeout(limit) => FetchError::Timeout(*limit),
            FetchError::Panicked => FetchError::Panicked,
        }
    }
}
