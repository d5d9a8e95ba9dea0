//! Combined rate and concurrency limiting for artifact downloads.
//!
//! This module provides the [`RateLimiter`] which composes an optional
//! token bucket (request pacing) with an optional counting semaphore (maximum
//! in-flight downloads).
//!
//! # Ordering
//!
//! [`RateLimiter::acquire`] takes a semaphore slot first and only then waits
//! for a token, so a caller never burns a token it cannot use yet. Dropping
//! the returned [`LimiterPermit`] frees the slot. Tokens are never returned;
//! the bucket refills on its own schedule.
//!
//! # Example
//!
//! ```
//! use collector_core::limiter::RateLimiter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RateLimiter::new(Some((5.0, 2)), Some(4))?;
//!
//! let permit = limiter.acquire().await?;
//! // ... download
//! permit.release();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Errors produced while building or using a limiter.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// Rate must be a positive, finite number of requests per second.
    #[error("invalid rate {per_second}: must be a positive number of requests per second")]
    InvalidRate {
        /// The rejected rate.
        per_second: f64,
    },

    /// Burst must allow at least one request.
    #[error("invalid burst {burst}: must be at least 1")]
    InvalidBurst {
        /// The rejected burst size.
        burst: u32,
    },

    /// Concurrency outside `1..=MAX_CONCURRENCY`.
    #[error("invalid concurrency value {value}: must be between 1 and {MAX_CONCURRENCY}")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Token bucket that refills forward-only at a fixed rate.
///
/// Callers reserve a token immediately and sleep off any deficit, so waiters
/// are served in the order they reached the bucket.
#[derive(Debug)]
pub struct TokenBucket {
    per_second: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Available tokens. Negative while callers are sleeping off reservations.
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::InvalidRate`] or [`LimiterError::InvalidBurst`]
    /// for unusable parameters.
    pub fn new(per_second: f64, burst: u32) -> Result<Self, LimiterError> {
        if !per_second.is_finite() || per_second <= 0.0 {
            return Err(LimiterError::InvalidRate { per_second });
        }
        if burst == 0 {
            return Err(LimiterError::InvalidBurst { burst });
        }
        Ok(Self {
            per_second,
            burst,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        })
    }

    /// Requests per second.
    #[must_use]
    pub fn per_second(&self) -> f64 {
        self.per_second
    }

    /// Maximum number of tokens the bucket holds.
    #[must_use]
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Waits until one token is available and consumes it.
    pub async fn wait(&self) {
        let delay = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            state.tokens = (state.tokens + elapsed.as_secs_f64() * self.per_second)
                .min(f64::from(self.burst));
            state.last_refill = now;
            state.tokens -= 1.0;

            if state.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-state.tokens / self.per_second)
            }
        };

        if !delay.is_zero() {
            trace!(delay_ms = delay.as_millis(), "waiting for rate limit token");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Capacity granted by [`RateLimiter::acquire`].
///
/// Holds the concurrency slot (if any) until dropped or released.
#[derive(Debug)]
#[must_use = "dropping the permit frees the concurrency slot immediately"]
pub struct LimiterPermit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl LimiterPermit {
    /// Frees the concurrency slot. Equivalent to dropping the permit.
    pub fn release(self) {}
}

/// Rate limiter combined with an optional concurrency bound.
///
/// Designed to be wrapped in `Arc` and shared across download tasks. A limiter
/// with neither bound is a no-op.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<TokenBucket>,
    slots: Option<Arc<Semaphore>>,
    max_concurrency: Option<usize>,
}

impl RateLimiter {
    /// Creates a limiter.
    ///
    /// * `rate` - `(requests per second, burst)`, or `None` for no pacing
    /// * `max_concurrency` - maximum held permits, or `None` for unbounded
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError`] if either bound is invalid.
    #[instrument(level = "debug")]
    pub fn new(rate: Option<(f64, u32)>, max_concurrency: Option<usize>) -> Result<Self, LimiterError> {
        let bucket = rate
            .map(|(per_second, burst)| TokenBucket::new(per_second, burst))
            .transpose()?;

        if let Some(value) = max_concurrency
            && !(1..=MAX_CONCURRENCY).contains(&value)
        {
            return Err(LimiterError::InvalidConcurrency { value });
        }

        debug!(
            rate_limited = bucket.is_some(),
            max_concurrency, "creating rate limiter"
        );

        Ok(Self {
            bucket,
            slots: max_concurrency.map(|value| Arc::new(Semaphore::new(value))),
            max_concurrency,
        })
    }

    /// Creates a limiter that never blocks.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            bucket: None,
            slots: None,
            max_concurrency: None,
        }
    }

    /// Returns whether the limiter applies neither pacing nor a concurrency bound.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.bucket.is_none() && self.slots.is_none()
    }

    /// Configured concurrency bound.
    #[must_use]
    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Currently free concurrency slots, if concurrency is bounded.
    #[must_use]
    pub fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|slots| slots.available_permits())
    }

    /// Acquires one unit of combined capacity.
    ///
    /// Blocks on a concurrency slot first, then on a rate token.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::SemaphoreClosed`] if the semaphore was closed.
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterError> {
        let slot = match &self.slots {
            Some(slots) => Some(
                Arc::clone(slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| LimiterError::SemaphoreClosed)?,
            ),
            None => None,
        };

        if let Some(bucket) = &self.bucket {
            bucket.wait().await;
        }

        Ok(LimiterPermit { _slot: slot })
    }
}
