//! Exponential backoff schedule for retry policies.
//!
//! Attempt semantics: attempt index `0` is the first *failed* attempt, so the delay before the
//! first retry is `initial`. Each later index multiplies by `base`, and the result is capped at
//! `max`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use traffic_control::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_secs(1), 2.0)
//!     .unwrap()
//!     .with_max(Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_secs(1));
//! assert_eq!(backoff.delay(1), Duration::from_secs(2));
//! assert_eq!(backoff.delay(2), Duration::from_secs(4));
//! assert_eq!(backoff.delay(10), Duration::from_secs(5)); // capped
//! ```
//!
//! Overflow behavior: computations that overflow or produce non-finite values saturate to
//! `MAX_BACKOFF` (1 day).

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    #[error("exponential base must be finite and >= 1.0 (got {0})")]
    InvalidBase(f64),
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= initial delay ({initial:?})")]
    MaxLessThanInitial { initial: Duration, max: Duration },
}

/// Exponential backoff: `min(initial * base^attempt, max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    base: f64,
    max: Duration,
}

impl Backoff {
    /// Create an exponential schedule. `base` must be finite and at least 1.
    pub fn exponential(initial: Duration, base: f64) -> Result<Self, BackoffError> {
        if !base.is_finite() || base < 1.0 {
            return Err(BackoffError::InvalidBase(base));
        }
        Ok(Self { initial, base, max: MAX_BACKOFF })
    }

    /// Cap every computed delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.initial {
            return Err(BackoffError::MaxLessThanInitial { initial: self.initial, max });
        }
        self.max = max;
        Ok(self)
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Un-jittered delay for a 0-indexed attempt.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.base.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        if !capped.is_finite() || capped >= MAX_BACKOFF.as_secs_f64() {
            return self.max.min(MAX_BACKOFF);
        }
        Duration::from_secs_f64(capped.max(0.0))
    }
}
