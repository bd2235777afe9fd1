//! Token bucket rate limiter.
//!
//! Holds up to `capacity` tokens and replenishes them continuously at `refill_rate` tokens per
//! second. Refill is computed lazily on every access from the injected [`Clock`]; there is no
//! background timer. Every operation runs inside one mutex so concurrent acquisitions can never
//! double-spend a token.

use crate::clock::{Clock, MonotonicClock};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The decision returned by [`TokenBucket::try_acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Tokens left after this acquisition.
        remaining: f64,
    },
    /// The request is denied.
    Denied {
        /// How long until enough tokens will have accumulated. `None` when waiting cannot help
        /// (zero refill rate, or a request larger than the bucket).
        wait: Option<Duration>,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Suggested wait for denied decisions.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { wait } => *wait,
        }
    }
}

/// Errors produced when validating bucket parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenBucketError {
    #[error("capacity must be > 0")]
    ZeroCapacity,
    #[error("refill_rate must be finite and >= 0 (got {0})")]
    InvalidRefillRate(f64),
}

/// Validated bucket parameters, shared by every bucket created for a scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    capacity: u32,
    refill_rate: f64,
}

impl BucketLimits {
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self, TokenBucketError> {
        if capacity == 0 {
            return Err(TokenBucketError::ZeroCapacity);
        }
        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(TokenBucketError::InvalidRefillRate(refill_rate));
        }
        Ok(Self { capacity, refill_rate })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// Point-in-time view of a bucket for metrics reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub available_tokens: f64,
    pub capacity: u32,
    pub refill_rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// A Token Bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Full bucket using the monotonic clock.
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self, TokenBucketError> {
        Self::with_clock(capacity, refill_rate, Arc::new(MonotonicClock::default()))
    }

    /// Full bucket driven by `clock`.
    pub fn with_clock(
        capacity: u32,
        refill_rate: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenBucketError> {
        Ok(Self::from_limits(BucketLimits::new(capacity, refill_rate)?, clock))
    }

    /// Full bucket from already-validated limits.
    pub fn from_limits(limits: BucketLimits, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            capacity: limits.capacity,
            refill_rate: limits.refill_rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(limits.capacity),
                last_refill_millis: now,
            }),
            clock,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Take `n` tokens if available, otherwise report how long to wait.
    pub fn try_acquire(&self, n: u32) -> Decision {
        let cost = f64::from(n);
        let mut state = self.refilled();
        if state.tokens >= cost {
            state.tokens -= cost;
            return Decision::Allowed { remaining: state.tokens };
        }
        let wait = if self.refill_rate > 0.0 && n <= self.capacity {
            Duration::try_from_secs_f64((cost - state.tokens) / self.refill_rate).ok()
        } else {
            None
        };
        Decision::Denied { wait }
    }

    /// Take `n` tokens if available.
    pub fn acquire(&self, n: u32) -> bool {
        self.try_acquire(n).is_allowed()
    }

    /// Current token level after refill.
    pub fn available_tokens(&self) -> f64 {
        self.refilled().tokens
    }

    /// Refill to capacity.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        state.tokens = f64::from(self.capacity);
        state.last_refill_millis = now;
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            available_tokens: self.available_tokens(),
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // Critical sections are plain arithmetic; a poisoned guard still holds valid state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refilled(&self) -> MutexGuard<'_, BucketState> {
        let mut state = self.lock();
        let now = self.clock.now_millis();
        let elapsed_secs = now.saturating_sub(state.last_refill_millis) as f64 / 1_000.0;
        let refilled = state.tokens + elapsed_secs * self.refill_rate;
        state.tokens = refilled.min(f64::from(self.capacity));
        // Never move the refill mark backwards.
        state.last_refill_millis = state.last_refill_millis.max(now);
        state
    }
}
