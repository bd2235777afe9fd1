//! Retry policy implementation
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - The caller-supplied `should_retry` predicate decides whether an error is retriable; a
//!   non-retriable error is returned immediately.
//! - Delay before retry `n` is `calculate_delay(n)` where `n` is the 0-indexed attempt that just
//!   failed: exponential backoff capped at `max_delay`, then symmetric jitter.
//! - Sleeper controls how delays are applied (production uses `TokioSleeper`; tests can inject
//!   `InstantSleeper`/`TrackingSleeper`).
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - Exhaustion returns the last error unchanged.
//! - `on_retry` fires exactly once per scheduled retry, before the sleep.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use traffic_control::{InstantSleeper, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(100))
//!     .jitter_factor(0.1)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), &str> = policy
//!     .execute(|| async { Err("boom") }, |_e| true, |_attempt| {})
//!     .await;
//! assert_eq!(result, Err("boom"));
//! # });
//! ```

use crate::backoff::{Backoff, BackoffError};
use crate::jitter::{Jitter, JitterError};
use crate::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Information passed to the `on_retry` hook before each backoff sleep.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 0-indexed attempt that just failed.
    pub attempt: usize,
    /// Delay that will be slept before the next attempt.
    pub delay: Duration,
    /// Error returned by the failed attempt.
    pub error: &'a E,
}

/// Retry policy combining backoff, jitter, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl RetryPolicy {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Copy of this policy with a different attempt ceiling (at least one attempt).
    pub fn with_max_attempts(&self, max_attempts: usize) -> Self {
        Self { max_attempts: max_attempts.max(1), ..self.clone() }
    }

    /// Jittered delay to wait after the 0-indexed `attempt` failed.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt))
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, E, Fut, Op, P, C>(
        &self,
        mut operation: Op,
        should_retry: P,
        mut on_retry: C,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        C: FnMut(&RetryAttempt<'_, E>),
    {
        let mut attempt = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match self.next_delay(attempt, &error, &should_retry) {
                Some(delay) => {
                    on_retry(&RetryAttempt { attempt, delay, error: &error });
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(error),
            }
        }
    }

    /// Blocking twin of [`RetryPolicy::execute`]; sleeps the calling thread between attempts.
    pub fn execute_blocking<T, E, Op, P, C>(
        &self,
        mut operation: Op,
        should_retry: P,
        mut on_retry: C,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        C: FnMut(&RetryAttempt<'_, E>),
    {
        let mut attempt = 0;
        loop {
            let error = match operation() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match self.next_delay(attempt, &error, &should_retry) {
                Some(delay) => {
                    on_retry(&RetryAttempt { attempt, delay, error: &error });
                    self.sleeper.sleep_blocking(delay);
                    attempt += 1;
                }
                None => return Err(error),
            }
        }
    }

    fn next_delay<E, P>(&self, attempt: usize, error: &E, should_retry: &P) -> Option<Duration>
    where
        P: Fn(&E) -> bool,
    {
        if !should_retry(error) || attempt + 1 >= self.max_attempts {
            return None;
        }
        Some(self.calculate_delay(attempt))
    }
}

/// HTTP status classification shared by the client wrapper: 429 and 5xx are transient.
pub fn is_retriable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Builder for `RetryPolicy`.
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
    jitter_factor: f64,
    sleeper: Arc<dyn Sleeper>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Jitter(#[from] JitterError),
}

impl RetryPolicyBuilder {
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_factor: 0.1,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Fraction of the delay used as symmetric jitter, within `[0, 1]`.
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Share an existing sleeper.
    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        let backoff = Backoff::exponential(self.initial_delay, self.exponential_base)?;
        let backoff = if self.max_delay.is_zero() && self.initial_delay.is_zero() {
            backoff
        } else {
            backoff.with_max(self.max_delay)?
        };
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff,
            jitter: Jitter::proportional(self.jitter_factor)?,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
