//! Three-state circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open → HalfOpen lazily, on the
//! first permission check after `timeout` has elapsed since the last failure. HalfOpen grants at
//! most `half_open_max_calls` probes; `success_threshold` successes close the circuit and any
//! failure re-opens it.
//!
//! The permission check and the state mutation it implies happen in one critical section, so
//! two callers can never both claim the last half-open probe slot.

use crate::clock::{Clock, MonotonicClock};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the recovery timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    half_open_max_calls: u32,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: u32 },
    #[error("success_threshold must be > 0 (got {provided})")]
    InvalidSuccessThreshold { provided: u32 },
    #[error("timeout must be > 0 (got {0:?})")]
    InvalidTimeout(Duration),
    #[error("half_open_max_calls must be > 0 (got {provided})")]
    InvalidHalfOpenLimit { provided: u32 },
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        timeout: Duration,
        half_open_max_calls: u32,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 });
        }
        if timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidTimeout(timeout));
        }
        if half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 });
        }
        Ok(Self { failure_threshold, success_threshold, timeout, half_open_max_calls })
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Half-open successes required to close.
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// Time to stay Open after the last failure.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Maximum probes granted while Half-Open.
    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

/// Point-in-time view of a breaker for metrics reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: f64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_millis: Option<u64>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure_millis: None,
        }
    }
}

/// Circuit breaker guarding one scope.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Breaker using the monotonic clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { name: name.into(), config, state: Mutex::new(BreakerState::closed()), clock }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Grant or deny one call, performing the lazy Open → HalfOpen transition.
    pub fn is_request_allowed(&self) -> bool {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let now = self.clock.now_millis();
                let opened_at = st.last_failure_millis.unwrap_or(now);
                let elapsed = Duration::from_millis(now.saturating_sub(opened_at));
                if elapsed < self.config.timeout {
                    return false;
                }
                st.state = CircuitState::HalfOpen;
                st.success_count = 0;
                st.half_open_calls = 1;
                tracing::info!(
                    target: "traffic_control::circuit_breaker",
                    scope = %self.name,
                    "Circuit breaker → half-open"
                );
                true
            }
            CircuitState::HalfOpen => {
                if st.half_open_calls >= self.config.half_open_max_calls {
                    return false;
                }
                st.half_open_calls += 1;
                tracing::debug!(
                    target: "traffic_control::circuit_breaker",
                    scope = %self.name,
                    in_flight = st.half_open_calls,
                    max = self.config.half_open_max_calls,
                    "Circuit breaker: half-open probe granted"
                );
                true
            }
        }
    }

    /// Record a successful call. Returns the new state if a transition happened.
    ///
    /// Any success in the closed state resets the failure streak, so only consecutive failures
    /// trip the breaker.
    pub fn record_success(&self) -> Option<CircuitState> {
        let mut st = self.lock();
        match st.state {
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.success_threshold {
                    *st = BreakerState::closed();
                    tracing::info!(
                        target: "traffic_control::circuit_breaker",
                        scope = %self.name,
                        "Circuit breaker → closed"
                    );
                    return Some(CircuitState::Closed);
                }
                None
            }
            CircuitState::Closed => {
                st.failure_count = 0;
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed call. Returns the new state if a transition happened.
    pub fn record_failure(&self) -> Option<CircuitState> {
        let now = self.clock.now_millis();
        let mut st = self.lock();
        st.last_failure_millis = Some(now);
        match st.state {
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                st.success_count = 0;
                st.half_open_calls = 0;
                tracing::warn!(
                    target: "traffic_control::circuit_breaker",
                    scope = %self.name,
                    "Circuit breaker: probe failed → open"
                );
                Some(CircuitState::Open)
            }
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.config.failure_threshold {
                    st.state = CircuitState::Open;
                    tracing::error!(
                        target: "traffic_control::circuit_breaker",
                        scope = %self.name,
                        failures = st.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Give back a half-open probe slot whose call never produced a verdict.
    ///
    /// Callers use this when a granted probe is refused further down the chain or ends with an
    /// outcome that neither closes nor re-opens the circuit. No effect outside HalfOpen.
    pub fn release_probe(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen && st.half_open_calls > 0 {
            st.half_open_calls -= 1;
            tracing::debug!(
                target: "traffic_control::circuit_breaker",
                scope = %self.name,
                in_flight = st.half_open_calls,
                "Circuit breaker: half-open probe released"
            );
        }
    }

    /// Force Closed with all counters zeroed.
    pub fn reset(&self) {
        *self.lock() = BreakerState::closed();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let st = self.lock();
        BreakerSnapshot {
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            half_open_calls: st.half_open_calls,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout_seconds: self.config.timeout.as_secs_f64(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
