//! Error and refusal types for the traffic controller
use crate::config::ConfigError;
use std::fmt;
use std::time::Duration;

/// Retry-After value used when a refusal carries no wait hint.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// A permission check that was refused. Not an error: refusals are normal operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// The scope's circuit breaker is open.
    CircuitOpen,
    /// The scope's token bucket is starved.
    RateLimited {
        /// Time until enough tokens accumulate, when waiting can help.
        wait: Option<Duration>,
    },
    /// The controller-wide request ceiling is exhausted.
    GlobalLimit { wait: Option<Duration> },
}

impl Rejection {
    /// Stable machine-readable reason string.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_breaker_open",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::GlobalLimit { .. } => "global_rate_limit_exceeded",
        }
    }

    pub fn wait(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen => None,
            Self::RateLimited { wait } | Self::GlobalLimit { wait } => *wait,
        }
    }

    /// Whole seconds for a `Retry-After` header: rounded up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        match self.wait() {
            Some(wait) => (wait.as_secs_f64().ceil() as u64).max(1),
            None => DEFAULT_RETRY_AFTER_SECS,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::GlobalLimit { .. })
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.wait() {
            Some(wait) => write!(f, "{} (retry after {:.2}s)", self.reason(), wait.as_secs_f64()),
            None => f.write_str(self.reason()),
        }
    }
}

/// Errors returned by the controller.
#[derive(Debug, thiserror::Error)]
pub enum TrafficError {
    /// A metrics lookup named a scope that has never been used.
    #[error("unknown scope '{0}'")]
    UnknownScope(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TrafficError {
    pub fn is_unknown_scope(&self) -> bool {
        matches!(self, Self::UnknownScope(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_stable() {
        assert_eq!(Rejection::CircuitOpen.reason(), "circuit_breaker_open");
        assert_eq!(Rejection::RateLimited { wait: None }.reason(), "rate_limit_exceeded");
        assert_eq!(Rejection::GlobalLimit { wait: None }.reason(), "global_rate_limit_exceeded");
    }

    #[test]
    fn retry_after_rounds_up_with_floor() {
        let wait = |ms| Rejection::RateLimited { wait: Some(Duration::from_millis(ms)) };
        assert_eq!(wait(1).retry_after_secs(), 1);
        assert_eq!(wait(1_000).retry_after_secs(), 1);
        assert_eq!(wait(1_001).retry_after_secs(), 2);
        assert_eq!(wait(0).retry_after_secs(), 1);
        assert_eq!(Rejection::RateLimited { wait: None }.retry_after_secs(), 60);
        assert_eq!(Rejection::CircuitOpen.retry_after_secs(), 60);
    }

    #[test]
    fn display_includes_wait() {
        let r = Rejection::RateLimited { wait: Some(Duration::from_millis(1500)) };
        assert_eq!(r.to_string(), "rate_limit_exceeded (retry after 1.50s)");
        assert_eq!(Rejection::CircuitOpen.to_string(), "circuit_breaker_open");
    }
}
