//! Jitter strategies to prevent thundering herd
//!
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Proportional(f)`: uniform perturbation in `[-delay*f, +delay*f]`, clamped at zero.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Errors produced when building a jitter strategy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JitterError {
    #[error("jitter factor must be within [0.0, 1.0] (got {0})")]
    InvalidFactor(f64),
}

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Symmetric jitter proportional to the delay.
    Proportional(f64),
}

impl Jitter {
    /// Symmetric jitter of `factor * delay` in either direction. A zero factor yields `None`.
    pub fn proportional(factor: f64) -> Result<Self, JitterError> {
        if !factor.is_finite() || !(0.0..=1.0).contains(&factor) {
            return Err(JitterError::InvalidFactor(factor));
        }
        if factor == 0.0 {
            return Ok(Jitter::None);
        }
        Ok(Jitter::Proportional(factor))
    }

    /// Configured factor (0 for `None`).
    pub fn factor(&self) -> f64 {
        match self {
            Jitter::None => 0.0,
            Jitter::Proportional(f) => *f,
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional(factor) => {
                let base = delay.as_secs_f64();
                let spread = base * factor;
                if spread <= 0.0 {
                    return delay;
                }
                let offset = rng.random_range(-spread..=spread);
                Duration::try_from_secs_f64((base + offset).max(0.0)).unwrap_or(delay)
            }
        }
    }
}
