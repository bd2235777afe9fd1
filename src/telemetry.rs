//! Telemetry and observability for traffic control.
//!
//! The controller, client wrapper, and inbound middleware describe what they do as
//! [`TrafficEvent`]s and hand them to a [`TelemetrySink`]. Sinks are synchronous and must be
//! cheap: they sit on the permission-check hot path.
//!
//! - [`LogSink`]: forwards every event to `tracing` (used when telemetry logging is enabled).
//! - [`NullSink`]: discards everything (telemetry disabled).
//! - [`MemorySink`]: bounded in-memory buffer for tests and debugging.
//!
//! ```rust
//! use traffic_control::telemetry::{MemorySink, TelemetrySink, TrafficEvent};
//! use std::time::Duration;
//!
//! let sink = MemorySink::with_capacity(16);
//! sink.emit(&TrafficEvent::RetryScheduled {
//!     scope: "github".into(),
//!     attempt: 1,
//!     delay: Duration::from_millis(500),
//! });
//! assert_eq!(sink.len(), 1);
//! ```

use crate::circuit_breaker::CircuitState;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Events emitted by traffic control components.
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficEvent {
    /// A failed outbound attempt will be retried after `delay`.
    RetryScheduled {
        scope: String,
        /// 1-indexed number of the attempt that failed.
        attempt: usize,
        delay: Duration,
    },
    /// A permission check was refused.
    Rejected {
        /// `direction:name` key of the scope.
        scope: String,
        reason: &'static str,
        wait: Option<Duration>,
    },
    /// An outbound scope's breaker changed state.
    CircuitTransition { scope: String, state: CircuitState },
    /// Consecutive outbound failures crossed the degraded-mode threshold.
    DegradedModeEntered { consecutive_failures: u64 },
    /// A success cleared degraded mode.
    DegradedModeExited,
    /// An inbound request took longer than the slow-request threshold.
    SlowRequest { path: String, group: String, elapsed: Duration },
}

impl fmt::Display for TrafficEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficEvent::RetryScheduled { scope, attempt, delay } => {
                write!(f, "Retry({scope}, #{attempt}, delay={delay:?})")
            }
            TrafficEvent::Rejected { scope, reason, wait } => match wait {
                Some(wait) => write!(f, "Rejected({scope}, {reason}, wait={wait:?})"),
                None => write!(f, "Rejected({scope}, {reason})"),
            },
            TrafficEvent::CircuitTransition { scope, state } => {
                write!(f, "CircuitBreaker({scope} → {state})")
            }
            TrafficEvent::DegradedModeEntered { consecutive_failures } => {
                write!(f, "DegradedMode(entered, failures={consecutive_failures})")
            }
            TrafficEvent::DegradedModeExited => write!(f, "DegradedMode(exited)"),
            TrafficEvent::SlowRequest { path, group, elapsed } => {
                write!(f, "SlowRequest({path}, group={group}, elapsed={elapsed:?})")
            }
        }
    }
}

/// Consumer of traffic events.
pub trait TelemetrySink: Send + Sync + fmt::Debug {
    fn emit(&self, event: &TrafficEvent);
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &TrafficEvent) {}
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: &TrafficEvent) {
        match event {
            TrafficEvent::RetryScheduled { scope, attempt, delay } => tracing::info!(
                target: "traffic_control::telemetry",
                scope = %scope,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying outbound request"
            ),
            other => {
                tracing::info!(
                    target: "traffic_control::telemetry",
                    event = %other,
                    "traffic_event"
                )
            }
        }
    }
}

/// A telemetry sink that stores the most recent events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<TrafficEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<TrafficEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TrafficEvent) {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event.clone());
    }
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        for attempt in 1..=3 {
            sink.emit(&TrafficEvent::RetryScheduled {
                scope: "s".into(),
                attempt,
                delay: Duration::ZERO,
            });
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert!(matches!(sink.events()[0], TrafficEvent::RetryScheduled { attempt: 2, .. }));
    }

    #[test]
    fn log_sink_writes_retry_fields() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(SharedWriter(buffer.clone()))
            .with_ansi(false)
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        LogSink.emit(&TrafficEvent::RetryScheduled {
            scope: "openai".into(),
            attempt: 2,
            delay: Duration::from_millis(1500),
        });

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("retrying outbound request"), "{logs}");
        assert!(logs.contains("scope=openai"), "{logs}");
        assert!(logs.contains("attempt=2"), "{logs}");
        assert!(logs.contains("delay_ms=1500"), "{logs}");
    }

    #[test]
    fn display_is_compact() {
        let event = TrafficEvent::Rejected {
            scope: "inbound:auth".into(),
            reason: "rate_limit_exceeded",
            wait: None,
        };
        assert_eq!(event.to_string(), "Rejected(inbound:auth, rate_limit_exceeded)");
    }
}
