#![allow(dead_code)]

use std::sync::Arc;
use traffic_control::config::{OutboundPolicyConfig, TrafficControlConfig};
use traffic_control::telemetry::MemorySink;
use traffic_control::{InstantSleeper, ManualClock, TrafficController};

/// Defaults without the global cap, so tests only see the limits they configure.
pub fn config() -> TrafficControlConfig {
    let mut config = TrafficControlConfig::default();
    config.global.max_requests_per_minute_global = None;
    config
}

pub fn provider(
    capacity: u32,
    failure_threshold: u32,
    max_attempts: usize,
) -> OutboundPolicyConfig {
    let mut policy = OutboundPolicyConfig::default();
    policy.bucket.capacity = capacity;
    policy.bucket.refill_rate = 0.0;
    policy.circuit_breaker.failure_threshold = failure_threshold;
    policy.retry.max_attempts = max_attempts;
    policy.retry.initial_delay_seconds = 0.01;
    policy
}

pub struct Harness {
    pub controller: Arc<TrafficController>,
    pub sink: MemorySink,
    pub clock: ManualClock,
}

/// Controller with a manual clock, instant retries, and an in-memory telemetry sink.
pub fn harness(config: TrafficControlConfig) -> Harness {
    let sink = MemorySink::new();
    let clock = ManualClock::new();
    let controller = TrafficController::builder(config)
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(InstantSleeper))
        .telemetry_sink(Arc::new(sink.clone()))
        .build()
        .expect("valid config");
    Harness { controller: Arc::new(controller), sink, clock }
}
