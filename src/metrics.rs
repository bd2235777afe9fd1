//! Per-scope traffic counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter block owned by one scope. All counters are monotonically increasing.
#[derive(Debug, Default)]
pub struct TrafficMetrics {
    total_requests: AtomicU64,
    total_2xx: AtomicU64,
    total_4xx: AtomicU64,
    total_5xx: AtomicU64,
    total_429: AtomicU64,
    total_retries: AtomicU64,
    total_circuit_open_rejections: AtomicU64,
    total_rate_limited: AtomicU64,
}

/// Plain copy of a [`TrafficMetrics`] block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_2xx: u64,
    pub total_4xx: u64,
    pub total_5xx: u64,
    pub total_429: u64,
    pub total_retries: u64,
    pub total_circuit_open_rejections: u64,
    pub total_rate_limited: u64,
}

impl std::ops::AddAssign for MetricsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.total_requests += rhs.total_requests;
        self.total_2xx += rhs.total_2xx;
        self.total_4xx += rhs.total_4xx;
        self.total_5xx += rhs.total_5xx;
        self.total_429 += rhs.total_429;
        self.total_retries += rhs.total_retries;
        self.total_circuit_open_rejections += rhs.total_circuit_open_rejections;
        self.total_rate_limited += rhs.total_rate_limited;
    }
}

impl TrafficMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_open_rejection(&self) {
        self.total_circuit_open_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Bucket a response status. 429 counts as both a 4xx and a 429.
    pub fn record_status(&self, status: u16) {
        match status {
            200..=299 => {
                self.total_2xx.fetch_add(1, Ordering::Relaxed);
            }
            400..=499 => {
                self.total_4xx.fetch_add(1, Ordering::Relaxed);
                if status == 429 {
                    self.total_429.fetch_add(1, Ordering::Relaxed);
                }
            }
            500..=599 => {
                self.total_5xx.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_2xx: self.total_2xx.load(Ordering::Relaxed),
            total_4xx: self.total_4xx.load(Ordering::Relaxed),
            total_5xx: self.total_5xx.load(Ordering::Relaxed),
            total_429: self.total_429.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            total_circuit_open_rejections: self
                .total_circuit_open_rejections
                .load(Ordering::Relaxed),
            total_rate_limited: self.total_rate_limited.load(Ordering::Relaxed),
        }
    }
}
