//! Per-scope policy: one bucket, an optional breaker and retry policy, and a counter block.

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::clock::Clock;
use crate::metrics::TrafficMetrics;
use crate::retry::RetryPolicy;
use crate::token_bucket::{BucketLimits, BucketSnapshot, TokenBucket};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which namespace a scope lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Calls this service makes to external providers.
    Outbound,
    /// Calls made to this service's own API.
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    /// `direction:name` key used by status reports.
    pub fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.as_str())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated ingredients for every outbound scope resolved to the same config entry.
#[derive(Debug, Clone)]
pub struct OutboundTemplate {
    pub limits: BucketLimits,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

/// Everything the controller tracks for one scope.
#[derive(Debug)]
pub struct ScopePolicy {
    name: String,
    direction: Direction,
    bucket: TokenBucket,
    breaker: Option<CircuitBreaker>,
    retry: Option<RetryPolicy>,
    metrics: TrafficMetrics,
}

impl ScopePolicy {
    pub fn outbound(name: &str, template: &OutboundTemplate, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            direction: Direction::Outbound,
            bucket: TokenBucket::from_limits(template.limits, clock.clone()),
            breaker: Some(CircuitBreaker::with_clock(name, template.breaker.clone(), clock)),
            retry: Some(template.retry.clone()),
            metrics: TrafficMetrics::new(),
        }
    }

    /// Inbound scopes carry a bucket only.
    pub fn inbound(name: &str, limits: BucketLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            direction: Direction::Inbound,
            bucket: TokenBucket::from_limits(limits, clock),
            breaker: None,
            retry: None,
            metrics: TrafficMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn metrics(&self) -> &TrafficMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> ScopeSnapshot {
        ScopeSnapshot {
            scope: self.name.clone(),
            direction: self.direction,
            counters: self.metrics.snapshot(),
            bucket: self.bucket.snapshot(),
            circuit_breaker: self.breaker.as_ref().map(CircuitBreaker::snapshot),
        }
    }
}

/// Serializable view of one scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSnapshot {
    pub scope: String,
    pub direction: Direction,
    #[serde(flatten)]
    pub counters: crate::metrics::MetricsSnapshot,
    pub bucket: BucketSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<BreakerSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::InstantSleeper;
    use std::time::Duration;

    fn template() -> OutboundTemplate {
        OutboundTemplate {
            limits: BucketLimits::new(2, 1.0).unwrap(),
            breaker: CircuitBreakerConfig::new(2, 1, Duration::from_secs(5), 1).unwrap(),
            retry: RetryPolicy::builder().with_sleeper(InstantSleeper).build().unwrap(),
        }
    }

    #[test]
    fn outbound_owns_everything_inbound_only_a_bucket() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let out = ScopePolicy::outbound("github", &template(), clock.clone());
        assert!(out.breaker().is_some());
        assert!(out.retry().is_some());

        let inbound = ScopePolicy::inbound("auth", BucketLimits::new(3, 0.0).unwrap(), clock);
        assert!(inbound.breaker().is_none());
        assert!(inbound.retry().is_none());
        assert_eq!(inbound.bucket().capacity(), 3);
    }

    #[test]
    fn snapshot_serializes_flat_counters() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let policy = ScopePolicy::outbound("github", &template(), clock);
        policy.metrics().record_request();
        policy.bucket().acquire(1);

        let json = serde_json::to_value(policy.snapshot()).unwrap();
        assert_eq!(json["scope"], "github");
        assert_eq!(json["direction"], "outbound");
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["bucket"]["available_tokens"], 1.0);
        assert_eq!(json["circuit_breaker"]["state"], "closed");
    }

    #[test]
    fn direction_keys() {
        assert_eq!(Direction::Inbound.key("api"), "inbound:api");
        assert_eq!(Direction::Outbound.to_string(), "outbound");
    }
}
