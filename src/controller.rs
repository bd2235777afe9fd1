//! Traffic controller: the registry of scope policies and the single source of truth for
//! permission checks, outcome recording, and metrics.
//!
//! Scopes are created lazily, exactly once per `(direction, name)`, on first use. Steady-state
//! checks take only a shared read lock on the registry; the write lock is reserved for the
//! create path. Each scope's bucket and breaker carry their own mutex, and counters are atomics,
//! so checks on different scopes never contend.
//!
//! ```rust
//! use std::sync::Arc;
//! use traffic_control::config::{OutboundPolicyConfig, TrafficControlConfig};
//! use traffic_control::{Outcome, TrafficController};
//!
//! let mut config = TrafficControlConfig::default();
//! let mut tiny = OutboundPolicyConfig::default();
//! tiny.bucket.capacity = 2;
//! config.providers.insert("tiny".into(), tiny);
//!
//! let controller = Arc::new(TrafficController::new(config).unwrap());
//! assert!(controller.check_outbound("tiny", 1).is_ok());
//! assert!(controller.check_outbound("tiny", 1).is_ok());
//! let refused = controller.check_outbound("tiny", 1).unwrap_err();
//! assert_eq!(refused.reason(), "rate_limit_exceeded");
//!
//! controller.record_outbound_response("tiny", Outcome::Status(200));
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, OutboundPolicyConfig, TrafficControlConfig};
use crate::error::{Rejection, TrafficError};
use crate::metrics::MetricsSnapshot;
use crate::policy::{Direction, OutboundTemplate, ScopePolicy, ScopeSnapshot};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{LogSink, NullSink, TelemetrySink, TrafficEvent};
use crate::token_bucket::{BucketLimits, BucketSnapshot, Decision, TokenBucket};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Shared scope that absorbs new names once a direction is full.
pub const OVERFLOW_SCOPE: &str = "overflow";

type Registry = RwLock<HashMap<String, Arc<ScopePolicy>>>;

/// Final outcome of an outbound operation, as reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The transport returned a response with this status code.
    Status(u16),
    /// No response: timeout, connection failure, or another transport error.
    TransportError,
    /// The request never left the process (malformed URL, unencodable body). Neutral.
    NotSent,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Status(200..=299))
    }

    /// 5xx and transport errors count against the breaker; everything else is neutral.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Status(500..=599) | Outcome::TransportError)
    }
}

/// Controller-wide figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalMetrics {
    /// Counters summed across every scope in both directions.
    #[serde(flatten)]
    pub totals: MetricsSnapshot,
    pub global_rate_limit_rejections: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_bucket: Option<BucketSnapshot>,
    pub degraded_mode: bool,
    pub consecutive_failures: u64,
    pub outbound_scopes: Vec<String>,
    pub inbound_scopes: Vec<String>,
}

/// Answer to [`TrafficController::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricsReport {
    Global(GlobalMetrics),
    Scope(ScopeSnapshot),
}

/// Everything the status endpoint reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub global: GlobalMetrics,
    /// Keyed `outbound:<name>` / `inbound:<name>`.
    pub scopes: BTreeMap<String, ScopeSnapshot>,
}

/// A refused or neutral half-open probe must not hold its slot.
fn release_probe(policy: &ScopePolicy) {
    if let Some(breaker) = policy.breaker() {
        breaker.release_probe();
    }
}

/// The traffic controller. Construct once at startup and share via `Arc`.
#[derive(Debug)]
pub struct TrafficController {
    config: TrafficControlConfig,
    outbound_default: OutboundTemplate,
    outbound_templates: HashMap<String, OutboundTemplate>,
    inbound_default: BucketLimits,
    inbound_limits: HashMap<String, BucketLimits>,
    outbound: Registry,
    inbound: Registry,
    global_bucket: Option<TokenBucket>,
    global_rejections: AtomicU64,
    consecutive_failures: AtomicU64,
    degraded: AtomicBool,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl TrafficController {
    /// Controller with the monotonic clock, tokio sleeper, and config-selected sink.
    pub fn new(config: TrafficControlConfig) -> Result<Self, TrafficError> {
        Self::builder(config).build()
    }

    /// Controller configured from `TRAFFIC_CONTROL_*` environment variables.
    pub fn from_env() -> Result<Self, TrafficError> {
        Self::new(TrafficControlConfig::from_env()?)
    }

    pub fn builder(config: TrafficControlConfig) -> TrafficControllerBuilder {
        TrafficControllerBuilder::new(config)
    }

    pub fn config(&self) -> &TrafficControlConfig {
        &self.config
    }

    /// Ask permission for an outbound call on `scope`, spending `tokens`.
    ///
    /// The breaker is consulted first, then the scope's bucket, then the controller-wide cap.
    pub fn check_outbound(&self, scope: &str, tokens: u32) -> Result<(), Rejection> {
        let policy = self.resolve(Direction::Outbound, scope);
        if let Some(breaker) = policy.breaker() {
            if !breaker.is_request_allowed() {
                policy.metrics().record_circuit_open_rejection();
                return Err(self.refuse(&policy, Rejection::CircuitOpen));
            }
        }
        if let Decision::Denied { wait } = policy.bucket().try_acquire(tokens) {
            policy.metrics().record_rate_limited();
            release_probe(&policy);
            return Err(self.refuse(&policy, Rejection::RateLimited { wait }));
        }
        if let Some(global) = &self.global_bucket {
            if let Decision::Denied { wait } = global.try_acquire(tokens) {
                self.global_rejections.fetch_add(1, Ordering::Relaxed);
                release_probe(&policy);
                return Err(self.refuse(&policy, Rejection::GlobalLimit { wait }));
            }
        }
        policy.metrics().record_request();
        Ok(())
    }

    /// Record the final outcome of an outbound operation on `scope`.
    pub fn record_outbound_response(&self, scope: &str, outcome: Outcome) {
        let policy = self.resolve(Direction::Outbound, scope);
        if let Outcome::Status(status) = outcome {
            policy.metrics().record_status(status);
        }
        if let Some(breaker) = policy.breaker() {
            let transition = if outcome.is_success() {
                breaker.record_success()
            } else if outcome.is_failure() {
                breaker.record_failure()
            } else {
                breaker.release_probe();
                None
            };
            if let Some(state) = transition {
                self.sink.emit(&TrafficEvent::CircuitTransition {
                    scope: policy.name().to_string(),
                    state,
                });
            }
        }
        self.track_health(outcome);
    }

    /// Ask permission for an inbound request to endpoint `group`. Never touches a breaker.
    pub fn check_inbound(&self, group: &str, tokens: u32) -> Result<(), Rejection> {
        let policy = self.resolve(Direction::Inbound, group);
        match policy.bucket().try_acquire(tokens) {
            Decision::Allowed { .. } => {
                policy.metrics().record_request();
                Ok(())
            }
            Decision::Denied { wait } => {
                policy.metrics().record_rate_limited();
                Err(self.refuse(&policy, Rejection::RateLimited { wait }))
            }
        }
    }

    /// Count the status an inbound handler produced for `group`.
    pub fn record_inbound_response(&self, group: &str, status: u16) {
        self.resolve(Direction::Inbound, group).metrics().record_status(status);
    }

    /// Count one scheduled retry against outbound `scope`.
    pub fn record_retry(&self, scope: &str) {
        self.resolve(Direction::Outbound, scope).metrics().record_retry();
    }

    /// Retry policy to use for one operation on `scope`. Single-attempt while degraded.
    pub fn outbound_retry_policy(&self, scope: &str) -> RetryPolicy {
        let policy = self.resolve(Direction::Outbound, scope);
        let retry = policy.retry().unwrap_or(&self.outbound_default.retry);
        if self.is_degraded() {
            retry.with_max_attempts(1)
        } else {
            retry.clone()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Metrics for one scope, or global totals when `scope` is `None`.
    ///
    /// `scope` is `outbound:<name>`, `inbound:<name>`, or a bare name looked up outbound first.
    /// Lookups never create scopes.
    pub fn metrics(&self, scope: Option<&str>) -> Result<MetricsReport, TrafficError> {
        match scope {
            None => Ok(MetricsReport::Global(self.global_metrics())),
            Some(key) => {
                let policy = self.find(key).ok_or_else(|| TrafficError::UnknownScope(key.into()))?;
                Ok(MetricsReport::Scope(policy.snapshot()))
            }
        }
    }

    /// Global figures plus a snapshot of every scope.
    pub fn status_report(&self) -> StatusReport {
        let scopes = self
            .all_policies()
            .into_iter()
            .map(|policy| (policy.direction().key(policy.name()), policy.snapshot()))
            .collect();
        StatusReport { global: self.global_metrics(), scopes }
    }

    /// Refill a scope's bucket and close its breaker.
    pub fn reset_scope(&self, scope: &str) -> Result<(), TrafficError> {
        let policy = self.find(scope).ok_or_else(|| TrafficError::UnknownScope(scope.into()))?;
        policy.bucket().reset();
        if let Some(breaker) = policy.breaker() {
            breaker.reset();
        }
        info!(
            target: "traffic_control::controller",
            scope = %policy.direction().key(policy.name()),
            "scope reset"
        );
        Ok(())
    }

    /// Forward an event to the configured telemetry sink.
    pub fn emit(&self, event: &TrafficEvent) {
        self.sink.emit(event);
    }

    fn refuse(&self, policy: &ScopePolicy, rejection: Rejection) -> Rejection {
        let scope = policy.direction().key(policy.name());
        debug!(
            target: "traffic_control::controller",
            scope = %scope,
            reason = rejection.reason(),
            wait_ms = rejection.wait().map(|w| w.as_millis() as u64),
            "request refused"
        );
        self.sink.emit(&TrafficEvent::Rejected {
            scope,
            reason: rejection.reason(),
            wait: rejection.wait(),
        });
        rejection
    }

    fn track_health(&self, outcome: Outcome) {
        let limits = &self.config.global;
        if !limits.degraded_mode_enabled {
            return;
        }
        if outcome.is_failure() {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= u64::from(limits.degraded_mode_failure_threshold)
                && !self.degraded.swap(true, Ordering::AcqRel)
            {
                warn!(
                    target: "traffic_control::controller",
                    consecutive_failures = failures,
                    "degraded mode → on: outbound retries disabled"
                );
                self.sink.emit(&TrafficEvent::DegradedModeEntered {
                    consecutive_failures: failures,
                });
            }
        } else if outcome.is_success() {
            self.consecutive_failures.store(0, Ordering::Release);
            if self.degraded.swap(false, Ordering::AcqRel) {
                info!(target: "traffic_control::controller", "degraded mode → off");
                self.sink.emit(&TrafficEvent::DegradedModeExited);
            }
        }
    }

    fn registry(&self, direction: Direction) -> &Registry {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    /// Get-or-create. The read path never blocks other readers, including for names that
    /// overflowed a full direction.
    fn resolve(&self, direction: Direction, name: &str) -> Arc<ScopePolicy> {
        let registry = self.registry(direction);
        let cached = self.cached(&registry.read().unwrap_or_else(PoisonError::into_inner), name);
        if let Some(policy) = cached {
            return policy;
        }

        let mut map = registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(policy) = self.cached(&map, name) {
            return policy;
        }
        let name = if map.len() >= self.config.max_scopes_per_direction {
            warn!(
                target: "traffic_control::controller",
                direction = %direction,
                scope = %name,
                limit = self.config.max_scopes_per_direction,
                "scope limit reached; routing to shared overflow scope"
            );
            OVERFLOW_SCOPE
        } else {
            name
        };
        map.entry(name.to_string())
            .or_insert_with(|| {
                debug!(
                    target: "traffic_control::controller",
                    direction = %direction,
                    scope = %name,
                    "scope created"
                );
                Arc::new(self.create(direction, name))
            })
            .clone()
    }

    fn create(&self, direction: Direction, name: &str) -> ScopePolicy {
        match direction {
            Direction::Outbound => {
                let template = self.outbound_templates.get(name).unwrap_or(&self.outbound_default);
                ScopePolicy::outbound(name, template, self.clock.clone())
            }
            Direction::Inbound => {
                let limits = self.inbound_limits.get(name).copied().unwrap_or(self.inbound_default);
                ScopePolicy::inbound(name, limits, self.clock.clone())
            }
        }
    }

    /// The scope `name` resolves to, if it exists: its own entry, or the overflow scope once
    /// the direction is full.
    fn cached(
        &self,
        map: &HashMap<String, Arc<ScopePolicy>>,
        name: &str,
    ) -> Option<Arc<ScopePolicy>> {
        map.get(name)
            .or_else(|| {
                if map.len() >= self.config.max_scopes_per_direction {
                    map.get(OVERFLOW_SCOPE)
                } else {
                    None
                }
            })
            .cloned()
    }

    fn lookup(&self, direction: Direction, name: &str) -> Option<Arc<ScopePolicy>> {
        self.cached(&self.registry(direction).read().unwrap_or_else(PoisonError::into_inner), name)
    }

    fn lookup_exact(&self, direction: Direction, name: &str) -> Option<Arc<ScopePolicy>> {
        self.registry(direction).read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Names that overflowed a full direction report the overflow scope. Bare names prefer an
    /// exact match in either direction over an overflow match.
    fn find(&self, key: &str) -> Option<Arc<ScopePolicy>> {
        match key.split_once(':') {
            Some(("outbound", name)) => self.lookup(Direction::Outbound, name),
            Some(("inbound", name)) => self.lookup(Direction::Inbound, name),
            _ => self
                .lookup_exact(Direction::Outbound, key)
                .or_else(|| self.lookup_exact(Direction::Inbound, key))
                .or_else(|| self.lookup(Direction::Outbound, key))
                .or_else(|| self.lookup(Direction::Inbound, key)),
        }
    }

    fn all_policies(&self) -> Vec<Arc<ScopePolicy>> {
        let mut policies: Vec<_> = [Direction::Outbound, Direction::Inbound]
            .into_iter()
            .flat_map(|direction| {
                let map = self.registry(direction).read().unwrap_or_else(PoisonError::into_inner);
                map.values().cloned().collect::<Vec<_>>()
            })
            .collect();
        policies.sort_by(|a, b| {
            (a.direction().as_str(), a.name()).cmp(&(b.direction().as_str(), b.name()))
        });
        policies
    }

    fn global_metrics(&self) -> GlobalMetrics {
        let mut totals = MetricsSnapshot::default();
        let mut outbound_scopes = Vec::new();
        let mut inbound_scopes = Vec::new();
        for policy in self.all_policies() {
            totals += policy.metrics().snapshot();
            match policy.direction() {
                Direction::Outbound => outbound_scopes.push(policy.name().to_string()),
                Direction::Inbound => inbound_scopes.push(policy.name().to_string()),
            }
        }
        GlobalMetrics {
            totals,
            global_rate_limit_rejections: self.global_rejections.load(Ordering::Relaxed),
            global_bucket: self.global_bucket.as_ref().map(TokenBucket::snapshot),
            degraded_mode: self.is_degraded(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            outbound_scopes,
            inbound_scopes,
        }
    }
}

/// Builder for [`TrafficController`]; injects time, sleeping, and telemetry.
#[derive(Debug)]
pub struct TrafficControllerBuilder {
    config: TrafficControlConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl TrafficControllerBuilder {
    pub fn new(config: TrafficControlConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            sink: None,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper used by every retry policy the controller hands out.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the sink selected by `telemetry_enabled`.
    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the config and build the controller.
    pub fn build(self) -> Result<TrafficController, TrafficError> {
        let config = self.config;
        config.validate()?;

        let retry_cap = config.global.max_retries_per_operation;
        let template = |scope: &str, policy: &OutboundPolicyConfig| {
            let mut retry = policy.retry.policy(scope, self.sleeper.clone())?;
            if let Some(cap) = retry_cap {
                retry = retry.with_max_attempts(retry.max_attempts().min(cap.saturating_add(1)));
            }
            Ok::<_, TrafficError>(OutboundTemplate {
                limits: policy.bucket.limits(scope)?,
                breaker: policy.circuit_breaker.breaker_config(scope)?,
                retry,
            })
        };
        let outbound_default = template("default", &config.outbound_default)?;
        let outbound_templates = config
            .providers
            .iter()
            .map(|(name, policy)| Ok::<_, TrafficError>((name.clone(), template(name, policy)?)))
            .collect::<Result<HashMap<_, _>, TrafficError>>()?;
        let inbound_default = config.inbound_default.bucket.limits("default")?;
        let inbound_limits = config
            .endpoint_groups
            .iter()
            .map(|(name, policy)| {
                Ok::<_, TrafficError>((name.clone(), policy.bucket.limits(name)?))
            })
            .collect::<Result<HashMap<_, _>, TrafficError>>()?;

        let global_bucket = config
            .global
            .max_requests_per_minute_global
            .map(|per_minute| {
                BucketLimits::new(per_minute, f64::from(per_minute) / 60.0)
                    .map(|limits| TokenBucket::from_limits(limits, self.clock.clone()))
            })
            .transpose()
            .map_err(|source| ConfigError::Bucket { scope: "global".into(), source })?;

        let sink: Arc<dyn TelemetrySink> = match self.sink {
            Some(sink) => sink,
            None if config.telemetry_enabled => Arc::new(LogSink),
            None => Arc::new(NullSink),
        };

        info!(
            target: "traffic_control::controller",
            providers = config.providers.len(),
            endpoint_groups = config.endpoint_groups.len(),
            global_cap = ?config.global.max_requests_per_minute_global,
            "traffic controller ready"
        );

        Ok(TrafficController {
            outbound_default,
            outbound_templates,
            inbound_default,
            inbound_limits,
            outbound: RwLock::new(HashMap::new()),
            inbound: RwLock::new(HashMap::new()),
            global_bucket,
            global_rejections: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            clock: self.clock,
            sink,
            config,
        })
    }
}
