//! Traffic control configuration.
//!
//! [`TrafficControlConfig`] is a plain serde document. It is built once at startup, from the
//! built-in defaults, an optional JSON file, and `TRAFFIC_CONTROL_*` environment variables, and
//! then handed to [`TrafficControllerBuilder`](crate::controller::TrafficControllerBuilder), which
//! validates every section before the controller exists.
//!
//! ```rust
//! use traffic_control::config::TrafficControlConfig;
//!
//! let config = TrafficControlConfig::from_env_vars([
//!     ("TRAFFIC_CONTROL_PROVIDER_OPENAI_CAPACITY", "5"),
//!     ("TRAFFIC_CONTROL_TELEMETRY_ENABLED", "false"),
//! ])
//! .unwrap();
//! assert_eq!(config.providers["openai"].bucket.capacity, 5);
//! assert!(!config.telemetry_enabled);
//! ```

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::retry::{BuildError, RetryPolicy};
use crate::sleeper::Sleeper;
use crate::token_bucket::{BucketLimits, TokenBucketError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Prefix shared by every environment variable the config reads.
pub const ENV_PREFIX: &str = "TRAFFIC_CONTROL_";

const DEFAULT_OUTBOUND_CAPACITY: u32 = 60;
const DEFAULT_OUTBOUND_REFILL_RATE: f64 = 1.0;
const DEFAULT_INBOUND_CAPACITY: u32 = 100;
const DEFAULT_INBOUND_REFILL_RATE: f64 = 10.0;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
const DEFAULT_BREAKER_TIMEOUT_SECS: f64 = 60.0;
const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

const DEFAULT_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_INITIAL_SECS: f64 = 1.0;
const DEFAULT_RETRY_MAX_SECS: f64 = 60.0;
const DEFAULT_RETRY_BASE: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.1;

const DEFAULT_MAX_REQUESTS_PER_MINUTE_GLOBAL: u32 = 1_000;
const DEFAULT_MAX_RETRIES_PER_OPERATION: usize = 5;
const DEFAULT_DEGRADED_MODE_FAILURE_THRESHOLD: u32 = 10;
const DEFAULT_SLOW_REQUEST_MS: u64 = 1_000;
const DEFAULT_MAX_SCOPES_PER_DIRECTION: usize = 1_024;

/// Paths that never pass through inbound rate limiting.
pub const DEFAULT_ALLOW_LIST: &[&str] =
    &["/health", "/healthz", "/docs", "/openapi.json", "/status", "/metrics"];

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration { field: String, value: f64 },
    #[error("bucket for scope '{scope}': {source}")]
    Bucket {
        scope: String,
        #[source]
        source: TokenBucketError,
    },
    #[error("circuit breaker for scope '{scope}': {source}")]
    Breaker {
        scope: String,
        #[source]
        source: CircuitBreakerError,
    },
    #[error("retry policy for scope '{scope}': {source}")]
    Retry {
        scope: String,
        #[source]
        source: BuildError,
    },
    #[error("{0} must be > 0")]
    ZeroLimit(&'static str),
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl BucketConfig {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self { capacity, refill_rate }
    }

    pub fn limits(&self, scope: &str) -> Result<BucketLimits, ConfigError> {
        BucketLimits::new(self.capacity, self.refill_rate)
            .map_err(|source| ConfigError::Bucket { scope: scope.to_string(), source })
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY, DEFAULT_OUTBOUND_REFILL_RATE)
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: f64,
    pub half_open_max_calls: u32,
}

impl BreakerSettings {
    pub fn breaker_config(&self, scope: &str) -> Result<CircuitBreakerConfig, ConfigError> {
        let field = format!("{scope}.circuit_breaker.timeout_seconds");
        let timeout = seconds(&field, self.timeout_seconds)?;
        CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            timeout,
            self.half_open_max_calls,
        )
        .map_err(|source| ConfigError::Breaker { scope: scope.to_string(), source })
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout_seconds: DEFAULT_BREAKER_TIMEOUT_SECS,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

/// Retry parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub exponential_base: f64,
    pub jitter_factor: f64,
}

impl RetrySettings {
    pub fn policy(
        &self,
        scope: &str,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<RetryPolicy, ConfigError> {
        let initial =
            seconds(&format!("{scope}.retry.initial_delay_seconds"), self.initial_delay_seconds)?;
        let max = seconds(&format!("{scope}.retry.max_delay_seconds"), self.max_delay_seconds)?;
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .initial_delay(initial)
            .max_delay(max)
            .exponential_base(self.exponential_base)
            .jitter_factor(self.jitter_factor)
            .with_shared_sleeper(sleeper)
            .build()
            .map_err(|source| ConfigError::Retry { scope: scope.to_string(), source })
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_delay_seconds: DEFAULT_RETRY_INITIAL_SECS,
            max_delay_seconds: DEFAULT_RETRY_MAX_SECS,
            exponential_base: DEFAULT_RETRY_BASE,
            jitter_factor: DEFAULT_RETRY_JITTER,
        }
    }
}

/// Policy for one outbound provider (or the outbound default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundPolicyConfig {
    pub bucket: BucketConfig,
    pub circuit_breaker: BreakerSettings,
    pub retry: RetrySettings,
}

impl OutboundPolicyConfig {
    fn preset(
        capacity: u32,
        refill_rate: f64,
        failure_threshold: u32,
        timeout_seconds: f64,
    ) -> Self {
        Self {
            bucket: BucketConfig::new(capacity, refill_rate),
            circuit_breaker: BreakerSettings {
                failure_threshold,
                timeout_seconds,
                ..BreakerSettings::default()
            },
            retry: RetrySettings::default(),
        }
    }
}

/// Policy for one inbound endpoint group (or the inbound default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundPolicyConfig {
    pub bucket: BucketConfig,
}

impl InboundPolicyConfig {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self { bucket: BucketConfig::new(capacity, refill_rate) }
    }
}

impl Default for InboundPolicyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_INBOUND_CAPACITY, DEFAULT_INBOUND_REFILL_RATE)
    }
}

/// Process-wide anti-loop safeguards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLimits {
    /// Ceiling on outbound permissions across all scopes. `None` disables the cap.
    pub max_requests_per_minute_global: Option<u32>,
    /// Ceiling on retries per outbound operation. `None` keeps each scope's own limit.
    pub max_retries_per_operation: Option<usize>,
    pub degraded_mode_enabled: bool,
    /// Consecutive outbound failures that switch the controller into degraded mode.
    pub degraded_mode_failure_threshold: u32,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_requests_per_minute_global: Some(DEFAULT_MAX_REQUESTS_PER_MINUTE_GLOBAL),
            max_retries_per_operation: Some(DEFAULT_MAX_RETRIES_PER_OPERATION),
            degraded_mode_enabled: true,
            degraded_mode_failure_threshold: DEFAULT_DEGRADED_MODE_FAILURE_THRESHOLD,
        }
    }
}

/// Complete traffic control configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficControlConfig {
    pub outbound_default: OutboundPolicyConfig,
    pub inbound_default: InboundPolicyConfig,
    /// Outbound overrides keyed by provider scope.
    pub providers: HashMap<String, OutboundPolicyConfig>,
    /// Inbound overrides keyed by endpoint group.
    pub endpoint_groups: HashMap<String, InboundPolicyConfig>,
    /// Path prefix → endpoint group, resolved by longest match.
    pub routes: BTreeMap<String, String>,
    /// Paths (and their sub-paths) exempt from inbound limiting.
    pub allow_list: Vec<String>,
    pub global: GlobalLimits,
    /// Route traffic events to the log sink.
    pub telemetry_enabled: bool,
    pub slow_request_threshold_ms: u64,
    pub max_scopes_per_direction: usize,
}

impl Default for TrafficControlConfig {
    fn default() -> Self {
        let providers = HashMap::from([
            ("openai".to_string(), OutboundPolicyConfig::preset(50, 50.0 / 60.0, 3, 30.0)),
            ("anthropic".to_string(), OutboundPolicyConfig::preset(50, 50.0 / 60.0, 3, 30.0)),
            ("huggingface".to_string(), OutboundPolicyConfig::preset(30, 0.5, 3, 60.0)),
            ("github".to_string(), OutboundPolicyConfig::preset(30, 1.0, 3, 60.0)),
            ("internal".to_string(), OutboundPolicyConfig::preset(1_000, 100.0, 10, 15.0)),
        ]);
        let endpoint_groups = HashMap::from([
            ("auth".to_string(), InboundPolicyConfig::new(10, 0.5)),
            ("api".to_string(), InboundPolicyConfig::new(100, 20.0)),
            ("admin".to_string(), InboundPolicyConfig::new(20, 2.0)),
        ]);
        let routes = BTreeMap::from([
            ("/api".to_string(), "api".to_string()),
            ("/api/auth".to_string(), "auth".to_string()),
            ("/auth".to_string(), "auth".to_string()),
            ("/admin".to_string(), "admin".to_string()),
        ]);
        Self {
            outbound_default: OutboundPolicyConfig::default(),
            inbound_default: InboundPolicyConfig::default(),
            providers,
            endpoint_groups,
            routes,
            allow_list: DEFAULT_ALLOW_LIST.iter().map(|p| p.to_string()).collect(),
            global: GlobalLimits::default(),
            telemetry_enabled: true,
            slow_request_threshold_ms: DEFAULT_SLOW_REQUEST_MS,
            max_scopes_per_direction: DEFAULT_MAX_SCOPES_PER_DIRECTION,
        }
    }
}

impl TrafficControlConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(std::env::vars())
    }

    /// Load from an explicit set of variables. Keys without the `TRAFFIC_CONTROL_` prefix are
    /// ignored. `CONFIG_FILE` replaces the built-in defaults before other keys are applied.
    pub fn from_env_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .filter_map(|(k, v)| {
                k.as_ref()
                    .strip_prefix(ENV_PREFIX)
                    .map(|key| (key.to_string(), v.as_ref().to_string()))
            })
            .collect();

        let mut config = match vars.get("CONFIG_FILE") {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        for (key, value) in &vars {
            config.apply_env(key, value)?;
        }
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&raw)
    }

    /// Check every section converts into a valid component configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sleeper: Arc<dyn Sleeper> = Arc::new(crate::sleeper::InstantSleeper);
        let outbound = std::iter::once(("default", &self.outbound_default))
            .chain(self.providers.iter().map(|(k, v)| (k.as_str(), v)));
        for (scope, policy) in outbound {
            policy.bucket.limits(scope)?;
            policy.circuit_breaker.breaker_config(scope)?;
            policy.retry.policy(scope, sleeper.clone())?;
        }
        let inbound = std::iter::once(("default", &self.inbound_default))
            .chain(self.endpoint_groups.iter().map(|(k, v)| (k.as_str(), v)));
        for (scope, policy) in inbound {
            policy.bucket.limits(scope)?;
        }
        if self.global.max_requests_per_minute_global == Some(0) {
            return Err(ConfigError::ZeroLimit("max_requests_per_minute_global"));
        }
        if self.global.degraded_mode_failure_threshold == 0 {
            return Err(ConfigError::ZeroLimit("degraded_mode_failure_threshold"));
        }
        if self.max_scopes_per_direction == 0 {
            return Err(ConfigError::ZeroLimit("max_scopes_per_direction"));
        }
        Ok(())
    }

    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold_ms)
    }

    fn apply_env(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "CONFIG_FILE" => {}
            "TELEMETRY_ENABLED" => self.telemetry_enabled = parse_bool(key, value)?,
            "MAX_REQUESTS_PER_MINUTE_GLOBAL" => {
                self.global.max_requests_per_minute_global = parse_optional(key, value)?
            }
            "MAX_RETRIES_PER_OPERATION" => {
                self.global.max_retries_per_operation = parse_optional(key, value)?
            }
            "DEGRADED_MODE_ENABLED" => self.global.degraded_mode_enabled = parse_bool(key, value)?,
            "DEGRADED_MODE_FAILURE_THRESHOLD" => {
                self.global.degraded_mode_failure_threshold = parse(key, value)?
            }
            "SLOW_REQUEST_MS" => self.slow_request_threshold_ms = parse(key, value)?,
            "MAX_SCOPES_PER_DIRECTION" => self.max_scopes_per_direction = parse(key, value)?,
            _ => {
                if let Some(rest) = key.strip_prefix("PROVIDER_") {
                    return self.apply_provider(key, rest, value);
                }
                if let Some(rest) = key.strip_prefix("GROUP_") {
                    return self.apply_group(key, rest, value);
                }
                tracing::warn!(
                    target: "traffic_control::config",
                    key = %format!("{ENV_PREFIX}{key}"),
                    "ignoring unknown configuration variable"
                );
            }
        }
        Ok(())
    }

    fn apply_provider(&mut self, key: &str, rest: &str, value: &str) -> Result<(), ConfigError> {
        const FIELDS: &[&str] =
            &["CAPACITY", "REFILL_RATE", "FAILURE_THRESHOLD", "TIMEOUT_SECONDS", "MAX_ATTEMPTS"];
        let (name, field) = split_scope_field(key, rest, FIELDS, value)?;
        let default = self.outbound_default.clone();
        let policy = self.providers.entry(name).or_insert(default);
        match field {
            "CAPACITY" => policy.bucket.capacity = parse(key, value)?,
            "REFILL_RATE" => policy.bucket.refill_rate = parse(key, value)?,
            "FAILURE_THRESHOLD" => policy.circuit_breaker.failure_threshold = parse(key, value)?,
            "TIMEOUT_SECONDS" => policy.circuit_breaker.timeout_seconds = parse(key, value)?,
            _ => policy.retry.max_attempts = parse(key, value)?,
        }
        Ok(())
    }

    fn apply_group(&mut self, key: &str, rest: &str, value: &str) -> Result<(), ConfigError> {
        let (name, field) = split_scope_field(key, rest, &["CAPACITY", "REFILL_RATE"], value)?;
        let default = self.inbound_default.clone();
        let policy = self.endpoint_groups.entry(name).or_insert(default);
        match field {
            "CAPACITY" => policy.bucket.capacity = parse(key, value)?,
            _ => policy.bucket.refill_rate = parse(key, value)?,
        }
        Ok(())
    }
}

/// Split `OPENAI_REFILL_RATE` into `("openai", "REFILL_RATE")`.
fn split_scope_field<'a>(
    key: &str,
    rest: &str,
    fields: &[&'a str],
    value: &str,
) -> Result<(String, &'a str), ConfigError> {
    fields
        .iter()
        .find_map(|field| {
            let name = rest.strip_suffix(field)?.strip_suffix('_')?;
            (!name.is_empty()).then(|| (name.to_ascii_lowercase(), *field))
        })
        .ok_or_else(|| invalid(key, value))
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::InvalidDuration { field: field.to_string(), value })
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv { key: format!("{ENV_PREFIX}{key}"), value: value.to_string() }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// Empty, `none` or `off` disable an optional limit.
fn parse_optional<T: FromStr>(key: &str, value: &str) -> Result<Option<T>, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "none" | "off" => Ok(None),
        _ => parse(key, value).map(Some),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}
