#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Traffic Control
//!
//! Concurrency-safe traffic control for both directions of a service: outbound calls to
//! external providers, and inbound calls to the service's own API.
//!
//! ## Features
//!
//! - **Token buckets** with lazy, exact refill arithmetic
//! - **Circuit breakers** with bounded half-open probing
//! - **Retry policies** with exponential backoff and symmetric jitter
//! - **Per-scope isolation** through a lazily populated registry
//! - **Global safeguards**: a controller-wide request ceiling, a retry cap, and degraded mode
//! - **Adapters**: `reqwest` client wrappers, a `tower` inbound layer, and an `axum` status router
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use traffic_control::{RequestOptions, TrafficClient, TrafficController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     traffic_control::telemetry::init_tracing();
//!     let controller = Arc::new(TrafficController::from_env()?);
//!
//!     let github = TrafficClient::new("github", controller.clone());
//!     let response = github.get("https://api.github.com/zen", RequestOptions::new()).await?;
//!     println!("{}", response.text().await?);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod jitter;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod retry;
pub mod sleeper;
pub mod status;
pub mod telemetry;
pub mod token_bucket;

// Re-exports
pub use backoff::Backoff;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{BlockingTrafficClient, ClientError, RequestOptions, TrafficClient};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::TrafficControlConfig;
pub use controller::{MetricsReport, Outcome, StatusReport, TrafficController};
pub use error::{Rejection, TrafficError};
pub use jitter::Jitter;
pub use middleware::{InboundLayer, InboundService};
pub use policy::{Direction, ScopePolicy};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use token_bucket::{Decision, TokenBucket};
