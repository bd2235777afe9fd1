//! Outbound HTTP wrappers bound to one provider scope.
//!
//! Every verb follows the same contract:
//! 1. Ask the controller for permission. Refusals fail fast, before any I/O.
//! 2. Run the request through the scope's retry policy. Timeouts, connection failures, 429 and
//!    5xx are retried; other statuses surface immediately.
//! 3. Report the final outcome to the controller exactly once, then return the response or the
//!    last transport error unchanged.
//!
//! [`TrafficClient`] awaits between attempts; [`BlockingTrafficClient`] parks the calling
//! thread. The blocking client must not be used from inside an async runtime thread.

use crate::controller::{Outcome, TrafficController};
use crate::error::Rejection;
use crate::retry::{is_retriable_status, RetryAttempt};
use crate::telemetry::TrafficEvent;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::sync::Arc;
use std::time::Duration;

/// Errors returned by the client wrappers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The scope's token bucket refused the call.
    #[error("rate limit exceeded for scope '{scope}'; retry after {} seconds", wait_secs(.wait))]
    RateLimitExceeded { scope: String, wait: Option<Duration> },
    /// The scope's circuit breaker is open.
    #[error("circuit breaker open for scope '{scope}'")]
    CircuitBreakerOpen { scope: String },
    /// The controller-wide request ceiling refused the call.
    #[error("global rate limit exceeded via '{scope}'; retry after {} seconds", wait_secs(.wait))]
    GlobalLimitExceeded { scope: String, wait: Option<Duration> },
    /// The final attempt failed at the transport or returned an error status.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

fn wait_secs(wait: &Option<Duration>) -> String {
    match wait {
        Some(wait) => format!("{:.2}", wait.as_secs_f64()),
        None => "an unknown number of".to_string(),
    }
}

impl ClientError {
    fn refused(scope: &str, rejection: Rejection) -> Self {
        let scope = scope.to_string();
        match rejection {
            Rejection::CircuitOpen => ClientError::CircuitBreakerOpen { scope },
            Rejection::RateLimited { wait } => ClientError::RateLimitExceeded { scope, wait },
            Rejection::GlobalLimit { wait } => ClientError::GlobalLimitExceeded { scope, wait },
        }
    }

    /// True when the controller refused the call before any I/O.
    pub fn is_refusal(&self) -> bool {
        !matches!(self, ClientError::Transport(_))
    }

    /// Status of the final response, for errors that carry one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Default retry predicate for outbound HTTP.
///
/// Timeouts and connection failures are retriable. Errors carrying a status are retriable for
/// 429 and 5xx only, so 401/403 and other 4xx fail immediately.
pub fn is_retriable_http_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    match err.status() {
        Some(status) => is_retriable_status(status.as_u16()),
        None => err.is_request(),
    }
}

/// Outcome to report for an operation whose last attempt failed.
///
/// Only errors raised on the wire count against the provider; a request that could not be built
/// is the caller's fault and stays neutral.
fn error_outcome(err: &reqwest::Error) -> Outcome {
    match err.status() {
        Some(status) => Outcome::Status(status.as_u16()),
        None if err.is_timeout() || err.is_connect() || err.is_request() => Outcome::TransportError,
        None => Outcome::NotSent,
    }
}

#[derive(Debug, Clone)]
enum Body {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

/// Per-request options shared by every verb.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Option<Body>,
    timeout: Option<Duration>,
    tokens: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { headers: HeaderMap::new(), query: Vec::new(), body: None, timeout: None, tokens: 1 }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// JSON body; sets `Content-Type: application/json`.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(Body::Bytes(body.into()));
        self
    }

    /// Per-attempt transport timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tokens this call spends from the scope's bucket (default 1).
    pub fn tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request.headers(self.headers.clone()).query(&self.query);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        match &self.body {
            Some(Body::Json(value)) => request.json(value),
            Some(Body::Bytes(bytes)) => request.body(bytes.clone()),
            None => request,
        }
    }

    fn apply_blocking(
        &self,
        mut request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        request = request.headers(self.headers.clone()).query(&self.query);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        match &self.body {
            Some(Body::Json(value)) => request.json(value),
            Some(Body::Bytes(bytes)) => request.body(bytes.clone()),
            None => request,
        }
    }
}

/// Shared bookkeeping for both client flavours.
#[derive(Debug, Clone)]
struct ScopeHandle {
    scope: String,
    controller: Arc<TrafficController>,
}

impl ScopeHandle {
    fn permit(&self, tokens: u32) -> Result<(), ClientError> {
        self.controller
            .check_outbound(&self.scope, tokens)
            .map_err(|rejection| ClientError::refused(&self.scope, rejection))
    }

    fn on_retry(&self, attempt: &RetryAttempt<'_, reqwest::Error>) {
        tracing::debug!(
            target: "traffic_control::client",
            scope = %self.scope,
            attempt = attempt.attempt + 1,
            error = %attempt.error,
            "outbound attempt failed; retrying"
        );
        self.controller.record_retry(&self.scope);
        self.controller.emit(&TrafficEvent::RetryScheduled {
            scope: self.scope.clone(),
            attempt: attempt.attempt + 1,
            delay: attempt.delay,
        });
    }

    fn finish<T>(
        &self,
        result: Result<T, reqwest::Error>,
        status: impl FnOnce(&T) -> u16,
    ) -> Result<T, ClientError> {
        let outcome = match &result {
            Ok(response) => Outcome::Status(status(response)),
            Err(err) => error_outcome(err),
        };
        self.controller.record_outbound_response(&self.scope, outcome);
        result.map_err(ClientError::Transport)
    }
}

macro_rules! verbs {
    ($($(#[$doc:meta])* $name:ident => $method:expr;)*) => {
        $(
            $(#[$doc])*
            pub async fn $name(
                &self,
                url: &str,
                options: RequestOptions,
            ) -> Result<reqwest::Response, ClientError> {
                self.request($method, url, options).await
            }
        )*
    };
}

macro_rules! blocking_verbs {
    ($($(#[$doc:meta])* $name:ident => $method:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(
                &self,
                url: &str,
                options: RequestOptions,
            ) -> Result<reqwest::blocking::Response, ClientError> {
                self.request($method, url, options)
            }
        )*
    };
}

/// Async HTTP client bound to one outbound scope.
#[derive(Debug, Clone)]
pub struct TrafficClient {
    handle: ScopeHandle,
    http: reqwest::Client,
}

impl TrafficClient {
    pub fn new(scope: impl Into<String>, controller: Arc<TrafficController>) -> Self {
        Self::with_client(scope, controller, reqwest::Client::new())
    }

    /// Use a preconfigured `reqwest` client (proxies, TLS, default headers).
    pub fn with_client(
        scope: impl Into<String>,
        controller: Arc<TrafficController>,
        http: reqwest::Client,
    ) -> Self {
        Self { handle: ScopeHandle { scope: scope.into(), controller }, http }
    }

    pub fn scope(&self) -> &str {
        &self.handle.scope
    }

    verbs! {
        /// `GET url` under the scope's traffic policy.
        get => Method::GET;
        /// `POST url` under the scope's traffic policy.
        post => Method::POST;
        /// `PUT url` under the scope's traffic policy.
        put => Method::PUT;
        /// `DELETE url` under the scope's traffic policy.
        delete => Method::DELETE;
        /// `PATCH url` under the scope's traffic policy.
        patch => Method::PATCH;
    }

    /// Send a request with any method under the scope's traffic policy.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<reqwest::Response, ClientError> {
        self.handle.permit(options.tokens)?;
        let policy = self.handle.controller.outbound_retry_policy(&self.handle.scope);
        let result = policy
            .execute(
                || {
                    let request = options.apply(self.http.request(method.clone(), url));
                    async move { request.send().await.and_then(|r| r.error_for_status()) }
                },
                is_retriable_http_error,
                |attempt| self.handle.on_retry(attempt),
            )
            .await;
        self.handle.finish(result, |response| response.status().as_u16())
    }
}

/// Blocking HTTP client bound to one outbound scope.
#[derive(Debug, Clone)]
pub struct BlockingTrafficClient {
    handle: ScopeHandle,
    http: reqwest::blocking::Client,
}

impl BlockingTrafficClient {
    pub fn new(scope: impl Into<String>, controller: Arc<TrafficController>) -> Self {
        Self::with_client(scope, controller, reqwest::blocking::Client::new())
    }

    pub fn with_client(
        scope: impl Into<String>,
        controller: Arc<TrafficController>,
        http: reqwest::blocking::Client,
    ) -> Self {
        Self { handle: ScopeHandle { scope: scope.into(), controller }, http }
    }

    pub fn scope(&self) -> &str {
        &self.handle.scope
    }

    blocking_verbs! {
        /// `GET url` under the scope's traffic policy.
        get => Method::GET;
        /// `POST url` under the scope's traffic policy.
        post => Method::POST;
        /// `PUT url` under the scope's traffic policy.
        put => Method::PUT;
        /// `DELETE url` under the scope's traffic policy.
        delete => Method::DELETE;
        /// `PATCH url` under the scope's traffic policy.
        patch => Method::PATCH;
    }

    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        self.handle.permit(options.tokens)?;
        let policy = self.handle.controller.outbound_retry_policy(&self.handle.scope);
        let result = policy.execute_blocking(
            || {
                options
                    .apply_blocking(self.http.request(method.clone(), url))
                    .send()
                    .and_then(|r| r.error_for_status())
            },
            is_retriable_http_error,
            |attempt| self.handle.on_retry(attempt),
        );
        self.handle.finish(result, |response| response.status().as_u16())
    }
}
