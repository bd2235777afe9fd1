//! Inbound rate limiting as a `tower` layer.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{routing::get, Router};
//! use traffic_control::{InboundLayer, TrafficController};
//!
//! let controller = Arc::new(TrafficController::from_env().unwrap());
//! let app: Router = Router::new()
//!     .route("/api/items", get(|| async { "items" }))
//!     .layer(InboundLayer::new(controller));
//! ```
//!
//! Allow-listed paths bypass every check. Other paths are mapped to an endpoint group by
//! longest-prefix match and must win a token from that group's bucket; refused requests get a
//! structured 429 and never reach the inner service.

use crate::config::TrafficControlConfig;
use crate::controller::TrafficController;
use crate::error::Rejection;
use crate::telemetry::TrafficEvent;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use http::{header, Request, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Group for paths that match no configured prefix.
pub const DEFAULT_GROUP: &str = "default";

/// Maps request paths to endpoint groups.
#[derive(Debug, Clone)]
pub struct EndpointRouter {
    /// Longest prefix first.
    routes: Vec<(String, String)>,
    allow_list: Vec<String>,
}

impl EndpointRouter {
    pub fn new<R, A>(routes: R, allow_list: A) -> Self
    where
        R: IntoIterator<Item = (String, String)>,
        A: IntoIterator<Item = String>,
    {
        let mut routes: Vec<_> = routes.into_iter().collect();
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { routes, allow_list: allow_list.into_iter().collect() }
    }

    pub fn from_config(config: &TrafficControlConfig) -> Self {
        Self::new(config.routes.clone(), config.allow_list.clone())
    }

    /// Exact match or any sub-path of an allow-list entry.
    pub fn is_allow_listed(&self, path: &str) -> bool {
        self.allow_list.iter().any(|entry| path_matches(path, entry))
    }

    /// Group for `path`: the longest matching prefix wins.
    pub fn group_for(&self, path: &str) -> &str {
        self.routes
            .iter()
            .find(|(prefix, _)| path_matches(path, prefix))
            .map_or(DEFAULT_GROUP, |(_, group)| group.as_str())
    }
}

/// `/api` matches `/api` and `/api/x`, never `/apix`.
fn path_matches(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

#[derive(Debug, Serialize)]
struct RateLimitBody {
    error: &'static str,
    message: String,
    retry_after_seconds: u64,
}

/// The 429 sent to inbound callers. Only the group name and wait are exposed.
pub fn too_many_requests(group: &str, rejection: &Rejection) -> Response {
    let seconds = rejection.retry_after_secs();
    let body = RateLimitBody {
        error: rejection.reason(),
        message: format!("Rate limit exceeded for {group}. Please retry after {seconds} seconds."),
        retry_after_seconds: seconds,
    };
    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, seconds.to_string())], Json(body))
        .into_response()
}

/// Layer applying inbound traffic control.
#[derive(Debug, Clone)]
pub struct InboundLayer {
    controller: Arc<TrafficController>,
    router: Arc<EndpointRouter>,
}

impl InboundLayer {
    /// Routes and allow-list come from the controller's config.
    pub fn new(controller: Arc<TrafficController>) -> Self {
        let router = EndpointRouter::from_config(controller.config());
        Self::with_router(controller, router)
    }

    pub fn with_router(controller: Arc<TrafficController>, router: EndpointRouter) -> Self {
        Self { controller, router: Arc::new(router) }
    }
}

impl<S> Layer<S> for InboundLayer {
    type Service = InboundService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InboundService { inner, controller: self.controller.clone(), router: self.router.clone() }
    }
}

/// Middleware service produced by [`InboundLayer`].
#[derive(Debug, Clone)]
pub struct InboundService<S> {
    inner: S,
    controller: Arc<TrafficController>,
    router: Arc<EndpointRouter>,
}

impl<S, B> Service<Request<B>> for InboundService<S>
where
    S: Service<Request<B>, Response = Response>,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let path = req.uri().path().to_string();
        if self.router.is_allow_listed(&path) {
            return Box::pin(self.inner.call(req));
        }

        let group = self.router.group_for(&path).to_string();
        if let Err(rejection) = self.controller.check_inbound(&group, 1) {
            tracing::info!(
                target: "traffic_control::middleware",
                path = %path,
                group = %group,
                reason = rejection.reason(),
                "inbound request refused"
            );
            let response = too_many_requests(&group, &rejection);
            return Box::pin(async move { Ok(response) });
        }

        let controller = self.controller.clone();
        let started = tokio::time::Instant::now();
        let future = self.inner.call(req);
        Box::pin(async move {
            let response = future.await?;
            let elapsed = started.elapsed();
            controller.record_inbound_response(&group, response.status().as_u16());
            if elapsed > controller.config().slow_request_threshold() {
                tracing::warn!(
                    target: "traffic_control::middleware",
                    path = %path,
                    group = %group,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "slow inbound request"
                );
                controller.emit(&TrafficEvent::SlowRequest { path, group, elapsed });
            }
            Ok(response)
        })
    }
}
