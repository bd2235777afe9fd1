//! Read-only status and metrics endpoints.
//!
//! - `GET /status`: global figures plus every scope, keyed `direction:name`.
//! - `GET /metrics/:scope`: one scope (`outbound:<name>`, `inbound:<name>`, or a bare name).
//!   Unknown scopes are a 404; nothing is created by looking.

use crate::controller::TrafficController;
use crate::error::TrafficError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const STATUS_PATH: &str = "/status";
pub const SCOPE_METRICS_PATH: &str = "/metrics/:scope";

/// Router exposing the controller's figures. Mount it next to (not behind) the inbound layer.
pub fn router(controller: Arc<TrafficController>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .route(SCOPE_METRICS_PATH, get(scope_metrics))
        .with_state(controller)
}

/// Failures surfaced by the status endpoints.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Traffic(#[from] TrafficError),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            StatusError::Traffic(TrafficError::UnknownScope(_)) => {
                (StatusCode::NOT_FOUND, "unknown_scope")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            tracing::error!(
                target: "traffic_control::status",
                error = %self,
                "status endpoint failed"
            );
        }
        let body = json!({ "status": "error", "error": code, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StatusError> {
    Ok(serde_json::to_value(value)?)
}

async fn status(
    State(controller): State<Arc<TrafficController>>,
) -> Result<Json<Value>, StatusError> {
    let report = controller.status_report();
    Ok(Json(json!({
        "status": "success",
        "global": encode(&report.global)?,
        "scopes": encode(&report.scopes)?,
    })))
}

async fn scope_metrics(
    State(controller): State<Arc<TrafficController>>,
    Path(scope): Path<String>,
) -> Result<Json<Value>, StatusError> {
    let metrics = controller.metrics(Some(&scope))?;
    Ok(Json(json!({
        "status": "success",
        "scope": scope,
        "metrics": encode(&metrics)?,
    })))
}
