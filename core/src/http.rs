//! HTTP intake edge (SPEC_FULL §10.5): the only place in the crate that
//! knows about HTTP. `POST /commands` is the Accept API spec §6 describes;
//! the core command bus itself stays transport-agnostic.
//!
//! Grounded on `modules/payments::main`'s `Router::new().route("/api/health",
//! get(health))` shape, extended with the commands route and an
//! `IntoResponse` mapping for `CommandBusError` so handlers stay thin.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::command::ReplyRouting;
use crate::command_bus::CommandBus;
use crate::config::Config;
use crate::error::CommandBusError;
use crate::metrics::{RelayMetrics, WorkerMetrics};
use crate::reply_dispatcher::ReplyDispatcher;

#[derive(Clone)]
pub struct ApiState {
    pub command_bus: CommandBus,
    pub reply_dispatcher: ReplyDispatcher,
    pub sync_wait: Duration,
    pub relay_metrics: Arc<RelayMetrics>,
    pub worker_metrics: Arc<WorkerMetrics>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/commands", post(accept_command))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Prometheus text exposition format (spec §1's "thin edge" HTTP intake
/// extended per SPEC_FULL §10.6), matching the teacher's own `/metrics`
/// route (`routes::metrics::metrics`) rather than a one-off JSON shape.
async fn metrics(State(state): State<ApiState>) -> Response {
    let mut body = match state.relay_metrics.render() {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics error: {e}")).into_response()
        }
    };
    match state.worker_metrics.render() {
        Ok(b) => body.push_str(&b),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics error: {e}")).into_response()
        }
    }
    (StatusCode::OK, body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AcceptCommandRequest {
    pub name: String,
    pub idempotency_key: String,
    pub business_key: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// spec §6 Accept API: 202 on new acceptance, 409 on a replayed idempotency
/// key, 400 on a malformed request. When `sync_wait > 0` the handler
/// subscribes to the command's reply before returning and blocks up to that
/// duration (spec §9's subscribe-not-poll resolution), falling back to 202
/// (still pending) on timeout.
async fn accept_command(
    State(state): State<ApiState>,
    Json(request): Json<AcceptCommandRequest>,
) -> Response {
    if request.name.trim().is_empty() || request.idempotency_key.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "name and idempotency_key are required" })),
        )
            .into_response();
    }

    let reply_routing = ReplyRouting {
        reply_to: request.reply_to,
        correlation_id: request.correlation_id,
        headers: Default::default(),
    };

    let command_id = match state
        .command_bus
        .accept(
            &request.name,
            &request.idempotency_key,
            &request.business_key,
            &request.payload,
            reply_routing,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    if state.sync_wait.is_zero() {
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "command_id": command_id, "status": "PENDING" })),
        )
            .into_response();
    }

    let receiver = state.reply_dispatcher.subscribe(command_id);
    match tokio::time::timeout(state.sync_wait, receiver).await {
        Ok(Ok(outcome)) => {
            let status = if outcome.succeeded {
                StatusCode::OK
            } else {
                StatusCode::UNPROCESSABLE_ENTITY
            };
            (
                status,
                Json(serde_json::json!({
                    "command_id": command_id,
                    "status": if outcome.succeeded { "SUCCEEDED" } else { "FAILED" },
                    "reply": outcome.payload,
                })),
            )
                .into_response()
        }
        Ok(Err(_)) | Err(_) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "command_id": command_id, "status": "PENDING" })),
        )
            .into_response(),
    }
}

impl IntoResponse for CommandBusError {
    fn into_response(self) -> Response {
        let status = match &self {
            CommandBusError::DuplicateIdempotencyKey => StatusCode::CONFLICT,
            CommandBusError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CommandBusError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resolves the reply queue topic this process should subscribe a
/// [`crate::reply_dispatcher::ReplyDispatcher`] to, from configuration.
pub fn reply_queue_topic(config: &Config) -> String {
    crate::queue_naming::reply_queue(&config.queue_naming)
}
