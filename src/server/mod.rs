// ── Airborne Server ────────────────────────────────────────────────────────
// The RPC surface: three core methods plus health, served over axum with
// the auth interceptor layered on every route.
//
//   POST /v1/reply            — unary generation
//   POST /v1/reply/stream     — server-streaming generation (SSE)
//   POST /v1/provider/select  — report the provider selection, no invocation
//   GET  /health              — unauthenticated liveness
//
// Error egress is sanitized here: clients see the taxonomy kind and the
// client-safe message, logs carry full detail.

pub mod handlers;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use log::error;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::atoms::error::GatewayError;
use crate::auth::{auth_middleware, AuthState};
use crate::engine::ChatOrchestrator;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("[server] {self}");
        }
        let body = Json(serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.client_message(),
            }
        }));
        (status, body).into_response()
    }
}

/// Build the full router with authentication layered on.
pub fn build_router(state: AppState, auth: Arc<AuthState>) -> Router {
    Router::new()
        .route("/v1/reply", post(handlers::reply))
        .route("/v1/reply/stream", post(handlers::reply_stream))
        .route("/v1/provider/select", post(handlers::select_provider))
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
