// ── Airborne Server: Handlers ──────────────────────────────────────────────
// Thin translation between HTTP and the orchestrator. Request metadata:
// the principal arrives via the auth interceptor's request extension,
// `x-tenant-id` optionally selects a tenant, `x-request-timeout-ms`
// optionally sets the caller deadline.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::{Duration, Instant};

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{GenerateRequest, Generation, Principal, StreamChunk};
use crate::engine::orchestrator::ProviderSelection;
use crate::server::AppState;

fn header_tenant(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-tenant-id").and_then(|v| v.to_str().ok()).filter(|s| !s.is_empty())
}

fn header_deadline(headers: &HeaderMap) -> Option<Instant> {
    headers
        .get("x-request-timeout-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|ms| Instant::now() + Duration::from_millis(ms))
}

/// `GenerateReply` — unary.
pub async fn reply(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> GatewayResult<Json<Generation>> {
    let tenant_id = state
        .orchestrator
        .tenant_for(&principal, header_tenant(&headers))?;
    let generation = state
        .orchestrator
        .generate(&tenant_id, &request, &principal, header_deadline(&headers))
        .await?;
    Ok(Json(generation))
}

/// `GenerateReplyStream` — server-streaming over SSE. Exactly one terminal
/// event per stream: `complete` or `error`.
pub async fn reply_stream(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> GatewayResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let tenant_id = state
        .orchestrator
        .tenant_for(&principal, header_tenant(&headers))?;
    let chunks = state
        .orchestrator
        .generate_stream(&tenant_id, &request, &principal, header_deadline(&headers))
        .await?;

    let events = async_stream::stream! {
        let mut chunks = chunks;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let name = event_name(&chunk);
                    let terminal = chunk.is_terminal();
                    match Event::default().event(name).json_data(&chunk) {
                        Ok(event) => yield Ok(event),
                        Err(e) => {
                            log::error!("[server] Chunk serialization failed: {e}");
                            yield Ok(error_event(&GatewayError::internal(e.to_string())));
                            return;
                        }
                    }
                    if terminal {
                        return;
                    }
                }
                Err(e) => {
                    log::error!("[server] Stream failed: {e}");
                    yield Ok(error_event(&e));
                    return;
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn event_name(chunk: &StreamChunk) -> &'static str {
    match chunk {
        StreamChunk::TextDelta { .. } => "text_delta",
        StreamChunk::Usage { .. } => "usage",
        StreamChunk::Citation { .. } => "citation",
        StreamChunk::ToolCall { .. } => "tool_call",
        StreamChunk::CodeExecution { .. } => "code_execution",
        StreamChunk::Complete { .. } => "complete",
    }
}

fn error_event(e: &GatewayError) -> Event {
    Event::default().event("error").data(
        serde_json::json!({
            "kind": e.kind(),
            "message": e.client_message(),
        })
        .to_string(),
    )
}

/// `SelectProvider` — what would run, without running it.
pub async fn select_provider(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> GatewayResult<Json<ProviderSelection>> {
    let tenant_id = state
        .orchestrator
        .tenant_for(&principal, header_tenant(&headers))?;
    let selection = state
        .orchestrator
        .select_provider(&tenant_id, &request, &principal)
        .await?;
    Ok(Json(selection))
}

/// Unauthenticated liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
