// ── Airborne ───────────────────────────────────────────────────────────────
// Multi-tenant LLM gateway: one RPC surface over many upstream providers,
// with API-key auth, Redis-scripted quotas, per-tenant provider resolution,
// optional RAG prompt enrichment, normalized unary/streaming generation,
// and durable per-tenant conversation history with cost accounting.
//
// Layer map (dependencies point downward only):
//
//   server     → HTTP surface (axum), error egress sanitization
//   engine     → orchestrator, provider adapters, pricing, RAG, markdown
//   auth       → key store, rate limiter, request interceptor
//   tenant     → tenant registry/resolver, base-URL safety check
//   store      → key-value seam (Redis/memory), tenant-scoped repository
//   atoms      → constants, error enum, core types, trait seams (pure)

pub mod atoms;
pub mod auth;
pub mod config;
pub mod engine;
pub mod server;
pub mod store;
pub mod tenant;

pub use atoms::error::{GatewayError, GatewayResult};
pub use atoms::traits::{AiProvider, ChunkStream, GenerateParams, KvStore, MarkdownRenderer, Retriever};
pub use atoms::types::*;
pub use engine::ChatOrchestrator;
