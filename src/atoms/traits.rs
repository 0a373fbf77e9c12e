// ── Airborne Atoms: Trait Seams ────────────────────────────────────────────
// The contracts between the orchestrator and its collaborators: upstream
// providers, the shared key-value store, the retrieval backend, and the
// markdown sidecar. Concrete implementations live in engine/ and store/.

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Instant;

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    Generation, HistoryTurn, ImageBlob, InlineImage, ProviderConfig, ProviderKind,
    RetrievedSnippet, StreamChunk, ToolDefinition, ToolResultEcho,
};

/// Boxed lazy chunk stream. Adapters emit chunks as they arrive upstream;
/// the `Err` arm terminates the stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamChunk>> + Send>>;

// ── Provider params ────────────────────────────────────────────────────────

/// Everything an adapter needs for one upstream call.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub config: ProviderConfig,
    /// System prompt, already RAG-enriched by the orchestrator.
    pub system: Option<String>,
    pub input: String,
    pub history: Vec<HistoryTurn>,
    pub tools: Vec<ToolDefinition>,
    pub tool_results: Vec<ToolResultEcho>,
    pub images: Vec<InlineImage>,
    pub request_id: Option<String>,
    /// Native-continuity handle; adapters that support it pass this upstream
    /// and omit history.
    pub previous_response_id: Option<String>,
    /// Caller deadline. Per-attempt timeouts never exceed the remainder.
    pub deadline: Option<Instant>,
}

impl GenerateParams {
    pub fn new(config: ProviderConfig, input: impl Into<String>) -> Self {
        GenerateParams {
            config,
            system: None,
            input: input.into(),
            history: Vec::new(),
            tools: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
            request_id: None,
            previous_response_id: None,
            deadline: None,
        }
    }

    /// Remaining time before the caller deadline, if one was set.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

// ── Provider contract ──────────────────────────────────────────────────────

/// Uniform contract every upstream adapter implements.
///
/// Each adapter owns request translation, streaming normalization, and
/// retry classification for its wire family.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Registry name ("openai", "anthropic", "groq", …).
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn supports_file_search(&self) -> bool {
        false
    }

    fn supports_web_search(&self) -> bool {
        false
    }

    /// Whether `previous_response_id` replaces full history upstream.
    fn supports_native_continuity(&self) -> bool {
        false
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Unary generation, normalized.
    async fn generate(&self, params: &GenerateParams) -> GatewayResult<Generation>;

    /// Streaming generation. The returned stream yields exactly one
    /// terminal item: `Ok(StreamChunk::Complete { .. })` or `Err(_)`.
    async fn generate_stream(&self, params: &GenerateParams) -> GatewayResult<ChunkStream>;

    /// Image generation for the `@image` slash command. Most adapters do
    /// not support it.
    async fn generate_image(
        &self,
        _prompt: &str,
        _params: &GenerateParams,
    ) -> GatewayResult<Vec<ImageBlob>> {
        Err(GatewayError::FailedPrecondition(format!(
            "provider {} does not support image generation",
            self.name()
        )))
    }
}

// ── Shared key-value store ─────────────────────────────────────────────────

/// The only mutable shared resource in the hot path: rate-limit counters,
/// idempotency keys, and API-key records. All mutations are atomic at the
/// backend.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increment `key` by `delta`; when the increment creates
    /// the key, set `ttl_secs` in the same operation. Returns the
    /// post-increment value.
    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> GatewayResult<i64>;

    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> GatewayResult<()>;

    async fn del(&self, key: &str) -> GatewayResult<()>;

    /// All fields of a hash record, or None when the key is absent.
    async fn hget_all(&self, key: &str) -> GatewayResult<Option<HashMap<String, String>>>;

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> GatewayResult<()>;

    /// Keys matching a glob pattern. Record sets are small (API keys), so a
    /// full scan is acceptable.
    async fn scan(&self, pattern: &str) -> GatewayResult<Vec<String>>;

    /// Remaining TTL in seconds; None when the key has no expiry or does
    /// not exist.
    async fn ttl(&self, key: &str) -> GatewayResult<Option<i64>>;
}

// ── Retrieval backend ──────────────────────────────────────────────────────

/// The capability the core consumes from the RAG subsystem. The vector
/// store, embedder, and extractor behind it are external collaborators.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        tenant_id: &str,
        thread_id: Option<&str>,
        store_ids: &[String],
        query: &str,
        top_k: usize,
    ) -> GatewayResult<Vec<RetrievedSnippet>>;
}

// ── Markdown sidecar ───────────────────────────────────────────────────────

/// Stateless render service. Failure degrades to returning the markdown
/// unchanged — callers treat errors as non-fatal.
#[async_trait]
pub trait MarkdownRenderer: Send + Sync {
    async fn render(&self, markdown: &str) -> GatewayResult<String>;
}
