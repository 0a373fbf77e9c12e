// ── Airborne Engine: Chat Orchestrator ─────────────────────────────────────
// Top-level unary and streaming request handling: validate, dispatch slash
// commands, resolve the provider, enrich from RAG, invoke the adapter,
// normalize, charge token quota, and schedule persistence.
//
// The orchestrator is re-entrant and holds no mutable process-wide state —
// everything mutable lives in the shared key-value store or the database,
// both behind their own synchronization.

use futures::StreamExt;
use log::{error, info, warn};
use parking_lot::Mutex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::atoms::constants::{
    IDEMPOTENCY_TTL_SECS, KV_IDEMPOTENCY_PREFIX, MAX_HISTORY_ENTRIES, MAX_INSTRUCTIONS_BYTES,
    MAX_METADATA_ENTRIES, MAX_USER_INPUT_BYTES, PERSIST_TIMEOUT_SECS,
};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::traits::{ChunkStream, GenerateParams, KvStore, MarkdownRenderer, Retriever};
use crate::atoms::types::{
    ConversationTurnParams, GenerateRequest, Generation, Principal, ProviderConfig, StreamChunk,
    TokenUsage,
};
use crate::auth::RateLimiter;
use crate::engine::commands::{self, SlashCommand};
use crate::engine::markdown::render_or_plain;
use crate::engine::pricing::PricingTable;
use crate::engine::providers::AnyProvider;
use crate::engine::rag;
use crate::store::TenantRepository;
use crate::tenant::{self, TenantRegistry};

/// Injectable adapter construction — tests swap in mock providers.
pub type ProviderFactory = Arc<dyn Fn(&ProviderConfig) -> AnyProvider + Send + Sync>;

pub struct ChatOrchestrator {
    tenants: Arc<TenantRegistry>,
    kv: Arc<dyn KvStore>,
    retriever: Option<Arc<dyn Retriever>>,
    renderer: Arc<dyn MarkdownRenderer>,
    factory: ProviderFactory,
    core: Arc<OrchestratorCore>,
}

/// The slice of orchestrator state that outlives a request: detached
/// persistence tasks and stream closures hold this, not the orchestrator.
struct OrchestratorCore {
    limiter: Arc<RateLimiter>,
    pricing: Arc<PricingTable>,
    db: Arc<Mutex<Connection>>,
    whitelist: Vec<String>,
    capture_debug: bool,
}

/// What `SelectProvider` reports without invoking anything.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderSelection {
    pub provider: String,
    pub model: String,
    pub supports_streaming: bool,
    pub supports_native_continuity: bool,
    pub supports_file_search: bool,
    pub supports_web_search: bool,
}

struct Prepared {
    tenant_id: String,
    provider: AnyProvider,
    params: GenerateParams,
    command: Option<SlashCommand>,
    started: Instant,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<TenantRegistry>,
        kv: Arc<dyn KvStore>,
        limiter: Arc<RateLimiter>,
        pricing: Arc<PricingTable>,
        retriever: Option<Arc<dyn Retriever>>,
        renderer: Arc<dyn MarkdownRenderer>,
        db: Arc<Mutex<Connection>>,
        capture_debug: bool,
    ) -> Self {
        let core = Arc::new(OrchestratorCore {
            limiter,
            pricing,
            db,
            whitelist: tenants.whitelist(),
            capture_debug,
        });
        ChatOrchestrator {
            tenants,
            kv,
            retriever,
            renderer,
            factory: Arc::new(|config| AnyProvider::from_config(config)),
            core,
        }
    }

    /// Swap the adapter factory. Test seam.
    pub fn with_factory(mut self, factory: ProviderFactory) -> Self {
        self.factory = factory;
        self
    }

    /// The tenant a request operates on: explicit header first, else the
    /// principal's default.
    pub fn tenant_for(
        &self,
        principal: &Principal,
        header_tenant: Option<&str>,
    ) -> GatewayResult<String> {
        let tenant_id = header_tenant
            .map(str::to_string)
            .or_else(|| principal.default_tenant.clone())
            .ok_or_else(|| {
                GatewayError::invalid("no tenant selected and principal has no default".to_string())
            })?;
        if self.tenants.get(&tenant_id).is_none() {
            return Err(GatewayError::invalid(format!("unknown tenant {tenant_id:?}")));
        }
        Ok(tenant_id)
    }

    fn validate(request: &GenerateRequest) -> GatewayResult<()> {
        if request.input.is_empty() {
            return Err(GatewayError::invalid("input must not be empty".to_string()));
        }
        if request.input.len() > MAX_USER_INPUT_BYTES {
            return Err(GatewayError::invalid(format!(
                "input exceeds {MAX_USER_INPUT_BYTES} bytes"
            )));
        }
        if let Some(instructions) = &request.instructions {
            if instructions.len() > MAX_INSTRUCTIONS_BYTES {
                return Err(GatewayError::invalid(format!(
                    "instructions exceed {MAX_INSTRUCTIONS_BYTES} bytes"
                )));
            }
        }
        if request.history.len() > MAX_HISTORY_ENTRIES {
            return Err(GatewayError::invalid(format!(
                "history exceeds {MAX_HISTORY_ENTRIES} entries"
            )));
        }
        if request.metadata.len() > MAX_METADATA_ENTRIES {
            return Err(GatewayError::invalid(format!(
                "metadata exceeds {MAX_METADATA_ENTRIES} entries"
            )));
        }
        Ok(())
    }

    /// Shared front half of the unary and streaming paths.
    async fn prepare(
        &self,
        tenant_id: &str,
        request: &GenerateRequest,
        principal: &Principal,
        deadline: Option<Instant>,
    ) -> GatewayResult<Prepared> {
        let started = Instant::now();
        Self::validate(request)?;

        let command = commands::parse(&request.input);
        let config = tenant::resolve(&self.tenants, tenant_id, request, principal).await?;

        // RAG enrichment goes into the system prompt only; the user input
        // surface stays byte-identical.
        let mut system = request.instructions.clone();
        if let (Some(retriever), Some(retrieval)) = (&self.retriever, &request.retrieval) {
            if let Some(block) = rag::enrich(
                retriever,
                tenant_id,
                request.thread_id.as_deref(),
                retrieval,
                &request.input,
            )
            .await
            {
                system = Some(rag::merge_into_instructions(system.as_deref(), &block));
            }
        }

        let provider = (self.factory)(&config);
        let params = GenerateParams {
            config,
            system,
            input: request.input.clone(),
            history: request.history.clone(),
            tools: request.tools.clone(),
            tool_results: request.tool_results.clone(),
            images: request.images.clone(),
            request_id: request.request_id.clone(),
            previous_response_id: request.previous_response_id.clone(),
            deadline,
        };

        Ok(Prepared { tenant_id: tenant_id.to_string(), provider, params, command, started })
    }

    /// `SelectProvider`: report the selection without invoking it.
    pub async fn select_provider(
        &self,
        tenant_id: &str,
        request: &GenerateRequest,
        principal: &Principal,
    ) -> GatewayResult<ProviderSelection> {
        let config = tenant::resolve(&self.tenants, tenant_id, request, principal).await?;
        let provider = (self.factory)(&config);
        Ok(ProviderSelection {
            provider: config.provider,
            model: config.model,
            supports_streaming: provider.supports_streaming(),
            supports_native_continuity: provider.supports_native_continuity(),
            supports_file_search: provider.supports_file_search(),
            supports_web_search: provider.supports_web_search(),
        })
    }

    // ── Unary path ─────────────────────────────────────────────────────────

    pub async fn generate(
        &self,
        tenant_id: &str,
        request: &GenerateRequest,
        principal: &Principal,
        deadline: Option<Instant>,
    ) -> GatewayResult<Generation> {
        // Idempotent replay: identical (tenant, thread, request_id) within
        // the TTL returns the stored response without touching the
        // provider.
        let idem_key = idempotency_key(tenant_id, request);
        if let Some(key) = &idem_key {
            if let Some(stored) = self.kv.get(key).await? {
                match serde_json::from_str::<Generation>(&stored) {
                    Ok(generation) => {
                        info!("[engine] Idempotent replay for request {:?}", request.request_id);
                        return Ok(generation);
                    }
                    Err(e) => warn!("[engine] Stored idempotency payload unreadable: {e}"),
                }
            }
        }

        let prepared = self.prepare(tenant_id, request, principal, deadline).await?;
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut generation = match &prepared.command {
            Some(SlashCommand::Image { prompt }) => {
                if prompt.is_empty() {
                    return Err(GatewayError::invalid("@image requires a prompt".to_string()));
                }
                let images = prepared.provider.generate_image(prompt, &prepared.params).await?;
                info!("[engine] @image produced {} blob(s)", images.len());
                Generation {
                    images,
                    provider: prepared.params.config.provider.clone(),
                    model: prepared.params.config.model.clone(),
                    ..Default::default()
                }
            }
            None => prepared.provider.generate(&prepared.params).await?,
        };

        generation.usage = generation.usage.normalized();
        let cost = self.core.pricing.cost(
            &generation.model,
            generation.usage.input_tokens,
            generation.usage.output_tokens,
        );
        generation.cost_usd = cost.usd;
        generation.cost_unknown = cost.unknown;
        generation.thread_id = Some(thread_id.clone());

        self.core.charge_tokens(principal, generation.usage).await;

        if !generation.text.is_empty() {
            generation.html = Some(render_or_plain(self.renderer.as_ref(), &generation.text).await);
        }

        if let Some(key) = &idem_key {
            // Stored before returning so a racing duplicate replays this
            // exact response. Debug bytes are skipped by serde.
            match serde_json::to_string(&generation) {
                Ok(payload) => {
                    if let Err(e) = self.kv.set_ex(key, &payload, IDEMPOTENCY_TTL_SECS).await {
                        warn!("[engine] Failed to store idempotency payload: {e}");
                    }
                }
                Err(e) => warn!("[engine] Failed to serialize idempotency payload: {e}"),
            }
        }

        self.core.persist_detached(
            prepared.tenant_id.clone(),
            thread_id,
            request.clone(),
            generation.clone(),
            prepared.started.elapsed(),
        );

        Ok(generation)
    }

    // ── Streaming path ─────────────────────────────────────────────────────

    pub async fn generate_stream(
        &self,
        tenant_id: &str,
        request: &GenerateRequest,
        principal: &Principal,
        deadline: Option<Instant>,
    ) -> GatewayResult<ChunkStream> {
        let prepared = self.prepare(tenant_id, request, principal, deadline).await?;
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Slash commands behave identically on both paths; the streaming
        // rendition short-circuits into a two-chunk stream.
        if let Some(SlashCommand::Image { prompt }) = &prepared.command {
            if prompt.is_empty() {
                return Err(GatewayError::invalid("@image requires a prompt".to_string()));
            }
            let images = prepared.provider.generate_image(prompt, &prepared.params).await?;
            let text = format!("Generated {} image(s).", images.len());
            let stream: ChunkStream = Box::pin(async_stream::try_stream! {
                yield StreamChunk::TextDelta { text };
                yield StreamChunk::Complete { r#final: Default::default() };
            });
            return Ok(stream);
        }

        let upstream = prepared.provider.generate_stream(&prepared.params).await?;

        let core = self.core.clone();
        let principal = principal.clone();
        let request = request.clone();
        let started = prepared.started;
        let tenant = prepared.tenant_id.clone();
        let provider_name = prepared.params.config.provider.clone();
        let configured_model = prepared.params.config.model.clone();

        let stream = async_stream::try_stream! {
            let mut upstream = upstream;
            let mut text = String::new();
            let mut terminal_seen = false;

            while let Some(item) = upstream.next().await {
                let chunk = item?;
                match chunk {
                    StreamChunk::TextDelta { text: ref delta } => {
                        text.push_str(delta);
                        yield chunk;
                    }
                    StreamChunk::Complete { mut r#final } => {
                        terminal_seen = true;
                        r#final.usage = r#final.usage.normalized();

                        // TPM is charged only here — a stream cancelled
                        // before `complete` is never charged.
                        core.charge_tokens(&principal, r#final.usage).await;

                        let model = r#final
                            .model
                            .clone()
                            .unwrap_or_else(|| configured_model.clone());
                        let cost = core.pricing.cost(
                            &model,
                            r#final.usage.input_tokens,
                            r#final.usage.output_tokens,
                        );
                        let generation = Generation {
                            text: std::mem::take(&mut text),
                            usage: r#final.usage,
                            cost_usd: cost.usd,
                            cost_unknown: cost.unknown,
                            response_id: r#final.response_id.clone(),
                            thread_id: Some(thread_id.clone()),
                            provider: provider_name.clone(),
                            model,
                            debug: r#final.debug.take(),
                            ..Default::default()
                        };
                        core.persist_detached(
                            tenant.clone(),
                            thread_id.clone(),
                            request.clone(),
                            generation,
                            started.elapsed(),
                        );
                        yield StreamChunk::Complete { r#final };
                        break;
                    }
                    other => yield other,
                }
            }

            // Adapters always emit a terminal; this is the backstop for
            // one that does not.
            if !terminal_seen {
                yield StreamChunk::Complete { r#final: Default::default() };
            }
        };
        Ok(Box::pin(stream))
    }
}

impl OrchestratorCore {
    async fn charge_tokens(&self, principal: &Principal, usage: TokenUsage) {
        if usage.total_tokens == 0 {
            return;
        }
        match self
            .limiter
            .record_tokens(&principal.client_id, usage.total_tokens, principal.rate_limits.tpm)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                "[engine] Client {} exceeded its token budget this window",
                principal.client_id
            ),
            Err(e) => warn!("[engine] TPM accounting failed: {e}"),
        }
    }

    /// Persistence runs on a freshly spawned task with its own 10-second
    /// deadline, detached from the request context: a client disconnect
    /// after the upstream call completes must not lose the record. If the
    /// request never reached the provider, this is never called.
    fn persist_detached(
        &self,
        tenant_id: String,
        thread_id: String,
        request: GenerateRequest,
        generation: Generation,
        elapsed: Duration,
    ) {
        let db = self.db.clone();
        let whitelist = self.whitelist.clone();
        let capture_debug = self.capture_debug;

        tokio::spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                let repo = TenantRepository::new(db, &tenant_id, &whitelist, capture_debug)?;
                repo.get_or_create_thread(&thread_id, request.user_id.as_deref().unwrap_or(""))?;
                repo.persist_turn(&ConversationTurnParams {
                    thread_id,
                    user_id: request.user_id.clone().unwrap_or_default(),
                    request_id: request.request_id.clone(),
                    user_content: request.input.clone(),
                    assistant_content: generation.text.clone(),
                    provider: generation.provider.clone(),
                    model: generation.model.clone(),
                    usage: generation.usage,
                    processing_time_ms: elapsed.as_millis() as i64,
                    cost_usd: generation.cost_usd,
                    cost_unknown: generation.cost_unknown,
                    response_id: generation.response_id.clone(),
                    citations: generation.citations.clone(),
                    debug: generation.debug.clone(),
                })?;
                Ok::<(), GatewayError>(())
            });

            match tokio::time::timeout(Duration::from_secs(PERSIST_TIMEOUT_SECS), work).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("[engine] Turn persistence failed: {e}"),
                Ok(Err(e)) => error!("[engine] Persistence task panicked: {e}"),
                Err(_) => error!(
                    "[engine] Turn persistence exceeded {PERSIST_TIMEOUT_SECS}s and was abandoned"
                ),
            }
        });
    }
}

/// `chat:idem:<hex-sha256(tenant ‖ 0x00 ‖ thread ‖ 0x00 ‖ request_id)>`.
/// Hashed so request-supplied fields cannot inject into the key space.
fn idempotency_key(tenant_id: &str, request: &GenerateRequest) -> Option<String> {
    let request_id = request.request_id.as_deref()?;
    let thread_id = request.thread_id.as_deref().unwrap_or("");
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(thread_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request_id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Some(format!("{KV_IDEMPOTENCY_PREFIX}{hex}"))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_hashed_and_injection_proof() {
        let mut request = GenerateRequest {
            request_id: Some("r1".to_string()),
            thread_id: Some("t1".to_string()),
            input: "x".to_string(),
            ..Default::default()
        };
        let key = idempotency_key("acme", &request).unwrap();
        assert!(key.starts_with("chat:idem:"));
        let hex = key.strip_prefix("chat:idem:").unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));

        // A crafted request id cannot collide with a different triple.
        let crafted = GenerateRequest {
            request_id: Some("1\u{0}r1".to_string()),
            thread_id: Some("t".to_string()),
            input: "x".to_string(),
            ..Default::default()
        };
        assert_ne!(idempotency_key("acme", &crafted), idempotency_key("acme", &request));

        request.request_id = None;
        assert!(idempotency_key("acme", &request).is_none());
    }

    #[test]
    fn size_validation_bounds() {
        let ok = GenerateRequest { input: "hi".to_string(), ..Default::default() };
        assert!(ChatOrchestrator::validate(&ok).is_ok());

        let empty = GenerateRequest::default();
        assert!(ChatOrchestrator::validate(&empty).is_err());

        let big_input = GenerateRequest {
            input: "x".repeat(MAX_USER_INPUT_BYTES + 1),
            ..Default::default()
        };
        assert_eq!(
            ChatOrchestrator::validate(&big_input).unwrap_err().kind(),
            "invalid_argument"
        );

        let big_instructions = GenerateRequest {
            input: "hi".to_string(),
            instructions: Some("y".repeat(MAX_INSTRUCTIONS_BYTES + 1)),
            ..Default::default()
        };
        assert!(ChatOrchestrator::validate(&big_instructions).is_err());

        let deep_history = GenerateRequest {
            input: "hi".to_string(),
            history: (0..=MAX_HISTORY_ENTRIES)
                .map(|_| crate::atoms::types::HistoryTurn {
                    role: crate::atoms::types::Role::User,
                    content: "h".to_string(),
                })
                .collect(),
            ..Default::default()
        };
        assert!(ChatOrchestrator::validate(&deep_history).is_err());
    }
}
