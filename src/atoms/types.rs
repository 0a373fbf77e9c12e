// ── Airborne Atoms: Core Types ─────────────────────────────────────────────
// The data structures that flow through the entire gateway.
// They are independent of any specific AI provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

// ── Utility ────────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation. Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Principal & permissions ────────────────────────────────────────────────

/// What an authenticated client is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Chat,
    ChatStream,
    Files,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Chat => "chat",
            Permission::ChatStream => "chat_stream",
            Permission::Files => "files",
            Permission::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Permission::Chat),
            "chat_stream" => Some(Permission::ChatStream),
            "files" => Some(Permission::Files),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

/// Per-client request and token quotas. Zero or negative means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RateLimits {
    pub rpm: i64,
    pub tpm: i64,
}

/// The authenticated identity attached to every request.
///
/// Never mutated in place — key rotations replace the whole record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub client_id: String,
    pub client_name: String,
    pub permissions: BTreeSet<Permission>,
    pub rate_limits: RateLimits,
    /// Tenant used when the request carries no `x-tenant-id`.
    #[serde(default)]
    pub default_tenant: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn has(&self, p: Permission) -> bool {
        self.permissions.contains(&p)
    }
}

/// A persisted API-key record. Plaintext is never stored; only the fast
/// lookup digest (secondary index) and the salted slow verifier hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    /// Hex HMAC-SHA256 of the plaintext — deterministic, index-only.
    pub lookup_hash: String,
    /// Argon2id PHC string — salted, slow, verification-only.
    pub verifier_hash: String,
    pub principal: Principal,
}

/// What `KeyStore::list` returns: the record without any hash bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub key_id: String,
    pub client_id: String,
    pub client_name: String,
    pub permissions: BTreeSet<Permission>,
    pub rate_limits: RateLimits,
    pub created_at: DateTime<Utc>,
}

impl From<&ApiKeyRecord> for ApiKeyInfo {
    fn from(r: &ApiKeyRecord) -> Self {
        ApiKeyInfo {
            key_id: r.key_id.clone(),
            client_id: r.principal.client_id.clone(),
            client_name: r.principal.client_name.clone(),
            permissions: r.principal.permissions.clone(),
            rate_limits: r.principal.rate_limits,
            created_at: r.principal.created_at,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────────────────

/// Which upstream wire family a provider speaks.
///
/// Providers with a unique wire format get their own variant and adapter
/// module; everything OpenAI-compatible shares one adapter and differs only
/// by a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    OpenRouter,
    DeepSeek,
    Grok,
    Mistral,
    Moonshot,
    Groq,
    Together,
    Fireworks,
    Perplexity,
    Ollama,
    Qwen,
    Custom,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Grok => "https://api.x.ai/v1",
            ProviderKind::Mistral => "https://api.mistral.ai/v1",
            ProviderKind::Moonshot => "https://api.moonshot.cn/v1",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::Together => "https://api.together.xyz/v1",
            ProviderKind::Fireworks => "https://api.fireworks.ai/inference/v1",
            ProviderKind::Perplexity => "https://api.perplexity.ai",
            ProviderKind::Ollama => "http://localhost:11434/v1",
            ProviderKind::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
            ProviderKind::Custom => "",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "google" | "gemini" => Some(ProviderKind::Google),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "deepseek" => Some(ProviderKind::DeepSeek),
            "grok" | "xai" => Some(ProviderKind::Grok),
            "mistral" => Some(ProviderKind::Mistral),
            "moonshot" => Some(ProviderKind::Moonshot),
            "groq" => Some(ProviderKind::Groq),
            "together" => Some(ProviderKind::Together),
            "fireworks" => Some(ProviderKind::Fireworks),
            "perplexity" => Some(ProviderKind::Perplexity),
            "ollama" => Some(ProviderKind::Ollama),
            "qwen" | "dashscope" => Some(ProviderKind::Qwen),
            "custom" => Some(ProviderKind::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Grok => "grok",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Moonshot => "moonshot",
            ProviderKind::Groq => "groq",
            ProviderKind::Together => "together",
            ProviderKind::Fireworks => "fireworks",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Qwen => "qwen",
            ProviderKind::Custom => "custom",
        }
    }
}

/// A tenant's baseline configuration for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Provider-specific extra options (reasoning effort, safety
    /// thresholds, thinking budgets…). Unknown keys are ignored by
    /// adapters.
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

pub(crate) fn default_true() -> bool {
    true
}

/// A tenant: isolation unit with its own provider configs and table set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, TenantProviderConfig>,
}

/// The effective per-request provider configuration: tenant baseline merged
/// with request overrides after permission and safety checks.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Registry name the tenant selected ("openai", "groq", …).
    pub provider: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("provider", &self.provider)
            .field("has_api_key", &!self.api_key.is_empty())
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ProviderConfig {
    /// Effective base URL: the override if present, else the kind default.
    pub fn base_url_or_default(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
    }

    /// Read a string option, e.g. `reasoning_effort`.
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    /// Read an integer option.
    pub fn opt_i64(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(|v| v.as_i64())
    }

    /// Read a float option.
    pub fn opt_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(|v| v.as_f64())
    }
}

// ── Requests ───────────────────────────────────────────────────────────────

/// Conversation roles as they appear in history and persisted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One prior turn supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

/// Request-level retrieval parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub store_ids: Vec<String>,
    /// Defaults to the user input when absent.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

/// A tool the model may call, in the unified JSON-schema form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The unified function-call representation every adapter normalizes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as the provider emitted them.
    pub arguments: String,
}

/// A tool result echoed back by the client for the model to consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEcho {
    pub call_id: String,
    pub name: String,
    pub content: String,
}

/// An inline image attached to the request (Gemini / Anthropic vision).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineImage {
    pub media_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Per-request override of a tenant's provider config. `base_url` requires
/// the admin permission and the URL safety check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverride {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

/// The chat-generation request, shared by the unary and streaming paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Opaque id used for idempotency and tracing.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Conversation thread to append the turn to.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// For providers with native multi-turn continuity.
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub input: String,
    /// System prompt.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    #[serde(default)]
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub provider_configs: HashMap<String, ProviderOverride>,
    #[serde(default)]
    pub retrieval: Option<RetrievalConfig>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultEcho>,
    #[serde(default)]
    pub images: Vec<InlineImage>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

// ── Results ────────────────────────────────────────────────────────────────

/// Token usage reported by the API (for metering and cost).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Fill `total_tokens` when the provider omitted it.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.input_tokens + self.output_tokens;
        }
        self
    }

    pub fn merge(&mut self, other: &TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        self.total_tokens = self.input_tokens + self.output_tokens;
    }
}

/// How a citation locator should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationKind {
    Url,
    File,
}

/// A normalized citation, classified by locator shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub kind: CitationKind,
    pub locator: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

impl Citation {
    /// Classify a locator by shape: http(s) URLs are `url`, everything else
    /// (file ids, paths) is `file`.
    pub fn classify(locator: &str) -> CitationKind {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            CitationKind::Url
        } else {
            CitationKind::File
        }
    }
}

/// A generated image blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlob {
    pub media_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Captured upstream request/response bytes, each capped at 1 MiB.
/// Sensitive: may contain prompts and user content. Persisted only when
/// debug capture is switched on in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugPayload {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// The normalized unary result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    /// Markdown rendered to HTML by the sidecar; equals `text` when the
    /// sidecar is unavailable.
    #[serde(default)]
    pub html: Option<String>,
    pub usage: TokenUsage,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub images: Vec<ImageBlob>,
    pub cost_usd: f64,
    /// Set when the model was absent from the pricing table.
    #[serde(default)]
    pub cost_unknown: bool,
    #[serde(default)]
    pub response_id: Option<String>,
    /// Conversation thread the turn was persisted to.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub provider: String,
    pub model: String,
    #[serde(skip)]
    pub debug: Option<DebugPayload>,
}

// ── Streaming ──────────────────────────────────────────────────────────────

/// Terminal payload of a successful stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamFinal {
    pub usage: TokenUsage,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(skip)]
    pub debug: Option<DebugPayload>,
}

/// The unified tagged chunk every adapter's stream normalizes to.
///
/// Ordering invariant: all `TextDelta` chunks precede `Complete`;
/// `Complete` is terminal and emitted exactly once. Errors terminate the
/// stream through the `Err` arm of the stream item instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta { text: String },
    Usage { usage: TokenUsage },
    Citation { citation: Citation },
    ToolCall { call: ToolCall },
    CodeExecution { code: String },
    Complete { r#final: StreamFinal },
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Complete { .. })
    }
}

// ── Conversation persistence ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Archived,
    Deleted,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Archived => "archived",
            ThreadStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ThreadStatus::Active),
            "archived" => Some(ThreadStatus::Archived),
            "deleted" => Some(ThreadStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
    pub status: ThreadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    // Assistant-only columns.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default)]
    pub processing_time_ms: Option<i64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub citations_json: Option<String>,
}

/// Everything `persist_turn` needs, as one structure rather than a long
/// flat parameter list.
#[derive(Debug, Clone)]
pub struct ConversationTurnParams {
    pub thread_id: String,
    pub user_id: String,
    pub request_id: Option<String>,
    pub user_content: String,
    pub assistant_content: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub processing_time_ms: i64,
    pub cost_usd: f64,
    pub cost_unknown: bool,
    pub response_id: Option<String>,
    pub citations: Vec<Citation>,
    pub debug: Option<DebugPayload>,
}

// ── RAG ────────────────────────────────────────────────────────────────────

/// One ranked snippet returned by the retrieval backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedSnippet {
    pub text: String,
    pub source_name: String,
    pub score: f64,
}

// ── Model pricing ──────────────────────────────────────────────────────────

/// Per-million-token pricing for a model: (input_per_mtok, output_per_mtok).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_utf8_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_utf8(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[test]
    fn usage_normalization_fills_total() {
        let u = TokenUsage { input_tokens: 10, output_tokens: 5, total_tokens: 0 }.normalized();
        assert_eq!(u.total_tokens, 15);
        let u = TokenUsage { input_tokens: 10, output_tokens: 5, total_tokens: 99 }.normalized();
        assert_eq!(u.total_tokens, 99);
    }

    #[test]
    fn citation_classification_by_locator_shape() {
        assert_eq!(Citation::classify("https://example.com/doc"), CitationKind::Url);
        assert_eq!(Citation::classify("http://example.com"), CitationKind::Url);
        assert_eq!(Citation::classify("file-abc123"), CitationKind::File);
        assert_eq!(Citation::classify("corpus/report.pdf"), CitationKind::File);
    }

    #[test]
    fn provider_kind_round_trips_names() {
        for name in [
            "openai", "anthropic", "google", "openrouter", "deepseek", "grok", "mistral",
            "moonshot", "groq", "together", "fireworks", "perplexity", "ollama", "qwen",
        ] {
            let kind = ProviderKind::from_name(name).unwrap();
            assert_eq!(ProviderKind::from_name(kind.as_str()), Some(kind));
        }
        assert!(ProviderKind::from_name("not-a-provider").is_none());
    }

    #[test]
    fn provider_config_debug_hides_api_key() {
        let cfg = ProviderConfig {
            kind: ProviderKind::OpenAi,
            provider: "openai".into(),
            api_key: "sk-secret".into(),
            model: "gpt-4o".into(),
            base_url: None,
            options: HashMap::new(),
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("has_api_key"));
    }
}
