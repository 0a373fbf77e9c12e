// ── Airborne Providers: OpenAI-Compatible Shared Adapter ───────────────────
// One implementation serves every provider that speaks OpenAI's
// chat-completions surface. Adding a compat provider is a `CompatSpec`
// table entry in `COMPAT_PROVIDERS`, not a new module.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use log::info;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};
use zeroize::Zeroizing;

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::traits::{AiProvider, ChunkStream, GenerateParams};
use crate::atoms::types::{
    Citation, Generation, ProviderKind, Role, StreamChunk, StreamFinal, TokenUsage, ToolCall,
};
use crate::engine::http::{shared_client, CircuitBreaker};
use crate::engine::providers::common::{
    post_json_with_retries, send_with_retries, sse_data, strip_citation_markers, trim_history,
    LineBuffer,
};

/// Circuit breaker shared across all compat-provider requests.
static COMPAT_CIRCUIT: LazyLock<Arc<CircuitBreaker>> =
    LazyLock::new(|| Arc::new(CircuitBreaker::new(5, 60)));

// ── The registry table ─────────────────────────────────────────────────────

/// Everything that distinguishes one chat-completions provider from
/// another.
#[derive(Debug, Clone, Copy)]
pub struct CompatSpec {
    pub name: &'static str,
    pub kind: ProviderKind,
    pub default_base_url: &'static str,
    pub default_model: &'static str,
    pub api_key_env_var: &'static str,
    pub supports_web_search: bool,
    pub supports_streaming: bool,
}

pub const COMPAT_PROVIDERS: &[CompatSpec] = &[
    CompatSpec {
        name: "openrouter",
        kind: ProviderKind::OpenRouter,
        default_base_url: "https://openrouter.ai/api/v1",
        default_model: "openrouter/auto",
        api_key_env_var: "OPENROUTER_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "deepseek",
        kind: ProviderKind::DeepSeek,
        default_base_url: "https://api.deepseek.com/v1",
        default_model: "deepseek-chat",
        api_key_env_var: "DEEPSEEK_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "grok",
        kind: ProviderKind::Grok,
        default_base_url: "https://api.x.ai/v1",
        default_model: "grok-3",
        api_key_env_var: "XAI_API_KEY",
        supports_web_search: true,
        supports_streaming: true,
    },
    CompatSpec {
        name: "mistral",
        kind: ProviderKind::Mistral,
        default_base_url: "https://api.mistral.ai/v1",
        default_model: "mistral-large-latest",
        api_key_env_var: "MISTRAL_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "moonshot",
        kind: ProviderKind::Moonshot,
        default_base_url: "https://api.moonshot.cn/v1",
        default_model: "moonshot-v1-32k",
        api_key_env_var: "MOONSHOT_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "groq",
        kind: ProviderKind::Groq,
        default_base_url: "https://api.groq.com/openai/v1",
        default_model: "llama-3.3-70b-versatile",
        api_key_env_var: "GROQ_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "together",
        kind: ProviderKind::Together,
        default_base_url: "https://api.together.xyz/v1",
        default_model: "meta-llama/Llama-3.3-70B-Instruct-Turbo",
        api_key_env_var: "TOGETHER_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "fireworks",
        kind: ProviderKind::Fireworks,
        default_base_url: "https://api.fireworks.ai/inference/v1",
        default_model: "accounts/fireworks/models/llama-v3p3-70b-instruct",
        api_key_env_var: "FIREWORKS_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "perplexity",
        kind: ProviderKind::Perplexity,
        default_base_url: "https://api.perplexity.ai",
        default_model: "sonar-pro",
        api_key_env_var: "PERPLEXITY_API_KEY",
        supports_web_search: true,
        supports_streaming: true,
    },
    CompatSpec {
        name: "ollama",
        kind: ProviderKind::Ollama,
        default_base_url: "http://localhost:11434/v1",
        default_model: "llama3.1",
        api_key_env_var: "OLLAMA_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
    CompatSpec {
        name: "qwen",
        kind: ProviderKind::Qwen,
        default_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        default_model: "qwen-max",
        api_key_env_var: "DASHSCOPE_API_KEY",
        supports_web_search: false,
        supports_streaming: true,
    },
];

pub fn compat_spec(kind: ProviderKind) -> Option<&'static CompatSpec> {
    COMPAT_PROVIDERS.iter().find(|s| s.kind == kind)
}

// ── The adapter ────────────────────────────────────────────────────────────

pub struct CompatProvider {
    client: Client,
    spec: &'static CompatSpec,
    circuit: Arc<CircuitBreaker>,
}

impl CompatProvider {
    pub fn new(spec: &'static CompatSpec) -> Self {
        CompatProvider { client: shared_client(), spec, circuit: COMPAT_CIRCUIT.clone() }
    }

    /// A provider with its own circuit breaker — used by tests that need
    /// failure isolation.
    pub fn with_circuit(spec: &'static CompatSpec, circuit: Arc<CircuitBreaker>) -> Self {
        CompatProvider { client: shared_client(), spec, circuit }
    }

    /// The generic `custom` entry for base_url-only providers.
    pub fn custom() -> Self {
        const CUSTOM: CompatSpec = CompatSpec {
            name: "custom",
            kind: ProviderKind::Custom,
            default_base_url: "",
            default_model: "",
            api_key_env_var: "CUSTOM_API_KEY",
            supports_web_search: false,
            supports_streaming: true,
        };
        CompatProvider { client: shared_client(), spec: &CUSTOM, circuit: COMPAT_CIRCUIT.clone() }
    }

    fn request(&self, params: &GenerateParams) -> RequestBuilder {
        let base = params
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| self.spec.default_base_url.to_string());
        let api_key = Zeroizing::new(if params.config.api_key.is_empty() {
            std::env::var(self.spec.api_key_env_var).unwrap_or_default()
        } else {
            params.config.api_key.clone()
        });
        self.client
            .post(format!("{}/chat/completions", base.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .bearer_auth(api_key.as_str())
    }

    fn build_messages(params: &GenerateParams) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &params.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for turn in trim_history(&params.history) {
            messages.push(json!({"role": turn.role.as_str(), "content": turn.content}));
        }
        for result in &params.tool_results {
            messages.push(json!({
                "role": "tool",
                "tool_call_id": result.call_id,
                "name": result.name,
                "content": result.content,
            }));
        }
        let content = if params.images.is_empty() {
            json!(params.input)
        } else {
            let mut parts = vec![json!({"type": "text", "text": params.input})];
            for image in &params.images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.media_type, image.data)
                    }
                }));
            }
            json!(parts)
        };
        messages.push(json!({"role": "user", "content": content}));
        messages
    }

    fn model<'a>(&self, params: &'a GenerateParams) -> &'a str {
        if params.config.model.is_empty() {
            self.spec.default_model
        } else {
            &params.config.model
        }
    }

    fn build_body(&self, params: &GenerateParams, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model(params),
            "messages": Self::build_messages(params),
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if !params.tools.is_empty() {
            body["tools"] = json!(params
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }
        if let Some(temp) = params.config.opt_f64("temperature") {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = params.config.opt_i64("max_tokens") {
            body["max_tokens"] = json!(max);
        }
        body
    }

    fn parse_usage(v: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: v["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: v["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: v["total_tokens"].as_u64().unwrap_or(0),
        }
        .normalized()
    }

    fn parse_response(v: &Value, provider: &str) -> Generation {
        let message = &v["choices"][0]["message"];
        let text = message["content"].as_str().unwrap_or("").to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                tool_calls.push(ToolCall {
                    id: call["id"].as_str().unwrap_or("").to_string(),
                    name: call["function"]["name"].as_str().unwrap_or("").to_string(),
                    arguments: call["function"]["arguments"].as_str().unwrap_or("{}").to_string(),
                });
            }
        }

        // Perplexity-style search providers return a top-level citations
        // array of URLs.
        let citations = v["citations"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(|url| Citation {
                        kind: Citation::classify(url),
                        locator: url.to_string(),
                        title: None,
                        snippet: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Generation {
            text: strip_citation_markers(&text),
            usage: Self::parse_usage(&v["usage"]),
            citations,
            tool_calls,
            response_id: v["id"].as_str().map(str::to_string),
            provider: provider.to_string(),
            model: v["model"].as_str().unwrap_or("").to_string(),
            ..Default::default()
        }
    }

    fn response_is_empty(v: &Value) -> bool {
        let gen = Self::parse_response(v, "");
        gen.text.trim().is_empty() && gen.tool_calls.is_empty()
    }
}

/// Accumulates streamed tool-call fragments by index.
#[derive(Default)]
struct ToolCallAssembly {
    calls: Vec<(String, String, String)>,
}

impl ToolCallAssembly {
    fn push(&mut self, delta: &Value) {
        let index = delta["index"].as_u64().unwrap_or(0) as usize;
        while self.calls.len() <= index {
            self.calls.push((String::new(), String::new(), String::new()));
        }
        let slot = &mut self.calls[index];
        if let Some(id) = delta["id"].as_str() {
            slot.0 = id.to_string();
        }
        if let Some(name) = delta["function"]["name"].as_str() {
            slot.1.push_str(name);
        }
        if let Some(args) = delta["function"]["arguments"].as_str() {
            slot.2.push_str(args);
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, args)| ToolCall {
                id,
                name,
                arguments: if args.is_empty() { "{}".to_string() } else { args },
            })
            .collect()
    }
}

#[async_trait]
impl AiProvider for CompatProvider {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn kind(&self) -> ProviderKind {
        self.spec.kind
    }

    fn supports_web_search(&self) -> bool {
        self.spec.supports_web_search
    }

    fn supports_streaming(&self) -> bool {
        self.spec.supports_streaming
    }

    async fn generate(&self, params: &GenerateParams) -> GatewayResult<Generation> {
        let body = self.build_body(params, false);
        info!("[engine] {} request model={}", self.spec.name, self.model(params));
        let (value, capture) = post_json_with_retries(
            self.spec.name,
            &self.circuit,
            || self.request(params),
            &body,
            params.deadline,
            Self::response_is_empty,
        )
        .await
        .map_err(|e| e.into_gateway(self.spec.name))?;

        let mut generation = Self::parse_response(&value, self.spec.name);
        if generation.model.is_empty() {
            generation.model = self.model(params).to_string();
        }
        generation.debug = Some(capture.into_payload());
        Ok(generation)
    }

    async fn generate_stream(&self, params: &GenerateParams) -> GatewayResult<ChunkStream> {
        if !self.spec.supports_streaming {
            return Err(GatewayError::FailedPrecondition(format!(
                "provider {} does not support streaming",
                self.spec.name
            )));
        }
        let body = self.build_body(params, true);
        info!("[engine] {} stream model={}", self.spec.name, self.model(params));
        let provider = self.spec.name;
        let (response, mut capture) = send_with_retries(
            provider,
            &self.circuit,
            || self.request(params),
            &body,
            params.deadline,
        )
        .await
        .map_err(|e| e.into_gateway(provider))?;

        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            let mut lines = LineBuffer::new();
            let mut usage = TokenUsage::default();
            let mut response_id: Option<String> = None;
            let mut model: Option<String> = None;
            let mut tools = ToolCallAssembly::default();
            let mut seen_citations: Vec<String> = Vec::new();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    GatewayError::unavailable(provider, format!("stream read error: {e}"))
                })?;
                capture.push_response(&chunk);

                for line in lines.push(&chunk) {
                    let Some(data) = sse_data(&line) else { continue };
                    if data == "[DONE]" {
                        break 'read;
                    }
                    let Ok(event) = serde_json::from_str::<Value>(data) else { continue };

                    if response_id.is_none() {
                        response_id = event["id"].as_str().map(str::to_string);
                    }
                    if model.is_none() {
                        model = event["model"].as_str().map(str::to_string);
                    }
                    if let Some(u) = event.get("usage") {
                        let parsed = Self::parse_usage(u);
                        if parsed.total_tokens > 0 {
                            usage = parsed;
                        }
                    }
                    if let Some(arr) = event["citations"].as_array() {
                        for url in arr.iter().filter_map(Value::as_str) {
                            if !seen_citations.contains(&url.to_string()) {
                                seen_citations.push(url.to_string());
                                yield StreamChunk::Citation {
                                    citation: Citation {
                                        kind: Citation::classify(url),
                                        locator: url.to_string(),
                                        title: None,
                                        snippet: None,
                                    },
                                };
                            }
                        }
                    }

                    let delta = &event["choices"][0]["delta"];
                    if let Some(text) = delta["content"].as_str() {
                        if !text.is_empty() {
                            yield StreamChunk::TextDelta {
                                text: strip_citation_markers(text),
                            };
                        }
                    }
                    if let Some(calls) = delta["tool_calls"].as_array() {
                        for call in calls {
                            tools.push(call);
                        }
                    }
                }
            }

            for call in tools.finish() {
                yield StreamChunk::ToolCall { call };
            }
            yield StreamChunk::Usage { usage };
            yield StreamChunk::Complete {
                r#final: StreamFinal {
                    usage,
                    response_id,
                    model,
                    debug: Some(std::mem::take(&mut capture).into_payload()),
                },
            };
        };
        Ok(Box::pin(stream))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
