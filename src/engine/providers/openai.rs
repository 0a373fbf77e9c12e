// ── Airborne Providers: OpenAI (Responses API) ─────────────────────────────
// Speaks the conversation/responses surface with native multi-turn
// continuity: when the request carries a `previous_response_id`, it is
// passed upstream instead of full history.
//
// Provider-specific options honored from the effective config:
// `reasoning_effort`, `service_tier`, `verbosity`, `prompt_cache_retention`.
// Unknown keys are ignored.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use log::info;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::sync::LazyLock;
use zeroize::Zeroizing;

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::traits::{AiProvider, ChunkStream, GenerateParams};
use crate::atoms::types::{
    Citation, Generation, ImageBlob, ProviderKind, Role, StreamChunk, StreamFinal, TokenUsage,
    ToolCall,
};
use crate::engine::http::{shared_client, CircuitBreaker, UpstreamError};
use crate::engine::providers::common::{
    post_json_with_retries, send_with_retries, sse_data, strip_citation_markers, trim_history,
    LineBuffer,
};

/// Circuit breaker shared across all OpenAI requests.
static OPENAI_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

pub struct OpenAiProvider {
    client: Client,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        OpenAiProvider { client: shared_client() }
    }

    fn request(&self, params: &GenerateParams, path: &str) -> RequestBuilder {
        let base = params.config.base_url_or_default();
        let api_key = Zeroizing::new(params.config.api_key.clone());
        self.client
            .post(format!("{}{path}", base.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .bearer_auth(api_key.as_str())
    }

    /// Input items: trimmed history (omitted under native continuity),
    /// tool-result echoes, then the current user message.
    fn build_input(params: &GenerateParams) -> Vec<Value> {
        let mut items = Vec::new();

        if params.previous_response_id.is_none() {
            for turn in trim_history(&params.history) {
                let (role, part_type) = match turn.role {
                    Role::Assistant => ("assistant", "output_text"),
                    Role::System => ("system", "input_text"),
                    _ => ("user", "input_text"),
                };
                items.push(json!({
                    "role": role,
                    "content": [{"type": part_type, "text": turn.content}],
                }));
            }
        }

        for result in &params.tool_results {
            items.push(json!({
                "type": "function_call_output",
                "call_id": result.call_id,
                "output": result.content,
            }));
        }

        let mut content = vec![json!({"type": "input_text", "text": params.input})];
        for image in &params.images {
            content.push(json!({
                "type": "input_image",
                "image_url": format!("data:{};base64,{}", image.media_type, image.data),
            }));
        }
        items.push(json!({"role": "user", "content": content}));
        items
    }

    fn build_body(params: &GenerateParams, stream: bool) -> Value {
        let mut body = json!({
            "model": params.config.model,
            "input": Self::build_input(params),
            "stream": stream,
        });
        if let Some(system) = &params.system {
            body["instructions"] = json!(system);
        }
        if let Some(prev) = &params.previous_response_id {
            body["previous_response_id"] = json!(prev);
        }
        if !params.tools.is_empty() {
            body["tools"] = json!(params
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }))
                .collect::<Vec<_>>());
        }
        if let Some(effort) = params.config.opt_str("reasoning_effort") {
            body["reasoning"] = json!({"effort": effort});
        }
        if let Some(tier) = params.config.opt_str("service_tier") {
            body["service_tier"] = json!(tier);
        }
        if let Some(verbosity) = params.config.opt_str("verbosity") {
            body["text"] = json!({"verbosity": verbosity});
        }
        if let Some(retention) = params.config.opt_str("prompt_cache_retention") {
            body["prompt_cache_retention"] = json!(retention);
        }
        if let Some(temp) = params.config.opt_f64("temperature") {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn parse_usage(v: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: v["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: v["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: v["total_tokens"].as_u64().unwrap_or(0),
        }
        .normalized()
    }

    fn parse_annotation(a: &Value) -> Option<Citation> {
        match a["type"].as_str() {
            Some("url_citation") => {
                let url = a["url"].as_str()?.to_string();
                Some(Citation {
                    kind: Citation::classify(&url),
                    locator: url,
                    title: a["title"].as_str().map(str::to_string),
                    snippet: None,
                })
            }
            Some("file_citation") => {
                let file_id = a["file_id"].as_str()?.to_string();
                Some(Citation {
                    kind: crate::atoms::types::CitationKind::File,
                    locator: file_id,
                    title: a["filename"].as_str().map(str::to_string),
                    snippet: a["quote"].as_str().map(str::to_string),
                })
            }
            _ => None,
        }
    }

    fn parse_response(v: &Value, provider: &str) -> Generation {
        let mut text = String::new();
        let mut citations = Vec::new();
        let mut tool_calls = Vec::new();

        if let Some(output) = v["output"].as_array() {
            for item in output {
                match item["type"].as_str().unwrap_or("") {
                    "message" => {
                        if let Some(parts) = item["content"].as_array() {
                            for part in parts {
                                if part["type"].as_str() == Some("output_text") {
                                    text.push_str(part["text"].as_str().unwrap_or(""));
                                    if let Some(anns) = part["annotations"].as_array() {
                                        citations.extend(anns.iter().filter_map(Self::parse_annotation));
                                    }
                                }
                            }
                        }
                    }
                    "function_call" => {
                        tool_calls.push(ToolCall {
                            id: item["call_id"]
                                .as_str()
                                .or_else(|| item["id"].as_str())
                                .unwrap_or("")
                                .to_string(),
                            name: item["name"].as_str().unwrap_or("").to_string(),
                            arguments: item["arguments"].as_str().unwrap_or("{}").to_string(),
                        });
                    }
                    _ => {}
                }
            }
        }

        Generation {
            text: strip_citation_markers(&text),
            usage: Self::parse_usage(&v["usage"]),
            citations,
            tool_calls,
            response_id: v["id"].as_str().map(str::to_string),
            provider: provider.to_string(),
            model: v["model"]
                .as_str()
                .unwrap_or("")
                .to_string(),
            ..Default::default()
        }
    }

    fn response_is_empty(v: &Value) -> bool {
        let gen = Self::parse_response(v, "");
        gen.text.trim().is_empty() && gen.tool_calls.is_empty()
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn supports_file_search(&self) -> bool {
        true
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    fn supports_native_continuity(&self) -> bool {
        true
    }

    async fn generate(&self, params: &GenerateParams) -> GatewayResult<Generation> {
        let body = Self::build_body(params, false);
        info!(
            "[engine] OpenAI request model={} continuity={}",
            params.config.model,
            params.previous_response_id.is_some()
        );
        let (value, capture) = post_json_with_retries(
            "openai",
            &OPENAI_CIRCUIT,
            || self.request(params, "/responses"),
            &body,
            params.deadline,
            Self::response_is_empty,
        )
        .await
        .map_err(|e| e.into_gateway("openai"))?;

        let mut generation = Self::parse_response(&value, "openai");
        if generation.model.is_empty() {
            generation.model = params.config.model.clone();
        }
        generation.debug = Some(capture.into_payload());
        Ok(generation)
    }

    async fn generate_stream(&self, params: &GenerateParams) -> GatewayResult<ChunkStream> {
        let body = Self::build_body(params, true);
        info!("[engine] OpenAI stream model={}", params.config.model);
        let (response, mut capture) = send_with_retries(
            "openai",
            &OPENAI_CIRCUIT,
            || self.request(params, "/responses"),
            &body,
            params.deadline,
        )
        .await
        .map_err(|e| e.into_gateway("openai"))?;

        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            let mut lines = LineBuffer::new();
            let mut usage = TokenUsage::default();
            let mut response_id: Option<String> = None;
            let mut model: Option<String> = None;

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    GatewayError::unavailable("openai", format!("stream read error: {e}"))
                })?;
                capture.push_response(&chunk);

                for line in lines.push(&chunk) {
                    let Some(data) = sse_data(&line) else { continue };
                    let Ok(event) = serde_json::from_str::<Value>(data) else { continue };

                    match event["type"].as_str().unwrap_or("") {
                        "response.output_text.delta" => {
                            if let Some(delta) = event["delta"].as_str() {
                                yield StreamChunk::TextDelta {
                                    text: strip_citation_markers(delta),
                                };
                            }
                        }
                        "response.output_text.annotation.added" => {
                            if let Some(c) = Self::parse_annotation(&event["annotation"]) {
                                yield StreamChunk::Citation { citation: c };
                            }
                        }
                        "response.output_item.done" => {
                            let item = &event["item"];
                            if item["type"].as_str() == Some("function_call") {
                                yield StreamChunk::ToolCall {
                                    call: ToolCall {
                                        id: item["call_id"]
                                            .as_str()
                                            .or_else(|| item["id"].as_str())
                                            .unwrap_or("")
                                            .to_string(),
                                        name: item["name"].as_str().unwrap_or("").to_string(),
                                        arguments: item["arguments"]
                                            .as_str()
                                            .unwrap_or("{}")
                                            .to_string(),
                                    },
                                };
                            }
                        }
                        "response.code_interpreter_call_code.done" => {
                            if let Some(code) = event["code"].as_str() {
                                yield StreamChunk::CodeExecution { code: code.to_string() };
                            }
                        }
                        "response.completed" => {
                            let resp = &event["response"];
                            usage = Self::parse_usage(&resp["usage"]);
                            response_id = resp["id"].as_str().map(str::to_string);
                            model = resp["model"].as_str().map(str::to_string);
                            yield StreamChunk::Usage { usage };
                            yield StreamChunk::Complete {
                                r#final: StreamFinal {
                                    usage,
                                    response_id: response_id.clone(),
                                    model: model.clone(),
                                    debug: Some(std::mem::take(&mut capture).into_payload()),
                                },
                            };
                            return;
                        }
                        "response.failed" | "error" => {
                            let message = event["response"]["error"]["message"]
                                .as_str()
                                .or_else(|| event["message"].as_str())
                                .unwrap_or("upstream reported failure")
                                .to_string();
                            Err(UpstreamError::Api { status: 500, message }
                                .into_gateway("openai"))?;
                        }
                        _ => {}
                    }
                }
            }

            // Upstream closed without a completed event: still terminal.
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

    async fn generate_image(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> GatewayResult<Vec<ImageBlob>> {
        let model = params
            .config
            .opt_str("image_model")
            .unwrap_or("gpt-image-1")
            .to_string();
        let body = json!({"model": model, "prompt": prompt, "n": 1});
        info!("[engine] OpenAI image request model={model}");
        let (value, _) = post_json_with_retries(
            "openai",
            &OPENAI_CIRCUIT,
            || self.request(params, "/images/generations"),
            &body,
            params.deadline,
            |v| v["data"].as_array().map(Vec::is_empty).unwrap_or(true),
        )
        .await
        .map_err(|e| e.into_gateway("openai"))?;

        let blobs = value["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|d| d["b64_json"].as_str())
                    .map(|b64| ImageBlob { media_type: "image/png".to_string(), data: b64.to_string() })
                    .collect()
            })
            .unwrap_or_default();
        Ok(blobs)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
