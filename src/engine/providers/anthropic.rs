// ── Airborne Providers: Anthropic Claude ───────────────────────────────────
// Builds a `messages` array with user/assistant roles, carries `system`
// separately, supports opt-in thinking blocks via the `thinking_level`
// config option, and accepts inline image parts.

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
    Citation, CitationKind, Generation, ProviderKind, Role, StreamChunk, StreamFinal, TokenUsage,
    ToolCall,
};
use crate::engine::http::{shared_client, CircuitBreaker};
use crate::engine::providers::common::{
    post_json_with_retries, send_with_retries, sse_data, strip_citation_markers, trim_history,
    LineBuffer,
};

/// Circuit breaker shared across all Anthropic requests.
static ANTHROPIC_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 8192;

pub struct AnthropicProvider {
    client: Client,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        AnthropicProvider { client: shared_client() }
    }

    fn request(&self, params: &GenerateParams) -> RequestBuilder {
        let base = params.config.base_url_or_default();
        let api_key = Zeroizing::new(params.config.api_key.clone());
        self.client
            .post(format!("{}/v1/messages", base.trim_end_matches('/')))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("x-api-key", api_key.as_str())
    }

    fn build_messages(params: &GenerateParams) -> Vec<Value> {
        let mut messages = Vec::new();

        for turn in trim_history(&params.history) {
            let role = match turn.role {
                Role::Assistant => "assistant",
                // Anthropic uses the user role for tool results and folds
                // stray system turns into user content.
                _ => "user",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }

        for result in &params.tool_results {
            messages.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": result.call_id,
                    "content": result.content,
                }]
            }));
        }

        let mut content = Vec::new();
        for image in &params.images {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.media_type,
                    "data": image.data,
                }
            }));
        }
        content.push(json!({"type": "text", "text": params.input}));
        messages.push(json!({"role": "user", "content": content}));
        messages
    }

    fn build_body(params: &GenerateParams, stream: bool) -> Value {
        let max_tokens = params.config.opt_i64("max_tokens").unwrap_or(DEFAULT_MAX_TOKENS);
        let mut body = json!({
            "model": params.config.model,
            "messages": Self::build_messages(params),
            "max_tokens": max_tokens,
            "stream": stream,
        });
        if let Some(system) = &params.system {
            body["system"] = json!(system);
        }
        if !params.tools.is_empty() {
            body["tools"] = json!(params
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                }))
                .collect::<Vec<_>>());
        }
        if let Some(temp) = params.config.opt_f64("temperature") {
            body["temperature"] = json!(temp);
        }

        // Extended thinking is opt-in: a budget plus headroom on max_tokens
        // so thinking and response both fit.
        if let Some(level) = params.config.opt_str("thinking_level") {
            if level != "none" {
                let budget = match level {
                    "low" => 4096,
                    "high" => 32768,
                    _ => 16384,
                };
                body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
                body["max_tokens"] = json!(budget + max_tokens);
            }
        }
        body
    }

    fn parse_usage(v: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: v["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: v["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: 0,
        }
        .normalized()
    }

    fn parse_response(v: &Value, provider: &str) -> Generation {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut citations = Vec::new();

        if let Some(content) = v["content"].as_array() {
            for block in content {
                match block["type"].as_str().unwrap_or("") {
                    "text" => {
                        text.push_str(block["text"].as_str().unwrap_or(""));
                        // Web-search results arrive as citation lists on the
                        // text block.
                        if let Some(cites) = block["citations"].as_array() {
                            for c in cites {
                                if let Some(url) = c["url"].as_str() {
                                    citations.push(Citation {
                                        kind: CitationKind::Url,
                                        locator: url.to_string(),
                                        title: c["title"].as_str().map(str::to_string),
                                        snippet: c["cited_text"].as_str().map(str::to_string),
                                    });
                                }
                            }
                        }
                    }
                    "tool_use" => {
                        tool_calls.push(ToolCall {
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                            arguments: serde_json::to_string(&block["input"])
                                .unwrap_or_else(|_| "{}".to_string()),
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
            model: v["model"].as_str().unwrap_or("").to_string(),
            ..Default::default()
        }
    }

    fn response_is_empty(v: &Value) -> bool {
        let gen = Self::parse_response(v, "");
        gen.text.trim().is_empty() && gen.tool_calls.is_empty()
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn generate(&self, params: &GenerateParams) -> GatewayResult<Generation> {
        let body = Self::build_body(params, false);
        info!("[engine] Anthropic request model={}", params.config.model);
        let (value, capture) = post_json_with_retries(
            "anthropic",
            &ANTHROPIC_CIRCUIT,
            || self.request(params),
            &body,
            params.deadline,
            Self::response_is_empty,
        )
        .await
        .map_err(|e| e.into_gateway("anthropic"))?;

        let mut generation = Self::parse_response(&value, "anthropic");
        if generation.model.is_empty() {
            generation.model = params.config.model.clone();
        }
        generation.debug = Some(capture.into_payload());
        Ok(generation)
    }

    async fn generate_stream(&self, params: &GenerateParams) -> GatewayResult<ChunkStream> {
        let body = Self::build_body(params, true);
        info!("[engine] Anthropic stream model={}", params.config.model);
        let (response, mut capture) = send_with_retries(
            "anthropic",
            &ANTHROPIC_CIRCUIT,
            || self.request(params),
            &body,
            params.deadline,
        )
        .await
        .map_err(|e| e.into_gateway("anthropic"))?;

        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            let mut lines = LineBuffer::new();
            let mut usage = TokenUsage::default();
            let mut response_id: Option<String> = None;
            let mut model: Option<String> = None;
            // Tool-use blocks stream as a start event plus argument deltas,
            // keyed by block index.
            let mut open_tool: Option<(String, String, String)> = None;

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    GatewayError::unavailable("anthropic", format!("stream read error: {e}"))
                })?;
                capture.push_response(&chunk);

                for line in lines.push(&chunk) {
                    let Some(data) = sse_data(&line) else { continue };
                    let Ok(event) = serde_json::from_str::<Value>(data) else { continue };

                    match event["type"].as_str().unwrap_or("") {
                        "message_start" => {
                            let msg = &event["message"];
                            response_id = msg["id"].as_str().map(str::to_string);
                            model = msg["model"].as_str().map(str::to_string);
                            usage.input_tokens =
                                msg["usage"]["input_tokens"].as_u64().unwrap_or(0);
                        }
                        "content_block_start" => {
                            let block = &event["content_block"];
                            if block["type"].as_str() == Some("tool_use") {
                                open_tool = Some((
                                    block["id"].as_str().unwrap_or("").to_string(),
                                    block["name"].as_str().unwrap_or("").to_string(),
                                    String::new(),
                                ));
                            }
                        }
                        "content_block_delta" => {
                            let delta = &event["delta"];
                            match delta["type"].as_str().unwrap_or("") {
                                "text_delta" => {
                                    if let Some(text) = delta["text"].as_str() {
                                        yield StreamChunk::TextDelta {
                                            text: strip_citation_markers(text),
                                        };
                                    }
                                }
                                "input_json_delta" => {
                                    if let Some(open) = open_tool.as_mut() {
                                        open.2.push_str(
                                            delta["partial_json"].as_str().unwrap_or(""),
                                        );
                                    }
                                }
                                "citations_delta" => {
                                    let c = &delta["citation"];
                                    if let Some(url) = c["url"].as_str() {
                                        yield StreamChunk::Citation {
                                            citation: Citation {
                                                kind: CitationKind::Url,
                                                locator: url.to_string(),
                                                title: c["title"].as_str().map(str::to_string),
                                                snippet: c["cited_text"]
                                                    .as_str()
                                                    .map(str::to_string),
                                            },
                                        };
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            if let Some((id, name, args)) = open_tool.take() {
                                yield StreamChunk::ToolCall {
                                    call: ToolCall {
                                        id,
                                        name,
                                        arguments: if args.is_empty() {
                                            "{}".to_string()
                                        } else {
                                            args
                                        },
                                    },
                                };
                            }
                        }
                        "message_delta" => {
                            if let Some(out) =
                                event["usage"]["output_tokens"].as_u64()
                            {
                                usage.output_tokens = out;
                            }
                        }
                        "message_stop" => {
                            let usage = usage.normalized();
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
                        _ => {}
                    }
                }
            }

            yield StreamChunk::Complete {
                r#final: StreamFinal {
                    usage: usage.normalized(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{HistoryTurn, InlineImage, ProviderConfig};
    use std::collections::HashMap;

    fn config() -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::Anthropic,
            provider: "anthropic".to_string(),
            api_key: "sk-ant-test".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
            options: HashMap::new(),
        }
    }

    #[test]
    fn system_rides_separately_from_messages() {
        let mut params = GenerateParams::new(config(), "hello");
        params.system = Some("You are helpful".to_string());
        params.history = vec![HistoryTurn { role: Role::Assistant, content: "hi".to_string() }];

        let body = AnthropicProvider::build_body(&params, false);
        assert_eq!(body["system"], json!("You are helpful"));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], json!("assistant"));
        assert_eq!(messages[1]["role"], json!("user"));
    }

    #[test]
    fn thinking_opt_in_raises_max_tokens() {
        let mut cfg = config();
        cfg.options.insert("thinking_level".to_string(), json!("high"));
        let params = GenerateParams::new(cfg, "think hard");
        let body = AnthropicProvider::build_body(&params, false);
        assert_eq!(body["thinking"]["budget_tokens"], json!(32768));
        assert_eq!(body["max_tokens"], json!(32768 + DEFAULT_MAX_TOKENS));

        let params = GenerateParams::new(config(), "no thinking");
        let body = AnthropicProvider::build_body(&params, false);
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn inline_images_become_base64_blocks() {
        let mut params = GenerateParams::new(config(), "what is this");
        params.images = vec![InlineImage {
            media_type: "image/png".to_string(),
            data: "aGVsbG8=".to_string(),
        }];
        let body = AnthropicProvider::build_body(&params, false);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], json!("image"));
        assert_eq!(content[0]["source"]["media_type"], json!("image/png"));
        assert_eq!(content[1]["type"], json!("text"));
    }

    #[test]
    fn tool_results_use_the_user_role() {
        let mut params = GenerateParams::new(config(), "go on");
        params.tool_results = vec![crate::atoms::types::ToolResultEcho {
            call_id: "toolu_1".to_string(),
            name: "lookup".to_string(),
            content: "42".to_string(),
        }];
        let body = AnthropicProvider::build_body(&params, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], json!("user"));
        assert_eq!(messages[0]["content"][0]["type"], json!("tool_result"));
        assert_eq!(messages[0]["content"][0]["tool_use_id"], json!("toolu_1"));
    }

    #[test]
    fn parses_text_tool_use_and_usage() {
        let v = json!({
            "id": "msg_01",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "Using the tool."},
                {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 9}
        });
        let gen = AnthropicProvider::parse_response(&v, "anthropic");
        assert_eq!(gen.text, "Using the tool.");
        assert_eq!(gen.tool_calls.len(), 1);
        assert_eq!(gen.tool_calls[0].id, "toolu_1");
        assert_eq!(
            serde_json::from_str::<Value>(&gen.tool_calls[0].arguments).unwrap(),
            json!({"q": "x"})
        );
        assert_eq!(gen.usage.total_tokens, 29);
    }
}
