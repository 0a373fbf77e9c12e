// ── Airborne Providers: Google Gemini ──────────────────────────────────────
// Builds a `contents` array (user/model roles), a `generation_config`, and
// an optional `system_instruction`. Honors safety thresholds and thinking
// configuration from the effective config and accepts inline images.
//
// When the config carries a `file_name_map` option (file-id → logical
// name), a system-instruction preamble injects the map so the model can
// emit well-formed citations against attached files.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use log::{info, warn};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::sync::LazyLock;

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

/// Circuit breaker shared across all Google/Gemini requests.
static GOOGLE_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

pub struct GoogleProvider {
    client: Client,
}

impl GoogleProvider {
    pub fn new() -> Self {
        GoogleProvider { client: shared_client() }
    }

    fn request(&self, params: &GenerateParams, verb: &str) -> RequestBuilder {
        let base = params.config.base_url_or_default();
        let url = format!(
            "{}/models/{}:{verb}",
            base.trim_end_matches('/'),
            params.config.model,
        );
        self.client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &params.config.api_key)
    }

    /// System instruction with the optional file-id → name preamble.
    fn build_system(params: &GenerateParams) -> Option<Value> {
        let mut text = String::new();
        if let Some(map) = params.config.options.get("file_name_map").and_then(|v| v.as_object()) {
            if !map.is_empty() {
                text.push_str("Attached files, by id:\n");
                for (id, name) in map {
                    text.push_str(&format!("  {id} = {}\n", name.as_str().unwrap_or("?")));
                }
                text.push_str("Cite attached files by their id.\n\n");
            }
        }
        if let Some(system) = &params.system {
            text.push_str(system);
        }
        if text.is_empty() {
            None
        } else {
            Some(json!({"parts": [{"text": text}]}))
        }
    }

    fn build_contents(params: &GenerateParams) -> Vec<Value> {
        let mut contents: Vec<Value> = Vec::new();

        for turn in trim_history(&params.history) {
            let role = match turn.role {
                Role::Assistant => "model",
                _ => "user",
            };
            contents.push(json!({"role": role, "parts": [{"text": turn.content}]}));
        }

        for result in &params.tool_results {
            contents.push(json!({
                "role": "function",
                "parts": [{
                    "functionResponse": {
                        "name": result.name,
                        "response": {"result": result.content},
                    }
                }]
            }));
        }

        let mut parts = Vec::new();
        for image in &params.images {
            parts.push(json!({
                "inlineData": {"mimeType": image.media_type, "data": image.data}
            }));
        }
        parts.push(json!({"text": params.input}));
        contents.push(json!({"role": "user", "parts": parts}));

        // Gemini requires strictly alternating user/model turns; merge
        // consecutive same-role entries (never function responses).
        let mut merged: Vec<Value> = Vec::new();
        for entry in contents {
            let role = entry["role"].as_str().unwrap_or("").to_string();
            let can_merge = role != "function"
                && merged
                    .last()
                    .and_then(|e| e["role"].as_str())
                    .map(|r| r == role)
                    .unwrap_or(false);
            if can_merge {
                if let Some(last) = merged.last_mut() {
                    if let (Some(existing), Some(new)) =
                        (last["parts"].as_array().cloned(), entry["parts"].as_array())
                    {
                        let mut combined = existing;
                        combined.extend(new.iter().cloned());
                        last["parts"] = json!(combined);
                    }
                }
            } else {
                merged.push(entry);
            }
        }
        merged
    }

    /// Strip schema fields Gemini rejects: `additionalProperties`,
    /// `$schema`, `$ref`, empty `required`, empty `properties`.
    fn sanitize_schema(val: &Value) -> Value {
        match val {
            Value::Object(map) => {
                let mut clean = serde_json::Map::new();
                for (k, v) in map {
                    if k == "additionalProperties" || k == "$schema" || k == "$ref" {
                        continue;
                    }
                    if k == "required" {
                        if let Value::Array(arr) = v {
                            if arr.is_empty() {
                                continue;
                            }
                        }
                    }
                    if k == "properties" {
                        if let Value::Object(props) = v {
                            if props.is_empty() {
                                continue;
                            }
                        }
                    }
                    clean.insert(k.clone(), Self::sanitize_schema(v));
                }
                if clean.get("type").and_then(|v| v.as_str()) == Some("object")
                    && !clean.contains_key("properties")
                {
                    clean.remove("type");
                }
                Value::Object(clean)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(Self::sanitize_schema).collect()),
            other => other.clone(),
        }
    }

    fn build_body(params: &GenerateParams) -> Value {
        let mut body = json!({"contents": Self::build_contents(params)});

        if let Some(system) = Self::build_system(params) {
            body["systemInstruction"] = system;
        }
        if !params.tools.is_empty() {
            let declarations: Vec<Value> = params
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": Self::sanitize_schema(&t.parameters),
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(v) = params.config.opt_f64("temperature") {
            generation_config.insert("temperature".to_string(), json!(v));
        }
        if let Some(v) = params.config.opt_f64("top_p") {
            generation_config.insert("topP".to_string(), json!(v));
        }
        if let Some(v) = params.config.opt_i64("top_k") {
            generation_config.insert("topK".to_string(), json!(v));
        }
        if let Some(v) = params.config.opt_i64("max_output_tokens") {
            generation_config.insert("maxOutputTokens".to_string(), json!(v));
        }
        if let Some(budget) = params.config.opt_i64("thinking_budget") {
            generation_config
                .insert("thinkingConfig".to_string(), json!({"thinkingBudget": budget}));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        if let Some(threshold) = params.config.opt_str("safety_threshold") {
            let categories = [
                "HARM_CATEGORY_HARASSMENT",
                "HARM_CATEGORY_HATE_SPEECH",
                "HARM_CATEGORY_SEXUALLY_EXPLICIT",
                "HARM_CATEGORY_DANGEROUS_CONTENT",
            ];
            body["safetySettings"] = json!(categories
                .iter()
                .map(|c| json!({"category": c, "threshold": threshold}))
                .collect::<Vec<_>>());
        }
        body
    }

    fn parse_usage(v: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: v["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: v["candidatesTokenCount"].as_u64().unwrap_or(0),
            total_tokens: v["totalTokenCount"].as_u64().unwrap_or(0),
        }
        .normalized()
    }

    fn parse_citations(candidate: &Value) -> Vec<Citation> {
        let mut citations = Vec::new();
        if let Some(sources) = candidate["citationMetadata"]["citationSources"].as_array() {
            for s in sources {
                if let Some(uri) = s["uri"].as_str() {
                    citations.push(Citation {
                        kind: Citation::classify(uri),
                        locator: uri.to_string(),
                        title: None,
                        snippet: None,
                    });
                }
            }
        }
        if let Some(chunks) = candidate["groundingMetadata"]["groundingChunks"].as_array() {
            for c in chunks {
                if let Some(uri) = c["web"]["uri"].as_str() {
                    citations.push(Citation {
                        kind: CitationKind::Url,
                        locator: uri.to_string(),
                        title: c["web"]["title"].as_str().map(str::to_string),
                        snippet: None,
                    });
                }
            }
        }
        citations
    }

    fn parse_response(v: &Value, provider: &str) -> Generation {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut citations = Vec::new();

        if let Some(candidates) = v["candidates"].as_array() {
            for candidate in candidates {
                citations.extend(Self::parse_citations(candidate));
                if let Some(parts) = candidate["content"]["parts"].as_array() {
                    for part in parts {
                        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                            continue;
                        }
                        if let Some(t) = part["text"].as_str() {
                            text.push_str(t);
                        }
                        if let Some(fc) = part.get("functionCall") {
                            tool_calls.push(ToolCall {
                                id: format!("call_{}", uuid::Uuid::new_v4()),
                                name: fc["name"].as_str().unwrap_or("").to_string(),
                                arguments: serde_json::to_string(&fc["args"])
                                    .unwrap_or_else(|_| "{}".to_string()),
                            });
                        }
                    }
                }
            }
        }

        Generation {
            text: strip_citation_markers(&text),
            usage: Self::parse_usage(&v["usageMetadata"]),
            citations,
            tool_calls,
            response_id: v["responseId"].as_str().map(str::to_string),
            provider: provider.to_string(),
            model: v["modelVersion"].as_str().unwrap_or("").to_string(),
            ..Default::default()
        }
    }

    fn response_is_empty(v: &Value) -> bool {
        let gen = Self::parse_response(v, "");
        gen.text.trim().is_empty() && gen.tool_calls.is_empty()
    }
}

impl Default for GoogleProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn supports_file_search(&self) -> bool {
        true
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn generate(&self, params: &GenerateParams) -> GatewayResult<Generation> {
        let body = Self::build_body(params);
        info!("[engine] Google request model={}", params.config.model);
        let (value, capture) = post_json_with_retries(
            "google",
            &GOOGLE_CIRCUIT,
            || self.request(params, "generateContent"),
            &body,
            params.deadline,
            Self::response_is_empty,
        )
        .await
        .map_err(|e| e.into_gateway("google"))?;

        let mut generation = Self::parse_response(&value, "google");
        if generation.model.is_empty() {
            generation.model = params.config.model.clone();
        }
        generation.debug = Some(capture.into_payload());
        Ok(generation)
    }

    async fn generate_stream(&self, params: &GenerateParams) -> GatewayResult<ChunkStream> {
        let body = Self::build_body(params);
        info!("[engine] Google stream model={}", params.config.model);
        let (response, mut capture) = send_with_retries(
            "google",
            &GOOGLE_CIRCUIT,
            || self.request(params, "streamGenerateContent?alt=sse"),
            &body,
            params.deadline,
        )
        .await
        .map_err(|e| e.into_gateway("google"))?;

        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            let mut lines = LineBuffer::new();
            let mut usage = TokenUsage::default();
            let mut response_id: Option<String> = None;
            let mut model: Option<String> = None;
            let mut seen_citations: Vec<String> = Vec::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    GatewayError::unavailable("google", format!("stream read error: {e}"))
                })?;
                capture.push_response(&chunk);

                for line in lines.push(&chunk) {
                    let Some(data) = sse_data(&line) else { continue };
                    let Ok(event) = serde_json::from_str::<Value>(data) else { continue };

                    if model.is_none() {
                        model = event["modelVersion"].as_str().map(str::to_string);
                    }
                    if response_id.is_none() {
                        response_id = event["responseId"].as_str().map(str::to_string);
                    }

                    if let Some(candidates) = event["candidates"].as_array() {
                        for candidate in candidates {
                            let finish = candidate["finishReason"].as_str();
                            if candidate["content"].is_null() && finish.map_or(false, |r| r != "STOP") {
                                warn!(
                                    "[engine] Google: empty candidate, finishReason={}",
                                    finish.unwrap_or("?")
                                );
                                continue;
                            }
                            for c in Self::parse_citations(candidate) {
                                if !seen_citations.contains(&c.locator) {
                                    seen_citations.push(c.locator.clone());
                                    yield StreamChunk::Citation { citation: c };
                                }
                            }
                            if let Some(parts) = candidate["content"]["parts"].as_array() {
                                for part in parts {
                                    if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                                        continue;
                                    }
                                    if let Some(text) = part["text"].as_str() {
                                        yield StreamChunk::TextDelta {
                                            text: strip_citation_markers(text),
                                        };
                                    }
                                    if let Some(fc) = part.get("functionCall") {
                                        yield StreamChunk::ToolCall {
                                            call: ToolCall {
                                                id: format!("call_{}", uuid::Uuid::new_v4()),
                                                name: fc["name"]
                                                    .as_str()
                                                    .unwrap_or("")
                                                    .to_string(),
                                                arguments: serde_json::to_string(&fc["args"])
                                                    .unwrap_or_else(|_| "{}".to_string()),
                                            },
                                        };
                                    }
                                    if let Some(exec) = part.get("executableCode") {
                                        yield StreamChunk::CodeExecution {
                                            code: exec["code"]
                                                .as_str()
                                                .unwrap_or("")
                                                .to_string(),
                                        };
                                    }
                                }
                            }
                        }
                    }

                    if let Some(um) = event.get("usageMetadata") {
                        let parsed = Self::parse_usage(um);
                        if parsed.total_tokens > 0 {
                            usage = parsed;
                        }
                    }
                }
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
