// ── Airborne Engine: Markdown Rendering Sidecar ────────────────────────────
// Client for the stateless render service. The sidecar is an external
// collaborator; its failure is non-fatal and degrades to returning the
// markdown text unchanged.

use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::traits::MarkdownRenderer;
use crate::engine::http::shared_client;

pub struct HttpMarkdownRenderer {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpMarkdownRenderer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        HttpMarkdownRenderer { client: shared_client(), endpoint: endpoint.into(), timeout }
    }
}

#[async_trait]
impl MarkdownRenderer for HttpMarkdownRenderer {
    async fn render(&self, markdown: &str) -> GatewayResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&json!({"markdown": markdown}))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        body["html"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::internal("render sidecar returned no html field"))
    }
}

/// No-op renderer for deployments without the sidecar.
pub struct PlainTextRenderer;

#[async_trait]
impl MarkdownRenderer for PlainTextRenderer {
    async fn render(&self, markdown: &str) -> GatewayResult<String> {
        Ok(markdown.to_string())
    }
}

/// Render, degrading to the input on any failure.
pub async fn render_or_plain(renderer: &dyn MarkdownRenderer, markdown: &str) -> String {
    match renderer.render(markdown).await {
        Ok(html) => html,
        Err(e) => {
            warn!("[engine] Markdown sidecar failed, returning plain text: {e}");
            markdown.to_string()
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenRenderer;

    #[async_trait]
    impl MarkdownRenderer for BrokenRenderer {
        async fn render(&self, _markdown: &str) -> GatewayResult<String> {
            Err(GatewayError::internal("sidecar down"))
        }
    }

    #[tokio::test]
    async fn failure_degrades_to_plain_text() {
        let out = render_or_plain(&BrokenRenderer, "# Title").await;
        assert_eq!(out, "# Title");
    }

    #[tokio::test]
    async fn plain_renderer_is_identity() {
        let out = render_or_plain(&PlainTextRenderer, "**bold**").await;
        assert_eq!(out, "**bold**");
    }
}
