// ── Airborne Providers: Shared Plumbing ────────────────────────────────────
// The retry loop, SSE line splitting, history trimming, and citation-marker
// stripping used by every adapter. The retry discipline must behave
// identically across adapters, so it lives here exactly once; adapters own
// only the wire translation.

use log::{error, warn};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use std::time::Instant;

use crate::atoms::constants::{HISTORY_CHAR_CEILING, MAX_ATTEMPTS};
use crate::atoms::types::HistoryTurn;
use crate::engine::http::{
    attempt_timeout, classify_send_error, clip, may_retry, response_retry_after, retry_delay,
    CircuitBreaker, DebugCapture, UpstreamError,
};

// ── Retry loop ─────────────────────────────────────────────────────────────

/// POST and return the raw 2xx response, retrying per the shared
/// discipline. Used by the streaming paths: once a good response is
/// obtained, body errors surface through the stream instead.
///
/// `build` constructs a fresh request (url + headers) per attempt; the JSON
/// body is attached here so the captured request bytes match what was sent.
pub async fn send_with_retries(
    provider: &str,
    circuit: &CircuitBreaker,
    build: impl Fn() -> RequestBuilder,
    body: &Value,
    deadline: Option<Instant>,
) -> Result<(Response, DebugCapture), UpstreamError> {
    if let Err(msg) = circuit.check() {
        return Err(UpstreamError::Transport(msg));
    }

    let body_bytes = serde_json::to_vec(body)
        .map_err(|e| UpstreamError::Transport(format!("request serialization failed: {e}")))?;
    let mut capture = DebugCapture::new();
    capture.set_request(&body_bytes);

    let mut last_err = UpstreamError::Transport("no attempt ran".to_string());
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = retry_delay(attempt - 1, last_err.retry_after()).await;
            warn!(
                "[engine] {provider} retry {attempt}/{} after {}ms",
                MAX_ATTEMPTS - 1,
                delay.as_millis()
            );
        }

        let Some(timeout) = attempt_timeout(deadline) else {
            return Err(UpstreamError::Deadline);
        };

        let sent = tokio::time::timeout(timeout, build().json(body).send()).await;
        let response = match sent {
            Err(_) => {
                circuit.record_failure();
                last_err = UpstreamError::Timeout;
                if may_retry(attempt, &last_err) {
                    continue;
                }
                return Err(last_err);
            }
            Ok(Err(e)) => {
                circuit.record_failure();
                last_err = classify_send_error(&e);
                if may_retry(attempt, &last_err) {
                    continue;
                }
                return Err(last_err);
            }
            Ok(Ok(r)) => r,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = response_retry_after(&response);
            let text = response.text().await.unwrap_or_default();
            error!("[engine] {provider} error {status}: {}", clip(&text, 500));
            circuit.record_failure();

            // Upstream auth errors are never retried.
            if status == 401 || status == 403 {
                return Err(UpstreamError::Auth(format!(
                    "API error {status}: {}",
                    clip(&text, 200)
                )));
            }
            last_err = if status == 429 {
                UpstreamError::RateLimited {
                    message: format!("API error 429: {}", clip(&text, 200)),
                    retry_after_secs: retry_after,
                }
            } else {
                UpstreamError::Api { status, message: clip(&text, 200).to_string() }
            };
            if may_retry(attempt, &last_err) {
                continue;
            }
            return Err(last_err);
        }

        circuit.record_success();
        return Ok((response, capture));
    }
    Err(last_err)
}

/// POST, read and parse the JSON body, retrying per the shared discipline.
/// Used by the unary paths. `is_empty` lets each adapter flag an
/// empty-text 2xx response, which counts as retryable.
pub async fn post_json_with_retries(
    provider: &str,
    circuit: &CircuitBreaker,
    build: impl Fn() -> RequestBuilder,
    body: &Value,
    deadline: Option<Instant>,
    is_empty: impl Fn(&Value) -> bool,
) -> Result<(Value, DebugCapture), UpstreamError> {
    let mut last_err = UpstreamError::Transport("no attempt ran".to_string());
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = retry_delay(attempt - 1, last_err.retry_after()).await;
            warn!(
                "[engine] {provider} retry {attempt}/{} after {}ms",
                MAX_ATTEMPTS - 1,
                delay.as_millis()
            );
        }

        // One "attempt" here is the whole round trip, so re-enter the send
        // helper with a single-attempt budget and keep loop control local.
        let result = send_once(provider, circuit, &build, body, deadline).await;
        match result {
            Err(e) => {
                last_err = e;
                if may_retry(attempt, &last_err) {
                    continue;
                }
                return Err(last_err);
            }
            Ok((value, capture)) => {
                if is_empty(&value) {
                    warn!("[engine] {provider} returned an empty response");
                    circuit.record_failure();
                    last_err = UpstreamError::Empty;
                    if may_retry(attempt, &last_err) {
                        continue;
                    }
                    return Err(last_err);
                }
                circuit.record_success();
                return Ok((value, capture));
            }
        }
    }
    Err(last_err)
}

/// One attempt: POST, classify status, read and parse the body.
async fn send_once(
    provider: &str,
    circuit: &CircuitBreaker,
    build: &impl Fn() -> RequestBuilder,
    body: &Value,
    deadline: Option<Instant>,
) -> Result<(Value, DebugCapture), UpstreamError> {
    if let Err(msg) = circuit.check() {
        return Err(UpstreamError::Transport(msg));
    }

    let body_bytes = serde_json::to_vec(body)
        .map_err(|e| UpstreamError::Transport(format!("request serialization failed: {e}")))?;
    let mut capture = DebugCapture::new();
    capture.set_request(&body_bytes);

    let Some(timeout) = attempt_timeout(deadline) else {
        return Err(UpstreamError::Deadline);
    };

    let attempt = async {
        let response = build()
            .json(body)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = response_retry_after(&response);
            let text = response.text().await.unwrap_or_default();
            error!("[engine] {provider} error {status}: {}", clip(&text, 500));
            if status == 401 || status == 403 {
                return Err(UpstreamError::Auth(format!(
                    "API error {status}: {}",
                    clip(&text, 200)
                )));
            }
            if status == 429 {
                return Err(UpstreamError::RateLimited {
                    message: format!("API error 429: {}", clip(&text, 200)),
                    retry_after_secs: retry_after,
                });
            }
            return Err(UpstreamError::Api { status, message: clip(&text, 200).to_string() });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(format!("body read failed: {e}")))?;
        Ok(bytes)
    };

    let bytes = match tokio::time::timeout(timeout, attempt).await {
        Err(_) => {
            circuit.record_failure();
            return Err(UpstreamError::Timeout);
        }
        Ok(Err(e)) => {
            circuit.record_failure();
            return Err(e);
        }
        Ok(Ok(b)) => b,
    };

    capture.push_response(&bytes);
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| UpstreamError::Transport(format!("response parse failed: {e}")))?;
    Ok((value, capture))
}

// ── SSE line splitting ─────────────────────────────────────────────────────

/// Accumulates raw bytes and yields complete lines. SSE frames arrive on
/// arbitrary chunk boundaries; this keeps the tail until its newline shows
/// up.
#[derive(Default)]
pub struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim().to_string();
            self.buffer = self.buffer[line_end + 1..].to_string();
            lines.push(line);
        }
        lines
    }
}

/// Pull the payload out of an SSE `data: ` line.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
}

// ── History trimming ───────────────────────────────────────────────────────

/// Bound assembled history to the adapter character ceiling: drop oldest
/// turns first, preserve chronological order of what remains.
pub fn trim_history(history: &[HistoryTurn]) -> &[HistoryTurn] {
    let mut total: usize = history.iter().map(|t| t.content.len()).sum();
    let mut start = 0;
    while total > HISTORY_CHAR_CEILING && start < history.len() {
        total -= history[start].content.len();
        start += 1;
    }
    &history[start..]
}

// ── Citation-marker stripping ──────────────────────────────────────────────

/// Remove in-text citation markers of the `【…】` form that file-search
/// uploads leave in model output. The citations themselves are emitted
/// separately as the normalized list.
pub fn strip_citation_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '【' => depth += 1,
            '】' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::Role;

    #[test]
    fn line_buffer_handles_split_frames() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\":").is_empty());
        let lines = buf.push(b"1}\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
        assert_eq!(sse_data("data: x"), Some("x"));
        assert_eq!(sse_data("event: ping"), None);
    }

    #[test]
    fn history_trimming_drops_oldest_first() {
        let turn = |i: usize| HistoryTurn {
            role: if i % 2 == 0 { Role::User } else { Role::Assistant },
            content: format!("{i}:").repeat(4000),
        };
        let history: Vec<_> = (0..10).map(turn).collect();
        let trimmed = trim_history(&history);
        assert!(trimmed.len() < history.len());
        // The tail survives.
        assert_eq!(trimmed.last().unwrap().content, history.last().unwrap().content);
        let total: usize = trimmed.iter().map(|t| t.content.len()).sum();
        assert!(total <= HISTORY_CHAR_CEILING);
    }

    #[test]
    fn short_history_is_untouched() {
        let history = vec![HistoryTurn { role: Role::User, content: "hi".to_string() }];
        assert_eq!(trim_history(&history).len(), 1);
    }

    #[test]
    fn citation_markers_are_stripped() {
        assert_eq!(
            strip_citation_markers("Result【4:0†report.pdf】 is 42【4:1†x】."),
            "Result is 42."
        );
        assert_eq!(strip_citation_markers("no markers"), "no markers");
    }
}
