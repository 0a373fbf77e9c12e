// ── Airborne Engine: HTTP Retry, Circuit Breaker & Debug Capture ───────────
//
// Shared utilities used by every provider adapter.
//
// Features:
//   • Exponential backoff with ±25% jitter (base 250 ms, max 10 s, 3
//     attempts), bounded by the caller's deadline
//   • Retry on 429 (rate limit), 500, 502, 503, 504, 529, transport
//     failures, per-attempt timeouts, and empty-text responses
//   • Respects `Retry-After` header
//   • Circuit breaker: 5 consecutive failures → fail fast for 60 s
//   • Shared reqwest::Client (one connection pool for all providers)
//   • Bounded capture of raw request/response bytes for debug persistence

use log::warn;
use reqwest::Client;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{Duration, Instant, SystemTime};

use crate::atoms::constants::{
    ATTEMPT_FLOOR_MS, ATTEMPT_TIMEOUT_SECS, DEBUG_CAPTURE_MAX_BYTES, MAX_ATTEMPTS, RETRY_BASE_MS,
    RETRY_MAX_MS,
};
use crate::atoms::error::GatewayError;
use crate::atoms::types::{truncate_utf8, DebugPayload};

// ── Upstream error classification ──────────────────────────────────────────

/// How an upstream attempt failed. Every adapter classifies its failures
/// into these classes; the retry loop only consults `is_retryable`.
#[derive(Debug)]
pub enum UpstreamError {
    /// Connection reset, TLS handshake, no-such-host, send failure.
    Transport(String),
    /// Per-attempt timeout, distinct from caller-context deadline.
    Timeout,
    /// Non-2xx API response other than auth/rate-limit.
    Api { status: u16, message: String },
    /// Upstream rejected the tenant's credentials. Never retried.
    Auth(String),
    /// Upstream 429.
    RateLimited { message: String, retry_after_secs: Option<u64> },
    /// 2xx with an empty text body. Retried — the upstreams do this.
    Empty,
    /// Caller deadline exhausted. Never retried.
    Deadline,
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport(_)
            | UpstreamError::Timeout
            | UpstreamError::Empty
            | UpstreamError::RateLimited { .. } => true,
            UpstreamError::Api { status, .. } => is_retryable_status(*status),
            UpstreamError::Auth(_) | UpstreamError::Deadline => false,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            UpstreamError::RateLimited { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }

    /// Surface as a gateway error once the retry loop is done with it.
    pub fn into_gateway(self, provider: &str) -> GatewayError {
        match self {
            UpstreamError::Deadline => {
                GatewayError::DeadlineExceeded("caller deadline exhausted".to_string())
            }
            UpstreamError::Auth(msg) => GatewayError::FailedPrecondition(format!(
                "provider {provider} rejected the configured credentials: {msg}"
            )),
            UpstreamError::Api { status, message } if !is_retryable_status(status) => {
                GatewayError::InvalidArgument(format!(
                    "provider {provider} rejected the request ({status}): {message}"
                ))
            }
            UpstreamError::Transport(msg) => GatewayError::unavailable(provider, msg),
            UpstreamError::Timeout => {
                GatewayError::unavailable(provider, "request timed out".to_string())
            }
            UpstreamError::Empty => {
                GatewayError::unavailable(provider, "empty response".to_string())
            }
            UpstreamError::RateLimited { message, .. } => {
                GatewayError::unavailable(provider, message)
            }
            UpstreamError::Api { status, message } => {
                GatewayError::unavailable(provider, format!("API error {status}: {message}"))
            }
        }
    }
}

/// Classify a reqwest failure into transport vs timeout.
pub fn classify_send_error(e: &reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Transport(format!("request failed: {e}"))
    }
}

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Sleep with exponential backoff + ±25% jitter.
/// Respects Retry-After if the server sent one.
/// Returns the actual delay duration for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let delay = Duration::from_millis(backoff_ms(attempt, retry_after_secs));
    tokio::time::sleep(delay).await;
    delay
}

/// The delay that `retry_delay` would sleep, without sleeping.
pub fn backoff_ms(attempt: u32, retry_after_secs: Option<u64>) -> u64 {
    let base_ms = RETRY_BASE_MS * 2u64.pow(attempt.min(8));
    let capped_ms = base_ms.min(RETRY_MAX_MS);
    let delay_ms = if let Some(secs) = retry_after_secs {
        // Use the server-specified delay, but cap at 60s and floor at our
        // computed backoff.
        (secs.min(60) * 1000).max(capped_ms)
    } else {
        capped_ms
    };
    apply_jitter(delay_ms)
}

/// Apply ±25% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(50);
    }
    let offset = (rand_jitter() % (2 * jitter_range + 1)) - jitter_range;
    let result = base_ms as i64 + offset;
    result.max(50) as u64
}

/// Simple jitter source using system clock nanos (no extra crate needed).
fn rand_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

// ── Retry-After header parsing ─────────────────────────────────────────────

/// Parse Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented — falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

/// Read the Retry-After header off a response.
pub fn response_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

// ── Attempt budget ─────────────────────────────────────────────────────────

/// Per-attempt timeout bounded by the caller's remaining deadline.
/// Returns None when the remaining budget is below the useful floor — the
/// retry loop exits with `UpstreamError::Deadline`.
pub fn attempt_timeout(deadline: Option<Instant>) -> Option<Duration> {
    let default = Duration::from_secs(ATTEMPT_TIMEOUT_SECS);
    match deadline {
        None => Some(default),
        Some(d) => {
            let remaining = d.saturating_duration_since(Instant::now());
            if remaining < Duration::from_millis(ATTEMPT_FLOOR_MS) {
                None
            } else {
                Some(default.min(remaining))
            }
        }
    }
}

/// Whether another attempt may run.
pub fn may_retry(attempt: u32, err: &UpstreamError) -> bool {
    attempt + 1 < MAX_ATTEMPTS && err.is_retryable()
}

// ── Circuit breaker ────────────────────────────────────────────────────────

/// Trips after N consecutive failures, then rejects requests for a cooldown
/// period before allowing a probe through.
///
/// States:
///   Closed   — normal operation, requests pass through
///   Open     — rejecting requests (cooldown active)
///   HalfOpen — cooldown expired, one probe request allowed
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    /// Epoch seconds when the circuit tripped open.
    tripped_at: AtomicU64,
    threshold: u32,
    cooldown_secs: u64,
}

impl CircuitBreaker {
    pub const fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            tripped_at: AtomicU64::new(0),
            threshold,
            cooldown_secs,
        }
    }

    /// Returns `Err(message)` while the circuit is open.
    pub fn check(&self) -> Result<(), String> {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.threshold {
            return Ok(());
        }
        let tripped = self.tripped_at.load(Ordering::Relaxed);
        let now = epoch_secs();
        if now.saturating_sub(tripped) < self.cooldown_secs {
            Err(format!(
                "circuit open after {failures} consecutive failures, cooling down {}s",
                self.cooldown_secs.saturating_sub(now - tripped)
            ))
        } else {
            Ok(())
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.tripped_at.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let prev = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if prev + 1 >= self.threshold {
            self.tripped_at.store(epoch_secs(), Ordering::Relaxed);
            warn!(
                "[engine] Circuit tripped after {} consecutive failures — cooling down {}s",
                prev + 1,
                self.cooldown_secs
            );
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Shared HTTP client ─────────────────────────────────────────────────────

/// One client, one connection pool, for every provider. Per-attempt
/// timeouts are applied by the adapters, so the client itself carries only
/// a connect timeout.
static SHARED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
});

pub fn shared_client() -> Client {
    SHARED_CLIENT.clone()
}

// ── Debug capture ──────────────────────────────────────────────────────────

/// Bounded capture of the raw bytes an adapter exchanged with its upstream.
/// The full payload always reaches the SDK/parser unchanged; only the
/// captured prefix is bounded.
#[derive(Default)]
pub struct DebugCapture {
    request: Vec<u8>,
    response: Vec<u8>,
}

impl DebugCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_request(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(DEBUG_CAPTURE_MAX_BYTES);
        self.request = bytes[..take].to_vec();
    }

    pub fn push_response(&mut self, bytes: &[u8]) {
        let room = DEBUG_CAPTURE_MAX_BYTES.saturating_sub(self.response.len());
        let take = bytes.len().min(room);
        self.response.extend_from_slice(&bytes[..take]);
    }

    pub fn into_payload(self) -> DebugPayload {
        DebugPayload { request: self.request, response: self.response }
    }
}

/// Trim an upstream error body for logs and error messages.
pub fn clip(body: &str, max: usize) -> &str {
    truncate_utf8(body, max)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));
        assert!(is_retryable_status(529));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn error_classes_retry_as_specified() {
        assert!(UpstreamError::Transport("reset".into()).is_retryable());
        assert!(UpstreamError::Timeout.is_retryable());
        assert!(UpstreamError::Empty.is_retryable());
        assert!(UpstreamError::RateLimited { message: String::new(), retry_after_secs: None }
            .is_retryable());
        assert!(UpstreamError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(!UpstreamError::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!UpstreamError::Auth("nope".into()).is_retryable());
        assert!(!UpstreamError::Deadline.is_retryable());
    }

    #[test]
    fn gateway_mapping() {
        let e = UpstreamError::Api { status: 400, message: "bad field".into() };
        assert_eq!(e.into_gateway("openai").kind(), "invalid_argument");

        let e = UpstreamError::Api { status: 503, message: "overloaded".into() };
        assert_eq!(e.into_gateway("openai").kind(), "unavailable");

        let e = UpstreamError::Auth("401".into());
        assert_eq!(e.into_gateway("openai").kind(), "failed_precondition");

        let e = UpstreamError::Deadline;
        assert_eq!(e.into_gateway("openai").kind(), "deadline_exceeded");
    }

    #[test]
    fn parse_retry_after_valid() {
        assert_eq!(parse_retry_after("5"), Some(5));
        assert_eq!(parse_retry_after(" 30 "), Some(30));
        assert_eq!(parse_retry_after("not-a-number"), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        for base in [100, 1000, 5000, 10_000] {
            let result = apply_jitter(base);
            let lower = (base as f64 * 0.7) as u64;
            let upper = (base as f64 * 1.3) as u64;
            assert!(
                result >= lower.max(50) && result <= upper,
                "jitter({base}) = {result} not in [{lower}, {upper}]"
            );
        }
    }

    #[test]
    fn backoff_grows_and_respects_retry_after() {
        let first = backoff_ms(0, None);
        assert!((187..=320).contains(&first), "base backoff ≈250ms, got {first}");
        let second = backoff_ms(1, None);
        assert!(second > first / 2, "backoff should roughly double");
        // Server-requested delay floors the backoff.
        assert!(backoff_ms(0, Some(2)) >= 1500);
    }

    #[test]
    fn attempt_timeout_respects_deadline() {
        assert_eq!(attempt_timeout(None), Some(Duration::from_secs(ATTEMPT_TIMEOUT_SECS)));

        let soon = Instant::now() + Duration::from_secs(3);
        let t = attempt_timeout(Some(soon)).unwrap();
        assert!(t <= Duration::from_secs(3));

        let expired = Instant::now() - Duration::from_secs(1);
        assert_eq!(attempt_timeout(Some(expired)), None);
    }

    #[test]
    fn may_retry_counts_attempts() {
        let retryable = UpstreamError::Timeout;
        assert!(may_retry(0, &retryable));
        assert!(may_retry(1, &retryable));
        assert!(!may_retry(2, &retryable));
        assert!(!may_retry(0, &UpstreamError::Auth("x".into())));
    }

    #[test]
    fn circuit_breaker_trips_and_recovers() {
        let cb = CircuitBreaker::new(3, 60);
        assert!(cb.check().is_ok());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check().is_ok());
        cb.record_failure();
        assert!(cb.check().is_err());
        cb.record_success();
        assert!(cb.check().is_ok());
    }

    #[test]
    fn debug_capture_caps_both_directions() {
        let mut cap = DebugCapture::new();
        cap.set_request(&vec![1u8; 2 * 1024 * 1024]);
        cap.push_response(&vec![2u8; 800 * 1024]);
        cap.push_response(&vec![3u8; 800 * 1024]);
        let payload = cap.into_payload();
        assert_eq!(payload.request.len(), 1024 * 1024);
        assert_eq!(payload.response.len(), 1024 * 1024);
    }
}
