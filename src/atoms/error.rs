// ── Airborne Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the gateway, built with `thiserror`.
//
// Design rules:
//   • Variants mirror the client-visible status taxonomy one-to-one, plus
//     `#[from]` variants for std/external failures that always sanitize to
//     an internal error at the egress boundary.
//   • No variant carries secret material (API keys, upstream URLs with
//     credentials) in its message.
//   • `client_message()` is the only string that may leave the process;
//     logs carry full detail.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or invalid credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The principal lacks a required permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// RPM or TPM limit hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Size limits, malformed identifiers, unknown tenant, unsafe base_url.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No enabled provider for the tenant, or provider credentials rejected.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Caller deadline exhausted mid-flight.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Caller cancellation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Exhausted retryable attempts against an upstream provider.
    #[error("upstream unavailable: {provider}: {message}")]
    Unavailable { provider: String, message: String },

    /// Unexpected or programming errors. Sanitized before egress.
    #[error("internal: {0}")]
    Internal(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer) not already classified by an
    /// adapter. Adapters classify upstream failures themselves; this covers
    /// the markdown sidecar and similar collaborators.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite failure in the conversation repository.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Shared key-value store failure.
    #[error("kv store error: {0}")]
    Kv(#[from] redis::RedisError),
}

// ── Status mapping ─────────────────────────────────────────────────────────

impl GatewayError {
    /// HTTP status for the RPC surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthenticated(_) => 401,
            Self::PermissionDenied(_) => 403,
            Self::ResourceExhausted(_) => 429,
            Self::InvalidArgument(_) => 400,
            Self::FailedPrecondition(_) => 412,
            Self::DeadlineExceeded(_) => 504,
            Self::Cancelled(_) => 499,
            Self::Unavailable { .. } => 503,
            Self::Internal(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Network(_)
            | Self::Database(_)
            | Self::Kv(_) => 500,
        }
    }

    /// Machine-readable kind string, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Cancelled(_) => "cancelled",
            Self::Unavailable { .. } => "unavailable",
            _ => "internal",
        }
    }

    /// The message that may leave the process. Internal variants collapse to
    /// a generic string; the full detail stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Network(_)
            | Self::Database(_)
            | Self::Kv(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// True when a retry at the orchestration level could succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

// ── Convenience constructors ───────────────────────────────────────────────

impl GatewayError {
    pub fn unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable { provider: provider.into(), message: message.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All gateway operations return this type.
pub type GatewayResult<T> = Result<T, GatewayError>;

// ── Tests ──────────────────────────────────────────────────────────────────
