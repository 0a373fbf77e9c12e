// ── Airborne Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── API key format ─────────────────────────────────────────────────────────
// Plaintext keys look like `ab.KEYID.SECRET`. The prefix is a stable wire
// identifier — changing it invalidates every key in circulation.
pub const API_KEY_PREFIX: &str = "ab";

/// Entropy of the secret portion of an API key, in bytes (256 bits).
pub const API_KEY_SECRET_BYTES: usize = 32;

// ── Key-value store key layouts ────────────────────────────────────────────
// Treat these as stable identifiers: counters and records written under one
// layout become unreachable if the prefix changes.
pub const KV_KEY_RECORD_PREFIX: &str = "apikey:record:";
pub const KV_KEY_LOOKUP_PREFIX: &str = "apikey:lookup:";
pub const KV_RPM_PREFIX: &str = "ratelimit:rpm:";
pub const KV_TPM_PREFIX: &str = "ratelimit:tpm:";
pub const KV_IDEMPOTENCY_PREFIX: &str = "chat:idem:";

// ── Rate limiting ──────────────────────────────────────────────────────────
/// Tumbling window length. The expiration is set by the same atomic script
/// that creates the counter, so a counter can never exist without a TTL.
pub const RATE_WINDOW_SECS: u64 = 60;

// ── Idempotency ────────────────────────────────────────────────────────────
/// How long a (tenant, thread, request_id) replay key lives.
pub const IDEMPOTENCY_TTL_SECS: u64 = 600;

// ── Request size bounds ────────────────────────────────────────────────────
pub const MAX_USER_INPUT_BYTES: usize = 100 * 1024;
pub const MAX_INSTRUCTIONS_BYTES: usize = 50 * 1024;
pub const MAX_HISTORY_ENTRIES: usize = 100;
pub const MAX_METADATA_ENTRIES: usize = 100;

// ── Adapter message assembly ───────────────────────────────────────────────
/// Character ceiling for assembled history. When exceeded, the oldest turns
/// are dropped first; chronological order of the remainder is preserved.
pub const HISTORY_CHAR_CEILING: usize = 50 * 1024;

// ── Debug payload capture ──────────────────────────────────────────────────
/// Cap on captured upstream request/response bytes, each direction.
pub const DEBUG_CAPTURE_MAX_BYTES: usize = 1024 * 1024;

// ── Persistence ────────────────────────────────────────────────────────────
/// Deadline for the detached persistence task. Persistence runs on its own
/// context so a client disconnect after the upstream call completes cannot
/// lose the conversation record.
pub const PERSIST_TIMEOUT_SECS: u64 = 10;

// ── Retry discipline ───────────────────────────────────────────────────────
/// Maximum attempts per upstream call (1 initial + 2 retries = 3 total).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base backoff between attempts; doubles each retry, jittered ±25%.
pub const RETRY_BASE_MS: u64 = 250;

/// Backoff cap.
pub const RETRY_MAX_MS: u64 = 10_000;

/// Default per-attempt timeout when the caller carries no deadline.
pub const ATTEMPT_TIMEOUT_SECS: u64 = 120;

/// Minimum useful per-attempt time. The retry loop exits early when the
/// caller's remaining deadline drops below this floor.
pub const ATTEMPT_FLOOR_MS: u64 = 500;

// ── RAG injection sentinels ────────────────────────────────────────────────
// Retrieved snippets are injected into the system prompt between these tags.
// Snippet text and source names are XML-escaped so corpus content cannot
// close the block early.
pub const RAG_BLOCK_OPEN: &str = "<RETRIEVED_CONTEXT>";
pub const RAG_BLOCK_CLOSE: &str = "</RETRIEVED_CONTEXT>";
