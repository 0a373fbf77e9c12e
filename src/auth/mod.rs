// ── Airborne Auth Layer ────────────────────────────────────────────────────
// API-key persistence and validation, per-client quota enforcement, and the
// request interceptor that wraps every RPC.

pub mod interceptor;
pub mod keystore;
pub mod ratelimit;

pub use interceptor::{auth_middleware, AuthState};
pub use keystore::KeyStore;
pub use ratelimit::RateLimiter;
