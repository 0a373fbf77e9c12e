// ── Airborne Auth: Rate Limiter ────────────────────────────────────────────
// Per-client RPM and TPM counters on the shared key-value store.
//
// Both checks are one atomic increment-and-expire round trip; the script
// sets the 60-second expiration in the same operation that creates the
// counter, so the tumbling window is keyed from the first increment and a
// counter can never exist without a TTL.
//
// Admission rule: post-increment value <= limit. A zero or negative limit
// means unlimited. Counters are never rolled back — a request admitted and
// then cancelled mid-call stays counted.

use log::debug;
use std::sync::Arc;

use crate::atoms::constants::{KV_RPM_PREFIX, KV_TPM_PREFIX, RATE_WINDOW_SECS};
use crate::atoms::error::GatewayResult;
use crate::atoms::traits::KvStore;

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        RateLimiter { kv }
    }

    /// Charge one request against the client's RPM budget. Charged at
    /// admission, regardless of what the upstream later does.
    pub async fn check_and_increment_rpm(
        &self,
        client_id: &str,
        limit: i64,
    ) -> GatewayResult<bool> {
        if limit <= 0 {
            return Ok(true);
        }
        let key = format!("{KV_RPM_PREFIX}{client_id}");
        let value = self.kv.incr_with_ttl(&key, 1, RATE_WINDOW_SECS).await?;
        let allowed = value <= limit;
        if !allowed {
            debug!("[auth] RPM limit hit for {client_id}: {value}/{limit}");
        }
        Ok(allowed)
    }

    /// Charge token usage against the client's TPM budget. Token counts are
    /// known only after a call completes, so this runs at the terminal
    /// chunk — a stream cancelled before `complete` is never charged.
    pub async fn record_tokens(
        &self,
        client_id: &str,
        tokens: u64,
        limit: i64,
    ) -> GatewayResult<bool> {
        if limit <= 0 || tokens == 0 {
            return Ok(true);
        }
        let key = format!("{KV_TPM_PREFIX}{client_id}");
        let value = self
            .kv
            .incr_with_ttl(&key, tokens as i64, RATE_WINDOW_SECS)
            .await?;
        let allowed = value <= limit;
        if !allowed {
            debug!("[auth] TPM limit hit for {client_id}: {value}/{limit}");
        }
        Ok(allowed)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn admits_up_to_the_limit_and_no_further() {
        let limiter = RateLimiter::new(Arc::new(MemoryKv::new()));
        for i in 0..5 {
            assert!(
                limiter.check_and_increment_rpm("c1", 5).await.unwrap(),
                "request {i} should be admitted"
            );
        }
        assert!(!limiter.check_and_increment_rpm("c1", 5).await.unwrap());
    }

    #[tokio::test]
    async fn parallel_requests_admit_exactly_limit() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = Arc::new(RateLimiter::new(kv.clone()));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move {
                l.check_and_increment_rpm("c1", 7).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);

        // The counter carried a TTL from the moment it was created.
        assert!(kv.ttl_remaining("ratelimit:rpm:c1").is_some());
    }

    #[tokio::test]
    async fn zero_limit_means_unlimited() {
        let limiter = RateLimiter::new(Arc::new(MemoryKv::new()));
        for _ in 0..100 {
            assert!(limiter.check_and_increment_rpm("c1", 0).await.unwrap());
        }
        assert!(limiter.record_tokens("c1", 1_000_000, -1).await.unwrap());
    }

    #[tokio::test]
    async fn tokens_accumulate_within_the_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryKv::new()));
        assert!(limiter.record_tokens("c1", 4000, 10_000).await.unwrap());
        assert!(limiter.record_tokens("c1", 4000, 10_000).await.unwrap());
        assert!(!limiter.record_tokens("c1", 4000, 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn clients_are_isolated() {
        let limiter = RateLimiter::new(Arc::new(MemoryKv::new()));
        assert!(limiter.check_and_increment_rpm("c1", 1).await.unwrap());
        assert!(!limiter.check_and_increment_rpm("c1", 1).await.unwrap());
        assert!(limiter.check_and_increment_rpm("c2", 1).await.unwrap());
    }
}
