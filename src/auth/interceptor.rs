// ── Airborne Auth: Request Interceptor ─────────────────────────────────────
// Wraps every RPC. Skips a configurable allowlist of unauthenticated paths
// (the health endpoint), extracts the credential from request metadata,
// resolves the client principal, charges RPM, and attaches the principal to
// the request extensions for the handlers.
//
// Token precedence: `authorization: Bearer <tok>`, else the raw
// `authorization` value, else `x-api-key`.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{Permission, Principal, RateLimits};
use crate::auth::{KeyStore, RateLimiter};

/// Which credential backend the interceptor consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// API-key records in the shared key-value store.
    Redis,
    /// A single configured admin token, compared in constant time.
    Static,
}

pub struct AuthState {
    pub mode: AuthMode,
    pub keystore: Arc<KeyStore>,
    pub limiter: Arc<RateLimiter>,
    /// Required in static mode.
    pub admin_token: Option<Zeroizing<String>>,
    /// Grant the static principal the admin permission too.
    pub static_admin_full: bool,
    /// Fallback limits when the client record omits them (stored as 0).
    pub default_rpm: i64,
    pub default_tpm: i64,
    /// Paths served without authentication.
    pub allowlist: Vec<String>,
}

impl AuthState {
    /// Resolve the effective limits: a record value of 0 means "omitted",
    /// filled from the configured defaults. The limiter itself treats a
    /// final value <= 0 as unlimited.
    fn effective_limits(&self, record: RateLimits) -> RateLimits {
        RateLimits {
            rpm: if record.rpm != 0 { record.rpm } else { self.default_rpm },
            tpm: if record.tpm != 0 { record.tpm } else { self.default_tpm },
        }
    }

    fn static_principal(&self) -> Principal {
        let mut permissions: BTreeSet<Permission> =
            [Permission::Chat, Permission::ChatStream, Permission::Files]
                .into_iter()
                .collect();
        if self.static_admin_full {
            permissions.insert(Permission::Admin);
        }
        Principal {
            client_id: "static-admin".to_string(),
            client_name: "static admin".to_string(),
            permissions,
            rate_limits: RateLimits { rpm: self.default_rpm, tpm: self.default_tpm },
            default_tenant: None,
            created_at: Utc::now(),
        }
    }
}

/// Pull the credential out of request metadata, honoring the precedence
/// order.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let auth = auth.trim();
        if let Some(rest) = strip_bearer(auth) {
            return Some(rest.to_string());
        }
        if !auth.is_empty() {
            return Some(auth.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn strip_bearer(value: &str) -> Option<&str> {
    let (scheme, rest) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(rest.trim())
    } else {
        None
    }
}

/// Resolve a presented token to a principal with effective limits.
pub async fn authenticate(state: &AuthState, token: &str) -> GatewayResult<Principal> {
    match state.mode {
        AuthMode::Static => {
            let expected = state.admin_token.as_ref().ok_or_else(|| {
                GatewayError::internal("static auth mode without admin token")
            })?;
            if expected.as_bytes().ct_eq(token.as_bytes()).into() {
                Ok(state.static_principal())
            } else {
                Err(GatewayError::Unauthenticated("invalid token".to_string()))
            }
        }
        AuthMode::Redis => {
            let mut principal = state.keystore.validate(token).await?;
            principal.rate_limits = state.effective_limits(principal.rate_limits);
            Ok(principal)
        }
    }
}

/// The axum middleware. Layered over every route; allowlisted paths pass
/// straight through.
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = req.uri().path().to_string();
    if state.allowlist.iter().any(|p| p == &path) {
        return Ok(next.run(req).await);
    }

    let token = extract_token(req.headers())
        .ok_or_else(|| GatewayError::Unauthenticated("missing credentials".to_string()))?;

    let principal = authenticate(&state, &token).await.map_err(|e| {
        debug!("[auth] {} rejected: {e}", path);
        e
    })?;

    let admitted = state
        .limiter
        .check_and_increment_rpm(&principal.client_id, principal.rate_limits.rpm)
        .await?;
    if !admitted {
        warn!(
            "[auth] RPM limit reached for {} ({})",
            principal.client_name, principal.client_id
        );
        return Err(GatewayError::ResourceExhausted(format!(
            "request rate limit of {} per minute reached",
            principal.rate_limits.rpm
        )));
    }

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn token_extraction_precedence() {
        assert_eq!(
            extract_token(&headers(&[("authorization", "Bearer tok1")])),
            Some("tok1".to_string())
        );
        assert_eq!(
            extract_token(&headers(&[("authorization", "bearer tok1")])),
            Some("tok1".to_string())
        );
        assert_eq!(
            extract_token(&headers(&[("authorization", "rawtok")])),
            Some("rawtok".to_string())
        );
        assert_eq!(
            extract_token(&headers(&[("x-api-key", "xtok")])),
            Some("xtok".to_string())
        );
        // authorization wins over x-api-key
        assert_eq!(
            extract_token(&headers(&[("authorization", "Bearer a"), ("x-api-key", "b")])),
            Some("a".to_string())
        );
        assert_eq!(extract_token(&headers(&[])), None);
    }

    fn static_state(token: &str, full: bool) -> AuthState {
        let kv = Arc::new(MemoryKv::new());
        AuthState {
            mode: AuthMode::Static,
            keystore: Arc::new(KeyStore::new(kv.clone())),
            limiter: Arc::new(RateLimiter::new(kv)),
            admin_token: Some(Zeroizing::new(token.to_string())),
            static_admin_full: full,
            default_rpm: 60,
            default_tpm: 100_000,
            allowlist: vec!["/health".to_string()],
        }
    }

    #[tokio::test]
    async fn static_mode_accepts_exact_token_only() {
        let state = static_state("s3cret", false);
        let p = authenticate(&state, "s3cret").await.unwrap();
        assert_eq!(p.client_id, "static-admin");
        assert!(p.has(Permission::Chat));
        assert!(!p.has(Permission::Admin));

        assert_eq!(authenticate(&state, "wrong").await.unwrap_err().kind(), "unauthenticated");
        assert_eq!(authenticate(&state, "s3cret2").await.unwrap_err().kind(), "unauthenticated");
    }

    #[tokio::test]
    async fn static_mode_can_grant_admin() {
        let state = static_state("t", true);
        assert!(authenticate(&state, "t").await.unwrap().has(Permission::Admin));
    }

    #[tokio::test]
    async fn redis_mode_applies_default_limits_when_record_omits_them() {
        let kv = Arc::new(MemoryKv::new());
        let keystore = Arc::new(KeyStore::new(kv.clone()));
        let (_, plaintext) = keystore
            .create(crate::auth::keystore::CreateKeyParams {
                client_name: "c".to_string(),
                permissions: [Permission::Chat].into_iter().collect(),
                rate_limits: RateLimits { rpm: 0, tpm: 0 },
                default_tenant: None,
            })
            .await
            .unwrap();

        let state = AuthState {
            mode: AuthMode::Redis,
            keystore,
            limiter: Arc::new(RateLimiter::new(kv)),
            admin_token: None,
            static_admin_full: false,
            default_rpm: 42,
            default_tpm: 9000,
            allowlist: vec![],
        };
        let p = authenticate(&state, &plaintext).await.unwrap();
        assert_eq!(p.rate_limits.rpm, 42);
        assert_eq!(p.rate_limits.tpm, 9000);
    }
}
