// ── Airborne Auth: Key Store ───────────────────────────────────────────────
// API-key records with a two-hash design:
//
//   lookup_hash   — HMAC-SHA256 of the plaintext under a fixed
//                   domain-separation key. Deterministic, so it serves as a
//                   secondary index: validate() finds the candidate record
//                   in O(1) instead of scanning every record.
//   verifier_hash — argon2id PHC string. Salted and slow; the only thing
//                   the plaintext is ever checked against.
//
// The plaintext `ab.KEYID.SECRET` is emitted exactly once, at creation.
// It is never persisted and never compared with `==` anywhere in the
// validation path.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{info, warn};
use sha2::Sha256;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::atoms::constants::{
    API_KEY_PREFIX, API_KEY_SECRET_BYTES, KV_KEY_LOOKUP_PREFIX, KV_KEY_RECORD_PREFIX,
};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::traits::KvStore;
use crate::atoms::types::{ApiKeyInfo, ApiKeyRecord, Permission, Principal, RateLimits};

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation key for the lookup digest. Not a secret: the digest
/// only needs to be deterministic and collision-resistant, the verifier
/// hash carries the actual security.
const LOOKUP_HMAC_KEY: &[u8] = b"airborne-key-lookup-v1";

/// Parameters for `KeyStore::create`.
#[derive(Debug, Clone)]
pub struct CreateKeyParams {
    pub client_name: String,
    pub permissions: BTreeSet<Permission>,
    pub rate_limits: RateLimits,
    pub default_tenant: Option<String>,
}

pub struct KeyStore {
    kv: Arc<dyn KvStore>,
}

impl KeyStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        KeyStore { kv }
    }

    /// Deterministic keyed digest of the plaintext, hex-encoded.
    fn lookup_hash(plaintext: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(LOOKUP_HMAC_KEY).expect("HMAC accepts any key length");
        mac.update(plaintext.as_bytes());
        let digest = mac.finalize().into_bytes();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn record_key(key_id: &str) -> String {
        format!("{KV_KEY_RECORD_PREFIX}{key_id}")
    }

    fn lookup_key(hash: &str) -> String {
        format!("{KV_KEY_LOOKUP_PREFIX}{hash}")
    }

    /// Create a new key. Returns the record and the plaintext — the only
    /// time the plaintext ever exists outside the caller's hands.
    pub async fn create(
        &self,
        params: CreateKeyParams,
    ) -> GatewayResult<(ApiKeyRecord, Zeroizing<String>)> {
        let key_id = uuid::Uuid::new_v4().simple().to_string();

        let mut secret_bytes = Zeroizing::new([0u8; API_KEY_SECRET_BYTES]);
        getrandom::getrandom(secret_bytes.as_mut_slice())
            .map_err(|e| GatewayError::internal(format!("entropy source failed: {e}")))?;
        let secret = Zeroizing::new(
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret_bytes.as_ref()),
        );
        let plaintext = Zeroizing::new(format!("{API_KEY_PREFIX}.{key_id}.{}", secret.as_str()));

        let lookup = Self::lookup_hash(&plaintext);
        let salt = SaltString::generate(&mut rand_core::OsRng);
        let verifier = Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| GatewayError::internal(format!("argon2 hashing failed: {e}")))?
            .to_string();

        let record = ApiKeyRecord {
            key_id: key_id.clone(),
            lookup_hash: lookup.clone(),
            verifier_hash: verifier,
            principal: Principal {
                client_id: key_id.clone(),
                client_name: params.client_name,
                permissions: params.permissions,
                rate_limits: params.rate_limits,
                default_tenant: params.default_tenant,
                created_at: Utc::now(),
            },
        };

        self.kv
            .hset_all(&Self::record_key(&key_id), &record_to_fields(&record)?)
            .await?;
        let mut index = HashMap::new();
        index.insert("key_id".to_string(), key_id.clone());
        self.kv.hset_all(&Self::lookup_key(&lookup), &index).await?;

        info!("[auth] Created API key {key_id} for {}", record.principal.client_name);
        Ok((record, plaintext))
    }

    /// Resolve a plaintext to its record: O(1) index lookup, then a slow
    /// salted verification. No direct comparison of secrets.
    pub async fn validate(&self, plaintext: &str) -> GatewayResult<Principal> {
        let lookup = Self::lookup_hash(plaintext);
        let index = self
            .kv
            .hget_all(&Self::lookup_key(&lookup))
            .await?
            .ok_or_else(|| GatewayError::Unauthenticated("unknown API key".to_string()))?;
        let key_id = index
            .get("key_id")
            .ok_or_else(|| GatewayError::internal("lookup index missing key_id"))?;

        let fields = self
            .kv
            .hget_all(&Self::record_key(key_id))
            .await?
            .ok_or_else(|| GatewayError::Unauthenticated("unknown API key".to_string()))?;
        let record = record_from_fields(&fields)?;

        let parsed = PasswordHash::new(&record.verifier_hash)
            .map_err(|e| GatewayError::internal(format!("stored verifier unreadable: {e}")))?;
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .map_err(|_| {
                warn!("[auth] Verifier mismatch for key {}", record.key_id);
                GatewayError::Unauthenticated("invalid API key".to_string())
            })?;

        Ok(record.principal)
    }

    /// All records, without any hash bytes.
    pub async fn list(&self) -> GatewayResult<Vec<ApiKeyInfo>> {
        let keys = self.kv.scan(&format!("{KV_KEY_RECORD_PREFIX}*")).await?;
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(fields) = self.kv.hget_all(&k).await? {
                out.push(ApiKeyInfo::from(&record_from_fields(&fields)?));
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Delete the record and its lookup-index entry.
    pub async fn revoke(&self, key_id: &str) -> GatewayResult<()> {
        let fields = self
            .kv
            .hget_all(&Self::record_key(key_id))
            .await?
            .ok_or_else(|| GatewayError::invalid(format!("unknown key {key_id}")))?;
        let record = record_from_fields(&fields)?;
        self.kv.del(&Self::lookup_key(&record.lookup_hash)).await?;
        self.kv.del(&Self::record_key(key_id)).await?;
        info!("[auth] Revoked API key {key_id}");
        Ok(())
    }
}

// ── Record (de)serialization ───────────────────────────────────────────────
// Records live as KV hashes: scalar fields flat, principal as JSON.

fn record_to_fields(r: &ApiKeyRecord) -> GatewayResult<HashMap<String, String>> {
    let mut f = HashMap::new();
    f.insert("key_id".to_string(), r.key_id.clone());
    f.insert("lookup_hash".to_string(), r.lookup_hash.clone());
    f.insert("verifier_hash".to_string(), r.verifier_hash.clone());
    f.insert("principal".to_string(), serde_json::to_string(&r.principal)?);
    Ok(f)
}

fn record_from_fields(f: &HashMap<String, String>) -> GatewayResult<ApiKeyRecord> {
    let get = |k: &str| {
        f.get(k)
            .cloned()
            .ok_or_else(|| GatewayError::internal(format!("key record missing field {k}")))
    };
    Ok(ApiKeyRecord {
        key_id: get("key_id")?,
        lookup_hash: get("lookup_hash")?,
        verifier_hash: get("verifier_hash")?,
        principal: serde_json::from_str(&get("principal")?)?,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
