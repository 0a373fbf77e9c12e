// ── Airborne Tenant Layer ──────────────────────────────────────────────────
// Tenant records are loaded once at startup and treated immutable for the
// lifetime of the process. `resolve` merges a tenant's baseline provider
// config with per-request overrides under strict permission gates.

pub mod urlcheck;

use log::info;
use std::collections::HashMap;
use std::path::Path;

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    GenerateRequest, Principal, Permission, ProviderConfig, ProviderKind, ProviderOverride,
    TenantRecord,
};
use crate::store::repository::valid_tenant_slug;

// ── Registry ───────────────────────────────────────────────────────────────

/// The startup-loaded set of tenants. The tenant whitelist is derived from
/// this set; reloads require a restart.
pub struct TenantRegistry {
    tenants: HashMap<String, TenantRecord>,
}

impl TenantRegistry {
    pub fn new(records: Vec<TenantRecord>) -> GatewayResult<Self> {
        let mut tenants = HashMap::with_capacity(records.len());
        for r in records {
            if !valid_tenant_slug(&r.tenant_id) {
                return Err(GatewayError::invalid(format!(
                    "tenant id {:?} is not a valid slug",
                    r.tenant_id
                )));
            }
            if tenants.insert(r.tenant_id.clone(), r).is_some() {
                return Err(GatewayError::invalid("duplicate tenant id".to_string()));
            }
        }
        Ok(TenantRegistry { tenants })
    }

    /// Load every `*.toml` in a directory; the file stem is ignored, the
    /// `tenant_id` field inside the file is authoritative.
    pub fn load_dir(dir: &Path) -> GatewayResult<Self> {
        Self::new(Self::read_dir_records(dir)?)
    }

    /// Raw records from a directory, for callers that merge sources.
    pub fn read_dir_records(dir: &Path) -> GatewayResult<Vec<TenantRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let record: TenantRecord = toml::from_str(&raw)
                .map_err(|e| GatewayError::invalid(format!("tenant file {path:?}: {e}")))?;
            records.push(record);
        }
        info!("[tenant] Loaded {} tenant(s) from {dir:?}", records.len());
        Ok(records)
    }

    pub fn get(&self, tenant_id: &str) -> Option<&TenantRecord> {
        self.tenants.get(tenant_id)
    }

    pub fn whitelist(&self) -> Vec<String> {
        self.tenants.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

// ── Resolution ─────────────────────────────────────────────────────────────

/// Which provider `resolve` would pick, without invoking anything.
pub fn select_provider<'a>(
    tenant: &'a TenantRecord,
    preferred: Option<&str>,
) -> GatewayResult<&'a str> {
    if let Some(name) = preferred {
        let (key, cfg) = tenant.providers.get_key_value(name).ok_or_else(|| {
            GatewayError::FailedPrecondition(format!(
                "provider {name} is not configured for tenant {}",
                tenant.tenant_id
            ))
        })?;
        if !cfg.enabled {
            return Err(GatewayError::FailedPrecondition(format!(
                "provider {name} is disabled for tenant {}",
                tenant.tenant_id
            )));
        }
        return Ok(key.as_str());
    }
    let default = tenant.default_provider.as_deref().ok_or_else(|| {
        GatewayError::FailedPrecondition(format!(
            "tenant {} declares no default provider",
            tenant.tenant_id
        ))
    })?;
    match tenant.providers.get(default) {
        Some(cfg) if cfg.enabled => Ok(default),
        _ => Err(GatewayError::FailedPrecondition(format!(
            "default provider {default} is not enabled for tenant {}",
            tenant.tenant_id
        ))),
    }
}

/// Produce the effective provider config for one request.
///
/// Model, api-key, and extra options may be overridden by any authenticated
/// client. `base_url` requires the admin permission and the URL safety
/// check — checked in that order, so a non-admin is refused before the URL
/// is even inspected.
pub async fn resolve(
    registry: &TenantRegistry,
    tenant_id: &str,
    request: &GenerateRequest,
    principal: &Principal,
) -> GatewayResult<ProviderConfig> {
    let tenant = registry
        .get(tenant_id)
        .ok_or_else(|| GatewayError::invalid(format!("unknown tenant {tenant_id:?}")))?;

    let provider_name = select_provider(tenant, request.preferred_provider.as_deref())?;
    let base = tenant
        .providers
        .get(provider_name)
        .expect("selected provider present");

    let kind = ProviderKind::from_name(provider_name).ok_or_else(|| {
        GatewayError::invalid(format!("unknown provider name {provider_name:?}"))
    })?;

    let empty = ProviderOverride::default();
    let overrides = request.provider_configs.get(provider_name).unwrap_or(&empty);

    let base_url = match &overrides.base_url {
        Some(url) if !url.is_empty() => {
            if !principal.has(Permission::Admin) {
                return Err(GatewayError::PermissionDenied(
                    "base_url override requires the admin permission".to_string(),
                ));
            }
            urlcheck::check_base_url(url).await?;
            Some(url.clone())
        }
        _ => base.base_url.clone(),
    };

    let mut options = base.options.clone();
    for (k, v) in &overrides.options {
        options.insert(k.clone(), v.clone());
    }

    let config = ProviderConfig {
        kind,
        provider: provider_name.to_string(),
        api_key: overrides.api_key.clone().unwrap_or_else(|| base.api_key.clone()),
        model: overrides.model.clone().unwrap_or_else(|| base.model.clone()),
        base_url,
        options,
    };

    if config.api_key.is_empty() {
        return Err(GatewayError::FailedPrecondition(format!(
            "provider {provider_name} has no API key configured"
        )));
    }
    if config.model.is_empty() {
        return Err(GatewayError::FailedPrecondition(format!(
            "provider {provider_name} has no model configured"
        )));
    }
    Ok(config)
}

// ── Tests ──────────────────────────────────────────────────────────────────
