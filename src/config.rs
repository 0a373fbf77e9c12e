// ── Airborne Configuration ─────────────────────────────────────────────────
// Process-wide config, loaded once at startup from TOML. Every section
// carries `deny_unknown_fields`: an unrecognized key fails startup instead
// of being silently ignored.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::TenantRecord;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub tenants: TenantsConfig,
    #[serde(default)]
    pub markdown: MarkdownConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { host: default_host(), port: default_port() }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8780
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig { addr: None, password: None, db: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite path for the conversation store.
    #[serde(default = "default_db_url")]
    pub url: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig { url: default_db_url() }
    }
}

fn default_db_url() -> PathBuf {
    PathBuf::from("airborne.db")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthModeConfig {
    Redis,
    Static,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_auth_mode")]
    pub mode: AuthModeConfig,
    /// Required in static mode.
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Grant the static principal the admin permission too.
    #[serde(default)]
    pub static_admin_full: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig { mode: default_auth_mode(), admin_token: None, static_admin_full: false }
    }
}

fn default_auth_mode() -> AuthModeConfig {
    AuthModeConfig::Redis
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RateLimitsConfig {
    /// Fallback when a client record omits its RPM. 0 means unlimited.
    #[serde(default)]
    pub default_rpm: i64,
    #[serde(default)]
    pub default_tpm: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: default_log_level(), format: default_log_format() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "plain".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TenantsConfig {
    /// Directory of per-tenant TOML files.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Inline tenant records, keyed by tenant id.
    #[serde(default)]
    pub inline: HashMap<String, InlineTenant>,
}

/// An inline tenant entry; the map key supplies the tenant id.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineTenant {
    pub name: String,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, crate::atoms::types::TenantProviderConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MarkdownConfig {
    /// Render sidecar endpoint; absent means plain-text passthrough.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_markdown_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_markdown_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    /// Persist raw upstream payloads alongside assistant messages.
    /// Off by default; payloads are sensitive.
    #[serde(default)]
    pub capture_payloads: bool,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> GatewayResult<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| GatewayError::invalid(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(GatewayError::invalid(
                "tls.enabled requires both tls.cert_file and tls.key_file".to_string(),
            ));
        }
        if self.auth.mode == AuthModeConfig::Static
            && self.auth.admin_token.as_deref().unwrap_or("").is_empty()
        {
            return Err(GatewayError::invalid(
                "auth.mode = \"static\" requires auth.admin_token".to_string(),
            ));
        }
        if self.auth.mode == AuthModeConfig::Redis && self.redis.addr.is_none() {
            return Err(GatewayError::invalid(
                "auth.mode = \"redis\" requires redis.addr".to_string(),
            ));
        }
        Ok(())
    }

    /// Inline tenant records, id taken from the map key.
    pub fn inline_tenants(&self) -> Vec<TenantRecord> {
        self.tenants
            .inline
            .iter()
            .map(|(id, t)| TenantRecord {
                tenant_id: id.clone(),
                name: t.name.clone(),
                default_provider: t.default_provider.clone(),
                providers: t.providers.clone(),
            })
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
