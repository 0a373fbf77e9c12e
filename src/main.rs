// ── Airborne: Wiring Binary ────────────────────────────────────────────────
// Loads configuration, connects the stores, assembles the orchestrator, and
// serves the RPC surface. All interesting behavior lives in the library.

use log::info;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use airborne::auth::interceptor::AuthMode;
use airborne::auth::{AuthState, KeyStore, RateLimiter};
use airborne::config::{AuthModeConfig, Config};
use airborne::engine::markdown::{HttpMarkdownRenderer, PlainTextRenderer};
use airborne::engine::pricing::PricingTable;
use airborne::engine::ChatOrchestrator;
use airborne::server::{build_router, AppState};
use airborne::store::{MemoryKv, RedisKv, TenantRepository};
use airborne::tenant::TenantRegistry;
use airborne::{GatewayError, GatewayResult, KvStore, MarkdownRenderer};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "airborne.toml".to_string());
    let config = Config::load(std::path::Path::new(&config_path))?;

    let mut logger = env_logger::Builder::new();
    logger.parse_filters(&config.log.level);
    if config.log.format == "json" {
        logger.format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{}",
                serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                })
            )
        });
    } else {
        logger.format_timestamp_millis();
    }
    logger.init();
    info!("[server] Loaded configuration from {config_path}");

    // Shared key-value store: Redis when configured, in-process otherwise.
    let kv: Arc<dyn KvStore> = match &config.redis.addr {
        Some(addr) => Arc::new(
            RedisKv::connect(addr, config.redis.password.as_deref(), config.redis.db).await?,
        ),
        None => {
            info!("[server] No redis.addr configured — using the in-process key-value store");
            Arc::new(MemoryKv::new())
        }
    };

    // Tenants: directory and inline records merge; the whitelist derives
    // from the loaded set.
    let mut records = config.inline_tenants();
    if let Some(dir) = &config.tenants.dir {
        records.extend(TenantRegistry::read_dir_records(dir)?);
    }
    let tenants = Arc::new(TenantRegistry::new(records)?);
    if tenants.is_empty() {
        return Err(GatewayError::invalid(
            "no tenants configured; add [tenants.inline.<id>] or tenants.dir".to_string(),
        ));
    }
    info!("[server] Serving {} tenant(s)", tenants.len());

    let db = TenantRepository::open(&config.database.url)?;

    let limiter = Arc::new(RateLimiter::new(kv.clone()));
    let keystore = Arc::new(KeyStore::new(kv.clone()));

    let renderer: Arc<dyn MarkdownRenderer> = match &config.markdown.endpoint {
        Some(endpoint) => Arc::new(HttpMarkdownRenderer::new(
            endpoint.clone(),
            Duration::from_millis(config.markdown.timeout_ms),
        )),
        None => Arc::new(PlainTextRenderer),
    };

    let orchestrator = Arc::new(ChatOrchestrator::new(
        tenants,
        kv,
        limiter.clone(),
        Arc::new(PricingTable::builtin()),
        None, // retrieval backend is wired by deployments that have one
        renderer,
        db,
        config.debug.capture_payloads,
    ));

    let auth = Arc::new(AuthState {
        mode: match config.auth.mode {
            AuthModeConfig::Redis => AuthMode::Redis,
            AuthModeConfig::Static => AuthMode::Static,
        },
        keystore,
        limiter,
        admin_token: config.auth.admin_token.clone().map(Zeroizing::new),
        static_admin_full: config.auth.static_admin_full,
        default_rpm: config.rate_limits.default_rpm,
        default_tpm: config.rate_limits.default_tpm,
        allowlist: vec!["/health".to_string()],
    });

    let router = build_router(AppState { orchestrator }, auth);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    // TLS termination is handled in front of the gateway; the tls section
    // is validated at load so misconfiguration still fails fast.
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[server] Listening on {addr}");
    axum::serve(listener, router)
        .await
        .map_err(|e| GatewayError::internal(format!("server error: {e}")))?;
    Ok(())
}
