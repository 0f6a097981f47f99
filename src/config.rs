//! Startup configuration, built once and held as managed state.
//!
//! Generalizes the teacher's `RateLimitConfig::from_env` (which reads a
//! handful of `RATE_LIMIT_*` vars ad hoc inside `rate_limit.rs`) into a
//! single config surface covering every environment-derived setting in
//! spec §6.3. Nothing reads `std::env::var` outside this module.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_path: String,
    pub webhook_signing_secret: String,
    pub provider_base_url: String,
    pub provider_access_token: String,
    pub provider_timeout: Duration,
    pub replay_ttl: Duration,
    pub tenant_cache_ttl: Duration,
    pub webhook_log_retention_days: i64,
    pub global_killswitch_ttl_hours: i64,
    pub workspace_killswitch_ttl_days: i64,
    pub faq_match_threshold: f64,
    default_country_code: String,
}

impl GatewayConfig {
    /// Country code a leading-zero local number is mapped to (§4.7 step 1).
    pub fn default_country_code(&self) -> String {
        self.default_country_code.clone()
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl GatewayConfig {
    /// Reads configuration from the environment. Missing required secrets
    /// (signing secret, provider token) fail loudly at startup rather than
    /// lazily at first request.
    pub fn from_env() -> Result<Self, String> {
        let webhook_signing_secret = env::var("WEBHOOK_SIGNING_SECRET")
            .map_err(|_| "WEBHOOK_SIGNING_SECRET must be set".to_string())?;
        let provider_access_token = env::var("PROVIDER_ACCESS_TOKEN")
            .map_err(|_| "PROVIDER_ACCESS_TOKEN must be set".to_string())?;

        Ok(GatewayConfig {
            database_path: env_or("GATEWAY_DB_PATH", "gateway.db"),
            webhook_signing_secret,
            provider_base_url: env_or("PROVIDER_BASE_URL", "https://graph.provider.example/v19.0"),
            provider_access_token,
            provider_timeout: Duration::from_secs(env_u64("PROVIDER_TIMEOUT_SECS", 8)),
            replay_ttl: Duration::from_secs(env_u64("REPLAY_TTL_SECS", 300)),
            tenant_cache_ttl: Duration::from_secs(env_u64("TENANT_CACHE_TTL_SECS", 300)),
            webhook_log_retention_days: env_i64("WEBHOOK_LOG_RETENTION_DAYS", 30),
            global_killswitch_ttl_hours: env_i64("GLOBAL_KILLSWITCH_TTL_HOURS", 24),
            workspace_killswitch_ttl_days: env_i64("WORKSPACE_KILLSWITCH_TTL_DAYS", 7),
            faq_match_threshold: env_f64("FAQ_MATCH_THRESHOLD", 0.6),
            default_country_code: env_or("DEFAULT_COUNTRY_CODE", "91"),
        })
    }

    /// Used by integration tests that need a config without reading the
    /// process environment. Each call gets its own temp-file database path
    /// (not `:memory:`) since `lib.rs` opens the database twice — once for
    /// the managed request-path `Db`, once for the dispatcher's background
    /// connection — and SQLite's `:memory:` gives each `Connection::open`
    /// call an independent, unshared database.
    pub fn for_tests() -> Self {
        let db_path = std::env::temp_dir()
            .join(format!("bsp_gateway_test_{}.db", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string();
        GatewayConfig {
            database_path: db_path,
            webhook_signing_secret: "test_signing_secret".to_string(),
            provider_base_url: "https://graph.provider.example/v19.0".to_string(),
            provider_access_token: "test_token".to_string(),
            provider_timeout: Duration::from_secs(8),
            replay_ttl: Duration::from_secs(300),
            tenant_cache_ttl: Duration::from_secs(300),
            webhook_log_retention_days: 30,
            global_killswitch_ttl_hours: 24,
            workspace_killswitch_ttl_days: 7,
            faq_match_threshold: 0.6,
            default_country_code: "91".to_string(),
        }
    }
}
