//! Environment-driven configuration.
//!
//! Every tunable documented for operators lives here. `Config::from_env`
//! reads the process environment once at startup; nothing else in the
//! workspace touches `std::env`.

use serde::{Deserialize, Serialize};

/// How the admin surface authenticates callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAuthMode {
    /// Bearer token compared against `ADMIN_TOKEN`.
    Token,
    /// Loopback requests bypass the token check.
    Local,
    /// No check at all (development only).
    Off,
}

impl AdminAuthMode {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Self::Local,
            "off" => Self::Off,
            _ => Self::Token,
        }
    }
}

/// Full gateway configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// SQLite database file path.
    pub db_path: String,
    /// 32-byte base64url AEAD key, if explicitly configured.
    pub encryption_key: Option<String>,
    /// Admin bearer token (empty disables `token` mode logins).
    pub admin_token: String,
    /// Admin authorization mode.
    pub admin_auth_mode: AdminAuthMode,
    /// Health pass period in seconds.
    pub pool_refresh_interval_seconds: u64,
    /// Short cooldown applied on transient failures, in seconds.
    pub cooldown_seconds: i64,
    /// Long cooldown applied on quota exhaustion, in seconds.
    pub quota_cooldown_seconds: i64,
    /// Consecutive health-check failures before demotion.
    pub health_fail_threshold: u32,
    /// Dispatch error-count threshold before cooldown.
    pub failure_threshold: u32,
    /// Distinct accounts tried per dispatch.
    pub max_accounts_per_request: u32,
    /// Identity-exchange retry attempts per refresh.
    pub refresh_retry_count: u32,
    /// Linear backoff base between refresh retries, in milliseconds.
    pub refresh_retry_base_delay_ms: u64,
    /// Transport retry attempts within one account attempt.
    pub upstream_retry_count: u32,
    /// Linear backoff base between transport retries, in milliseconds.
    pub upstream_retry_base_delay_ms: u64,
    /// Identity-exchange timeout in seconds.
    pub refresh_timeout_seconds: u64,
    /// Upstream connect timeout in seconds.
    pub upstream_connect_timeout_seconds: u64,
    /// Upstream read-idle timeout in seconds.
    pub upstream_read_idle_timeout_seconds: u64,
    /// Per-account health probe timeout in seconds.
    pub health_probe_timeout_seconds: u64,
    /// Identity-provider token endpoint.
    pub identity_token_url: String,
    /// Upstream streaming send endpoint.
    pub upstream_send_url: String,
    /// Upstream quota query endpoint.
    pub upstream_quota_url: String,
    /// Client version advertised to upstream.
    pub client_version: String,
    /// OS category advertised to upstream.
    pub os_category: String,
    /// OS name advertised to upstream.
    pub os_name: String,
    /// OS version advertised to upstream.
    pub os_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8002,
            db_path: "./data/warpflow.db".into(),
            encryption_key: None,
            admin_token: String::new(),
            admin_auth_mode: AdminAuthMode::Token,
            pool_refresh_interval_seconds: 3600,
            cooldown_seconds: 300,
            quota_cooldown_seconds: 3600,
            health_fail_threshold: 3,
            failure_threshold: 3,
            max_accounts_per_request: 4,
            refresh_retry_count: 3,
            refresh_retry_base_delay_ms: 400,
            upstream_retry_count: 2,
            upstream_retry_base_delay_ms: 500,
            refresh_timeout_seconds: 15,
            upstream_connect_timeout_seconds: 10,
            upstream_read_idle_timeout_seconds: 60,
            health_probe_timeout_seconds: 20,
            identity_token_url: "https://securetoken.googleapis.com/v1/token".into(),
            upstream_send_url: "https://app.warp.dev/ai/multi-agent".into(),
            upstream_quota_url: "https://app.warp.dev/graphql/v2?op=GetRequestLimitInfo".into(),
            client_version: "v0.2026.02.11.08.23.stable_02".into(),
            os_category: "macOS".into(),
            os_name: "macOS".into(),
            os_version: "26.4".into(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Unset or unparseable values fall back to defaults; this never fails
    /// so a partially configured development environment still boots.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: env_str("HOST", &d.host),
            port: env_parse("PORT", d.port),
            db_path: env_str("TOKEN_DB_PATH", &d.db_path),
            encryption_key: env_opt("TOKEN_ENCRYPTION_KEY"),
            admin_token: env_str("ADMIN_TOKEN", ""),
            admin_auth_mode: AdminAuthMode::parse(&env_str("ADMIN_AUTH_MODE", "token")),
            pool_refresh_interval_seconds: env_parse(
                "POOL_REFRESH_INTERVAL_SECONDS",
                d.pool_refresh_interval_seconds,
            ),
            cooldown_seconds: env_parse("TOKEN_COOLDOWN_SECONDS", d.cooldown_seconds),
            quota_cooldown_seconds: env_parse(
                "TOKEN_QUOTA_COOLDOWN_SECONDS",
                d.quota_cooldown_seconds,
            ),
            health_fail_threshold: env_parse("H_FAIL_THRESHOLD", d.health_fail_threshold),
            failure_threshold: env_parse("F_THRESHOLD", d.failure_threshold),
            max_accounts_per_request: env_parse(
                "MAX_ACCOUNTS_PER_REQUEST",
                d.max_accounts_per_request,
            ),
            refresh_retry_count: env_parse("TOKEN_REFRESH_RETRY_COUNT", d.refresh_retry_count),
            refresh_retry_base_delay_ms: env_parse(
                "TOKEN_REFRESH_RETRY_BASE_DELAY_MS",
                d.refresh_retry_base_delay_ms,
            ),
            upstream_retry_count: env_parse("UPSTREAM_RETRY_COUNT", d.upstream_retry_count),
            upstream_retry_base_delay_ms: env_parse(
                "UPSTREAM_RETRY_BASE_DELAY_MS",
                d.upstream_retry_base_delay_ms,
            ),
            refresh_timeout_seconds: env_parse(
                "REFRESH_TIMEOUT_SECONDS",
                d.refresh_timeout_seconds,
            ),
            upstream_connect_timeout_seconds: env_parse(
                "UPSTREAM_CONNECT_TIMEOUT_SECONDS",
                d.upstream_connect_timeout_seconds,
            ),
            upstream_read_idle_timeout_seconds: env_parse(
                "UPSTREAM_READ_IDLE_TIMEOUT_SECONDS",
                d.upstream_read_idle_timeout_seconds,
            ),
            health_probe_timeout_seconds: env_parse(
                "HEALTH_PROBE_TIMEOUT_SECONDS",
                d.health_probe_timeout_seconds,
            ),
            identity_token_url: env_str("IDENTITY_TOKEN_URL", &d.identity_token_url),
            upstream_send_url: env_str("UPSTREAM_SEND_URL", &d.upstream_send_url),
            upstream_quota_url: env_str("UPSTREAM_QUOTA_URL", &d.upstream_quota_url),
            client_version: env_str("CLIENT_VERSION", &d.client_version),
            os_category: env_str("OS_CATEGORY", &d.os_category),
            os_name: env_str("OS_NAME", &d.os_name),
            os_version: env_str("OS_VERSION", &d.os_version),
        }
    }

    /// Socket address string for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_str(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8002);
        assert_eq!(cfg.max_accounts_per_request, 4);
        assert_eq!(cfg.pool_refresh_interval_seconds, 3600);
        assert!(cfg.cooldown_seconds < cfg.quota_cooldown_seconds);
        assert_eq!(cfg.admin_auth_mode, AdminAuthMode::Token);
    }

    #[test]
    fn auth_mode_parsing() {
        assert_eq!(AdminAuthMode::parse("local"), AdminAuthMode::Local);
        assert_eq!(AdminAuthMode::parse("OFF"), AdminAuthMode::Off);
        assert_eq!(AdminAuthMode::parse("token"), AdminAuthMode::Token);
        // Unknown values fail closed.
        assert_eq!(AdminAuthMode::parse("open"), AdminAuthMode::Token);
    }

    #[test]
    fn bind_address_joins_host_and_port() {
        let cfg = Config {
            host: "0.0.0.0".into(),
            port: 9000,
            ..Config::default()
        };
        assert_eq!(cfg.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.db_path, cfg.db_path);
        assert_eq!(back.admin_auth_mode, cfg.admin_auth_mode);
    }
}
