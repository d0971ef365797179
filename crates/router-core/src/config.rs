//! Environment configuration for the router process.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Base URL of the external pool service.
    pub pool_api_url: String,
    /// Mapping store connection URL (redis://...).
    pub mapping_store_url: String,
    /// Port for the control API.
    pub control_api_port: u16,
    /// Path to the routing config file (JSON).
    pub routing_file: PathBuf,
    /// Out-of-band alerting configuration.
    pub alerts: AlertsConfig,
    /// Observation tick cadence per source account.
    pub poll_interval: Duration,
    /// Orphan reconciler cadence per route.
    pub reconciler_interval: Duration,
    /// Wait between the two scans that confirm an orphan.
    pub orphan_grace: Duration,
    /// TTL of recently-closed records.
    pub recent_close_ttl: Duration,
    /// Timeout applied to every pool call.
    pub call_timeout: Duration,
    /// Deadline for draining in-flight calls at shutdown.
    pub shutdown_deadline: Duration,
    /// Externally reachable base URL of the control API, used when
    /// registering the pool reconnection callback. None disables
    /// registration.
    pub callback_base_url: Option<String>,
}

/// Telegram alerting configuration. Both fields must be present for
/// Telegram delivery; otherwise alerts degrade to structured logs.
#[derive(Debug, Clone, Default)]
pub struct AlertsConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl RouterConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            pool_api_url: env::var("POOL_API_URL")
                .map_err(|_| ConfigError::MissingEnv("POOL_API_URL"))?,
            mapping_store_url: env::var("MAPPING_STORE_URL")
                .map_err(|_| ConfigError::MissingEnv("MAPPING_STORE_URL"))?,
            control_api_port: env_parsed("CONTROL_API_PORT", 8070),
            routing_file: PathBuf::from(
                env::var("ROUTING_CONFIG").unwrap_or_else(|_| "routing.json".to_string()),
            ),
            alerts: AlertsConfig {
                telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
                telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok(),
            },
            poll_interval: Duration::from_millis(env_parsed("POLL_INTERVAL_MS", 2_000)),
            reconciler_interval: Duration::from_secs(env_parsed("RECONCILER_INTERVAL_SECS", 60)),
            orphan_grace: Duration::from_secs(env_parsed("ORPHAN_GRACE_SECS", 30)),
            recent_close_ttl: Duration::from_secs(env_parsed("RECENT_CLOSE_TTL_SECS", 900)),
            call_timeout: Duration::from_secs(env_parsed("POOL_TIMEOUT_SECS", 30)),
            shutdown_deadline: Duration::from_secs(env_parsed("SHUTDOWN_DEADLINE_SECS", 30)),
            callback_base_url: env::var("CALLBACK_BASE_URL").ok(),
        })
    }

    /// Configuration with defaults for tests.
    pub fn test_config() -> Self {
        Self {
            pool_api_url: "http://127.0.0.1:8060".to_string(),
            mapping_store_url: "redis://127.0.0.1:6379".to_string(),
            control_api_port: 8070,
            routing_file: PathBuf::from("routing.json"),
            alerts: AlertsConfig::default(),
            poll_interval: Duration::from_millis(2_000),
            reconciler_interval: Duration::from_secs(60),
            orphan_grace: Duration::from_secs(30),
            recent_close_ttl: Duration::from_secs(900),
            call_timeout: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(30),
            callback_base_url: None,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
