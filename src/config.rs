//! Configuration management for llm-hub.
//!
//! All options come from environment variables (a `.env` file loaded by the
//! service manager works the same way):
//! - `HUB_HOST` / `HUB_PORT` - Bind address. Defaults to `127.0.0.1:8080`.
//! - `DATABASE_PATH` - SQLite file location. Defaults to `llm-hub.db`.
//! - `HUB_ENV_FILE` - Where a generated `HUB_SECRET_KEY` is persisted. Defaults to `.env`.
//! - `HUB_REQUEST_DEADLINE_SEC` - End-to-end request deadline. Defaults to `120`.
//! - `HUB_LOCAL_MODEL` - Model the `local` alias resolves to. Defaults to `llama3.1:8b`.
//! - `RETRY_ENABLED`, `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_SEC`, `RETRY_GROWTH` - Executor behaviour.
//! - `FALLBACK_RULES` - Comma-separated `src:dst` family pairs, e.g. `openai:ollama`.
//! - `ROUTING_RULES` - Comma-separated `prefix:family` pairs overriding the default prefix map.
//! - `HEALTH_PROBE_PERIOD_SEC`, `HEALTH_PROBE_TIMEOUT_SEC` - Probe loop cadence.
//! - `ALERT_ENABLED`, `ALERT_CHECK_PERIOD_SEC`, `ALERT_CONSECUTIVE_ERROR_THRESHOLD`,
//!   `ALERT_LATENCY_MULTIPLIER`, `ALERT_BUDGET_THRESHOLD_PERCENT` - Alert thresholds.
//! - `ALERT_WEBHOOK_URL`, `ALERT_DESKTOP_NOTIFY` - Dispatch channels.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::router::{FallbackRules, RoutingRules};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Parse an environment variable, falling back to `default` when unset.
fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Retry executor settings.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Master switch; when false every provider gets exactly one attempt.
    pub enabled: bool,

    /// Attempts per provider before moving down the fallback chain.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base: Duration,

    /// Multiplier per additional attempt.
    pub growth: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base: Duration::from_secs(1),
            growth: 5.0,
        }
    }
}

impl RetrySettings {
    /// Backoff before retrying after `attempt` (1-indexed) has failed:
    /// `base * growth^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.base.as_secs_f64() * self.growth.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(secs)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// How often degraded providers are actively probed.
    pub probe_period: Duration,

    /// Per-probe timeout.
    pub probe_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_period: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Alert manager settings.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub enabled: bool,

    /// How often alert conditions are evaluated.
    pub check_period: Duration,

    /// Consecutive failed requests before a `consecutive-errors` alert fires.
    pub consecutive_error_threshold: u32,

    /// Rolling latency mean must exceed baseline by this factor to fire.
    pub latency_multiplier: f64,

    /// Budget window spend percentage at which `budget-threshold` fires.
    pub budget_threshold_percent: f64,

    /// Webhook channel target, if configured.
    pub webhook_url: Option<String>,

    /// Whether the desktop notification channel is enabled.
    pub desktop_notify: bool,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_period: Duration::from_secs(60),
            consecutive_error_threshold: 3,
            latency_multiplier: 3.0,
            budget_threshold_percent: 90.0,
            webhook_url: None,
            desktop_notify: false,
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// SQLite database file
    pub database_path: PathBuf,

    /// File where a generated secret key is appended
    pub env_file: PathBuf,

    /// Default end-to-end request deadline
    pub request_deadline: Duration,

    /// What the `local` model alias resolves to
    pub local_model: String,

    pub retry: RetrySettings,
    pub health: HealthSettings,
    pub alerts: AlertSettings,
    pub routing_rules: RoutingRules,
    pub fallback_rules: FallbackRules,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HUB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("HUB_PORT", 8080u16)?;

        let database_path = std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("llm-hub.db"));

        let env_file = std::env::var("HUB_ENV_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".env"));

        let request_deadline = Duration::from_secs(env_parse("HUB_REQUEST_DEADLINE_SEC", 120u64)?);

        let local_model =
            std::env::var("HUB_LOCAL_MODEL").unwrap_or_else(|_| "llama3.1:8b".to_string());

        let retry = RetrySettings {
            enabled: env_var_bool("RETRY_ENABLED", true),
            max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3u32)?.max(1),
            base: Duration::from_secs_f64(env_parse("RETRY_BASE_SEC", 1.0f64)?),
            growth: env_parse("RETRY_GROWTH", 5.0f64)?,
        };

        let health = HealthSettings {
            probe_period: Duration::from_secs(env_parse("HEALTH_PROBE_PERIOD_SEC", 30u64)?),
            probe_timeout: Duration::from_secs(env_parse("HEALTH_PROBE_TIMEOUT_SEC", 5u64)?),
        };

        let alerts = AlertSettings {
            enabled: env_var_bool("ALERT_ENABLED", true),
            check_period: Duration::from_secs(env_parse("ALERT_CHECK_PERIOD_SEC", 60u64)?),
            consecutive_error_threshold: env_parse("ALERT_CONSECUTIVE_ERROR_THRESHOLD", 3u32)?
                .max(1),
            latency_multiplier: env_parse("ALERT_LATENCY_MULTIPLIER", 3.0f64)?,
            budget_threshold_percent: env_parse("ALERT_BUDGET_THRESHOLD_PERCENT", 90.0f64)?,
            webhook_url: std::env::var("ALERT_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            desktop_notify: env_var_bool("ALERT_DESKTOP_NOTIFY", false),
        };

        let routing_rules = match std::env::var("ROUTING_RULES") {
            Ok(raw) => RoutingRules::from_spec(&raw)
                .map_err(|e| ConfigError::InvalidValue("ROUTING_RULES".to_string(), e))?,
            Err(_) => RoutingRules::default(),
        };

        let fallback_rules = match std::env::var("FALLBACK_RULES") {
            Ok(raw) => FallbackRules::from_spec(&raw)
                .map_err(|e| ConfigError::InvalidValue("FALLBACK_RULES".to_string(), e))?,
            Err(_) => FallbackRules::default(),
        };

        Ok(Self {
            host,
            port,
            database_path,
            env_file,
            request_deadline,
            local_model,
            retry,
            health,
            alerts,
            routing_rules,
            fallback_rules,
        })
    }
}

impl Default for Config {
    /// A config with built-in defaults, useful for tests.
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_path: PathBuf::from("llm-hub.db"),
            env_file: PathBuf::from(".env"),
            request_deadline: Duration::from_secs(120),
            local_model: "llama3.1:8b".to_string(),
            retry: RetrySettings::default(),
            health: HealthSettings::default(),
            alerts: AlertSettings::default(),
            routing_rules: RoutingRules::default(),
            fallback_rules: FallbackRules::default(),
        }
    }
}
