//! Persisted row types.
//!
//! `requests` and `api_calls` are append-only ledgers; everything else is
//! mutable through the store's transactional operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::ProviderFamily;

/// One configured instance of a provider family, with credentials and limits.
///
/// Credential fields hold vault ciphertext; plaintext exists only inside the
/// vault boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: i64,
    pub name: String,
    pub service: ProviderFamily,
    pub category: Option<String>,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key_enc: Option<String>,
    #[serde(skip_serializing)]
    pub token_enc: Option<String>,
    #[serde(skip_serializing)]
    pub credential_path_enc: Option<String>,
    pub enabled: bool,
    pub is_default: bool,
    /// Per-window USD limits; 0 disables enforcement for that window.
    pub daily_limit_usd: f64,
    pub weekly_limit_usd: f64,
    pub monthly_limit_usd: f64,
    /// While set and in the future, budget enforcement is suppressed.
    pub budget_override_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Whether a budget override is currently in effect.
    pub fn override_active(&self, now: DateTime<Utc>) -> bool {
        self.budget_override_until.map(|t| t > now).unwrap_or(false)
    }
}

/// Input for creating or updating a connection.
#[derive(Debug, Clone)]
pub struct ConnectionData {
    pub name: String,
    pub service: ProviderFamily,
    pub category: Option<String>,
    pub base_url: Option<String>,
    pub api_key_enc: Option<String>,
    pub token_enc: Option<String>,
    pub credential_path_enc: Option<String>,
    pub enabled: bool,
    pub is_default: bool,
    pub daily_limit_usd: f64,
    pub weekly_limit_usd: f64,
    pub monthly_limit_usd: f64,
}

/// USD-per-million-token pricing for a (connection, model pattern) pair.
///
/// A row without a `connection_id` is a legacy global entry; rows with one
/// are authoritative for that connection.
#[derive(Debug, Clone, Serialize)]
pub struct CostConfigRecord {
    pub id: i64,
    pub model_pattern: String,
    pub connection_id: Option<i64>,
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
    pub updated_at: DateTime<Utc>,
}

/// Global budget limits; dashboard display defaults, not enforcement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub daily_usd: f64,
    pub weekly_usd: f64,
    pub monthly_usd: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_usd: 5.0,
            weekly_usd: 25.0,
            monthly_usd: 80.0,
        }
    }
}

/// Input for one appended LLM request row.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub workflow: Option<String>,
}

/// One completed LLM call (success or terminal failure). Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub workflow: Option<String>,
}

/// Input for one appended non-LLM upstream call row.
#[derive(Debug, Clone)]
pub struct NewApiCall {
    pub service: String,
    pub operation: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub metadata: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
}

/// One completed non-LLM upstream call. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct ApiCallRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub service: String,
    pub operation: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub metadata: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
}

/// What condition an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConsecutiveErrors,
    LatencySpike,
    BudgetThreshold,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsecutiveErrors => "consecutive_errors",
            Self::LatencySpike => "latency_spike",
            Self::BudgetThreshold => "budget_threshold",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "consecutive_errors" => Some(Self::ConsecutiveErrors),
            "latency_spike" => Some(Self::LatencySpike),
            "budget_threshold" => Some(Self::BudgetThreshold),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// The identity under which at most one alert may be active.
pub fn alert_dedup_key(connection_id: i64, kind: AlertKind) -> String {
    format!("{}:{}", connection_id, kind.as_str())
}

/// A raised alert. Active while `resolved_at` and `dismissed_at` are both
/// unset.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub dedup_key: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl AlertRecord {
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none() && self.dismissed_at.is_none()
    }
}

/// One bucket of the usage time series: totals for a provider on a UTC day.
#[derive(Debug, Clone, Serialize)]
pub struct UsagePoint {
    pub day: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub requests: u64,
}

/// 24-hour totals for the dashboard stat tiles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_cost_usd: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub avg_latency_ms: Option<f64>,
}
