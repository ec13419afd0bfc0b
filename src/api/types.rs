//! API request and response types, plus the error payload mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::health::HealthState;
use crate::providers::ProviderFamily;
use crate::storage::ConnectionRecord;

/// Error payload shape: `{detail, code?, metadata?}`.
#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Wrapper making [`HubError`] an axum response.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let payload = ErrorPayload {
            detail: self.0.to_string(),
            code: Some(self.0.code()),
            metadata: self.0.metadata(),
        };
        (status, Json(payload)).into_response()
    }
}

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
}

/// Incoming OpenAI-compatible completion request.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionBody {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// One incoming message; the role is validated by the handler so malformed
/// input gets the gateway's error payload rather than a serde rejection.
#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

/// Completion response body.
#[derive(Debug, Serialize)]
pub struct ChatCompletionView {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Models grouped by provider family.
#[derive(Debug, Serialize)]
pub struct ModelsView {
    pub data: Vec<ProviderModels>,
}

#[derive(Debug, Serialize)]
pub struct ProviderModels {
    pub provider: String,
    pub models: Vec<String>,
}

/// A connection as the dashboard sees it: credentials masked, health and
/// recent spend attached.
#[derive(Debug, Serialize)]
pub struct ConnectionView {
    pub id: i64,
    pub name: String,
    pub service: ProviderFamily,
    pub category: Option<String>,
    pub base_url: Option<String>,
    pub api_key_masked: String,
    pub token_masked: String,
    pub credential_path_masked: String,
    pub enabled: bool,
    pub is_default: bool,
    pub daily_limit_usd: f64,
    pub weekly_limit_usd: f64,
    pub monthly_limit_usd: f64,
    pub budget_override_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub health: HealthState,
    pub spend_24h_usd: f64,
}

/// Create/replace payload for a connection. Credentials arrive in plaintext
/// over the localhost socket and are encrypted before they reach storage.
#[derive(Debug, Deserialize)]
pub struct ConnectionBody {
    pub name: String,
    pub service: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub credential_path: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub daily_limit_usd: f64,
    #[serde(default)]
    pub weekly_limit_usd: f64,
    #[serde(default)]
    pub monthly_limit_usd: f64,
}

fn default_true() -> bool {
    true
}

/// Partial update payload; absent fields keep their stored values.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectionPatch {
    pub name: Option<String>,
    pub category: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub token: Option<String>,
    pub credential_path: Option<String>,
    pub enabled: Option<bool>,
    pub is_default: Option<bool>,
    pub daily_limit_usd: Option<f64>,
    pub weekly_limit_usd: Option<f64>,
    pub monthly_limit_usd: Option<f64>,
}

/// Budget override request.
#[derive(Debug, Deserialize)]
pub struct BudgetOverrideBody {
    /// Override duration in minutes.
    pub duration_minutes: u64,
}

#[derive(Debug, Serialize)]
pub struct BudgetOverrideView {
    pub connection_id: i64,
    pub override_until: DateTime<Utc>,
}

/// Cost config create/update payload.
#[derive(Debug, Deserialize)]
pub struct CostConfigBody {
    pub model_pattern: String,
    #[serde(default)]
    pub connection_id: Option<i64>,
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
}

/// Query parameters for `/api/dashboard/usage`.
#[derive(Debug, Deserialize)]
pub struct UsageParams {
    #[serde(default)]
    pub period: Option<String>,
    /// Anchor date (`YYYY-MM-DD`) for weekly/monthly windows.
    #[serde(default)]
    pub anchor: Option<String>,
}

/// Query parameters for `/api/dashboard/requests` and `/api/alerts`.
#[derive(Debug, Deserialize)]
pub struct LimitParams {
    #[serde(default)]
    pub limit: Option<u32>,
}

/// A provider health snapshot joined with its connection identity.
#[derive(Debug, Serialize)]
pub struct ConnectionHealthView {
    pub connection_id: i64,
    pub name: String,
    pub service: ProviderFamily,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe_ok: Option<bool>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Build a masked dashboard view of a connection.
///
/// `decrypt_and_mask` is applied to each stored ciphertext; decryption stays
/// inside the vault and only the mask leaves this function.
pub fn connection_view(
    record: &ConnectionRecord,
    health: HealthState,
    spend_24h_usd: f64,
    mut decrypt_and_mask: impl FnMut(&str) -> String,
) -> ConnectionView {
    ConnectionView {
        id: record.id,
        name: record.name.clone(),
        service: record.service,
        category: record.category.clone(),
        base_url: record.base_url.clone(),
        api_key_masked: record
            .api_key_enc
            .as_deref()
            .map(&mut decrypt_and_mask)
            .unwrap_or_default(),
        token_masked: record
            .token_enc
            .as_deref()
            .map(&mut decrypt_and_mask)
            .unwrap_or_default(),
        credential_path_masked: record
            .credential_path_enc
            .as_deref()
            .map(&mut decrypt_and_mask)
            .unwrap_or_default(),
        enabled: record.enabled,
        is_default: record.is_default,
        daily_limit_usd: record.daily_limit_usd,
        weekly_limit_usd: record.weekly_limit_usd,
        monthly_limit_usd: record.monthly_limit_usd,
        budget_override_until: record.budget_override_until,
        created_at: record.created_at,
        updated_at: record.updated_at,
        health,
        spend_24h_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetWindow;
    use crate::vault::{mask, Vault};

    #[test]
    fn error_payload_shape() {
        let err = ApiError(HubError::BudgetExceeded {
            window: BudgetWindow::Daily,
            limit_usd: 1.0,
            spent_usd: 1.0,
        });
        let payload = ErrorPayload {
            detail: err.0.to_string(),
            code: Some(err.0.code()),
            metadata: err.0.metadata(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["code"], "budget_exceeded");
        assert_eq!(value["metadata"]["window"], "daily");
        assert_eq!(value["metadata"]["limit"], 1.0);
        assert_eq!(value["metadata"]["spent"], 1.0);
    }

    #[test]
    fn connection_view_masks_credentials() {
        let vault = Vault::new([9u8; 32]);
        let ciphertext = vault.encrypt("sk-abcdefghijklmnop").unwrap();
        let record = ConnectionRecord {
            id: 1,
            name: "openai".to_string(),
            service: ProviderFamily::OpenAi,
            category: None,
            base_url: None,
            api_key_enc: Some(ciphertext.clone()),
            token_enc: None,
            credential_path_enc: None,
            enabled: true,
            is_default: false,
            daily_limit_usd: 0.0,
            weekly_limit_usd: 0.0,
            monthly_limit_usd: 0.0,
            budget_override_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let view = connection_view(&record, HealthState::Healthy, 0.0, |raw| {
            mask(&vault.decrypt(raw).unwrap_or_default())
        });
        assert_eq!(view.api_key_masked, "sk-a...mnop");
        assert_eq!(view.token_masked, "");

        // The serialized view never contains plaintext or ciphertext
        let serialized = serde_json::to_string(&view).unwrap();
        assert!(!serialized.contains("sk-abcdefghijklmnop"));
        assert!(!serialized.contains(&ciphertext));
    }
}
