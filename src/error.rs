//! Gateway error taxonomy.
//!
//! Every failure a caller can observe is one of these variants; the HTTP
//! surface maps them onto status codes and the `{detail, code, metadata}`
//! payload. Upstream failures carry structured context (provider, attempts,
//! status, elapsed) gathered by the executor.

use serde_json::json;
use thiserror::Error;

use crate::budget::BudgetWindow;
use crate::providers::ProviderErrorClass;

/// Top-level error type for the request pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum HubError {
    /// Caller input is invalid. Never retried, never switched to a fallback.
    #[error("{detail}")]
    BadRequest { detail: String },

    /// The addressed resource does not exist.
    #[error("{detail}")]
    NotFound { detail: String },

    /// The router produced an empty chain for this model.
    #[error("no enabled connection is configured for model '{model}'")]
    ProviderNotConfigured { model: String },

    /// A pre-flight budget window is at or over its limit.
    #[error("budget exceeded: {window} spend ${spent_usd:.4} has reached the ${limit_usd:.4} limit")]
    BudgetExceeded {
        window: BudgetWindow,
        limit_usd: f64,
        spent_usd: f64,
    },

    /// The whole provider chain failed; `class` is the terminal failure class.
    #[error("upstream {class} from {provider} after {attempts} attempt(s): {detail}")]
    Upstream {
        class: ProviderErrorClass,
        provider: String,
        attempts: u32,
        status: Option<u16>,
        detail: String,
        elapsed_ms: u64,
    },

    /// The caller went away or the deadline elapsed.
    #[error("{}", if *.deadline { "request deadline exceeded" } else { "request cancelled by caller" })]
    Cancelled { deadline: bool },

    /// A database write failed.
    #[error("persistence failure: {detail}")]
    Persistence { detail: String },

    /// Programmer error; always a bug.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl HubError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::BadRequest {
            detail: detail.into(),
        }
    }

    pub fn persistence(detail: impl Into<String>) -> Self {
        Self::Persistence {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code for the API payload and request rows.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::NotFound { .. } => "not_found",
            Self::ProviderNotConfigured { .. } => "provider_not_configured",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Upstream { class, .. } => match class {
                ProviderErrorClass::Auth => "auth",
                ProviderErrorClass::RateLimited => "upstream_rate_limited",
                ProviderErrorClass::Transient => "upstream_transient",
                ProviderErrorClass::BadRequest => "upstream_bad_request",
            },
            Self::Cancelled { .. } => "cancelled",
            Self::Persistence { .. } => "persistence",
            Self::Internal { .. } => "internal",
        }
    }

    /// HTTP status this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::ProviderNotConfigured { .. } => 503,
            Self::BudgetExceeded { .. } => 429,
            Self::Upstream {
                class: ProviderErrorClass::RateLimited,
                ..
            } => 429,
            Self::Upstream { .. } => 502,
            Self::Cancelled { deadline } => {
                if *deadline {
                    504
                } else {
                    499
                }
            }
            Self::Persistence { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Structured metadata for the API error payload, if any.
    pub fn metadata(&self) -> Option<serde_json::Value> {
        match self {
            Self::BudgetExceeded {
                window,
                limit_usd,
                spent_usd,
            } => Some(json!({
                "window": window.to_string(),
                "limit": limit_usd,
                "spent": spent_usd,
            })),
            Self::Upstream {
                provider,
                attempts,
                status,
                elapsed_ms,
                ..
            } => Some(json!({
                "provider": provider,
                "attempts": attempts,
                "status": status,
                "elapsed_ms": elapsed_ms,
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(HubError::bad_request("x").http_status(), 400);
        assert_eq!(
            HubError::ProviderNotConfigured {
                model: "m".to_string()
            }
            .http_status(),
            503
        );
        assert_eq!(
            HubError::BudgetExceeded {
                window: BudgetWindow::Daily,
                limit_usd: 1.0,
                spent_usd: 1.0,
            }
            .http_status(),
            429
        );
        assert_eq!(HubError::Cancelled { deadline: true }.http_status(), 504);
        assert_eq!(HubError::Cancelled { deadline: false }.http_status(), 499);
        assert_eq!(HubError::persistence("x").http_status(), 500);
    }

    #[test]
    fn rate_limited_upstream_maps_to_429_and_others_to_502() {
        let rate_limited = HubError::Upstream {
            class: ProviderErrorClass::RateLimited,
            provider: "openai".to_string(),
            attempts: 3,
            status: Some(429),
            detail: "slow down".to_string(),
            elapsed_ms: 1200,
        };
        assert_eq!(rate_limited.http_status(), 429);
        assert_eq!(rate_limited.code(), "upstream_rate_limited");

        let auth = HubError::Upstream {
            class: ProviderErrorClass::Auth,
            provider: "openai".to_string(),
            attempts: 1,
            status: Some(401),
            detail: "bad key".to_string(),
            elapsed_ms: 40,
        };
        assert_eq!(auth.http_status(), 502);
        assert_eq!(auth.code(), "auth");
    }

    #[test]
    fn budget_metadata_carries_window_limit_and_spend() {
        let err = HubError::BudgetExceeded {
            window: BudgetWindow::Daily,
            limit_usd: 1.0,
            spent_usd: 1.0,
        };
        let meta = err.metadata().unwrap();
        assert_eq!(meta["window"], "daily");
        assert_eq!(meta["limit"], 1.0);
        assert_eq!(meta["spent"], 1.0);
    }
}
