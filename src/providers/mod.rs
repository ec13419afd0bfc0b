//! Provider adapters: one client per upstream protocol family.
//!
//! Callers and the pipeline speak the canonical OpenAI-compatible shape;
//! each adapter translates to its provider's native wire format. All
//! adapters implement the same capability set (complete / list models /
//! probe) so the router can hand the executor an ordered chain of them.

mod anthropic;
mod error;
mod ollama;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use error::{classify_http_status, parse_retry_after, ProviderError, ProviderErrorClass};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Upstream protocol family a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    /// Hosted OpenAI-compatible chat API
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Local OpenAI-compatible server (Ollama and friends)
    Ollama,
    /// User-supplied OpenAI-compatible endpoint
    Custom,
}

impl ProviderFamily {
    /// Stable key used in the database `provider`/`service` columns and in
    /// routing/fallback rule specs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::Custom => "custom",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "ollama" | "local" => Some(Self::Ollama),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Whether models on this family are free by default (no cost config).
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama)
    }
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the canonical (OpenAI-compatible) shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A normalised completion request, as handed to an adapter.
///
/// The model name here is already alias-resolved; adapters never see the
/// `local` alias.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

/// A normalised completion response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// The model name the upstream echoed back.
    pub model: String,
    /// Cost attributed by the adapter from its cost rates.
    pub cost_usd: f64,
}

/// Outcome of a health probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub latency_ms: u64,
    pub ok: bool,
}

/// USD-per-million-token rates resolved for a (connection, model) pair.
///
/// Zero rates mean the model is free (local) or unpriced.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostRates {
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
}

impl CostRates {
    pub fn is_zero(&self) -> bool {
        self.input_usd_per_million == 0.0 && self.output_usd_per_million == 0.0
    }
}

/// Compute request cost in USD from token usage and per-million rates.
pub fn compute_cost(prompt_tokens: u64, completion_tokens: u64, rates: CostRates) -> f64 {
    (prompt_tokens as f64 * rates.input_usd_per_million
        + completion_tokens as f64 * rates.output_usd_per_million)
        / 1e6
}

/// Decrypted credential triple for one connection.
///
/// Held in memory only for the duration of a request; never serialized,
/// never logged.
#[derive(Clone, Default)]
pub struct CredentialSet {
    pub api_key: Option<String>,
    pub token: Option<String>,
    pub credential_path: Option<String>,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("api_key", &self.api_key.as_deref().map(crate::vault::mask))
            .field("token", &self.token.as_deref().map(crate::vault::mask))
            .finish_non_exhaustive()
    }
}

/// The capability set every provider family implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider family key for logs, persistence, and health tracking.
    fn family(&self) -> ProviderFamily;

    /// Run one chat completion against the upstream.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;

    /// List model identifiers the upstream advertises.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    /// Cheap reachability check; used by the health monitor only.
    async fn probe(&self) -> Result<ProbeResult, ProviderError>;
}

/// Build the adapter for a provider family.
///
/// `Custom` connections speak the OpenAI-compatible protocol against their
/// configured base URL.
pub fn adapter_for(
    family: ProviderFamily,
    base_url: Option<&str>,
    credentials: &CredentialSet,
    rates: CostRates,
    client: reqwest::Client,
) -> Box<dyn ProviderAdapter> {
    match family {
        ProviderFamily::Anthropic => Box::new(AnthropicAdapter::new(
            client,
            base_url,
            credentials.api_key.clone().unwrap_or_default(),
            rates,
        )),
        ProviderFamily::Ollama => Box::new(OllamaAdapter::new(client, base_url, rates)),
        ProviderFamily::OpenAi | ProviderFamily::Custom => Box::new(OpenAiAdapter::new(
            family,
            client,
            base_url,
            credentials.api_key.clone(),
            rates,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_keys_roundtrip() {
        for family in [
            ProviderFamily::OpenAi,
            ProviderFamily::Anthropic,
            ProviderFamily::Ollama,
            ProviderFamily::Custom,
        ] {
            assert_eq!(ProviderFamily::from_str(family.as_str()), Some(family));
        }
        assert_eq!(ProviderFamily::from_str("local"), Some(ProviderFamily::Ollama));
        assert_eq!(ProviderFamily::from_str("nope"), None);
    }

    #[test]
    fn cost_uses_per_million_rates() {
        let rates = CostRates {
            input_usd_per_million: 3.0,
            output_usd_per_million: 15.0,
        };
        // 1000 in + 500 out = 0.003 + 0.0075 USD
        let cost = compute_cost(1000, 500, rates);
        assert!((cost - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn zero_rates_cost_nothing() {
        assert_eq!(compute_cost(1_000_000, 1_000_000, CostRates::default()), 0.0);
    }

    #[test]
    fn credential_debug_never_prints_plaintext() {
        let creds = CredentialSet {
            api_key: Some("sk-abcdefghijklmnop".to_string()),
            token: None,
            credential_path: None,
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("sk-abcdefghijklmnop"));
        assert!(rendered.contains("sk-a...mnop"));
    }
}
