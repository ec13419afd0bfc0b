//! Local OpenAI-compatible server adapter (Ollama and similar).
//!
//! Ollama exposes an OpenAI compatibility surface at `/v1/chat/completions`,
//! which this adapter uses in preference to the native API so the wire shape
//! stays uniform. The `local` model alias is resolved to a concrete model
//! name before the request reaches this adapter.

use async_trait::async_trait;
use reqwest::Client;

use super::error::ProviderError;
use super::{
    Completion, CompletionRequest, CostRates, OpenAiAdapter, ProbeResult, ProviderAdapter,
    ProviderFamily,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Adapter for local OpenAI-compatible inference servers.
pub struct OllamaAdapter {
    inner: OpenAiAdapter,
}

impl OllamaAdapter {
    pub fn new(client: Client, base_url: Option<&str>, rates: CostRates) -> Self {
        let base_url = base_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_BASE_URL);
        // No auth: local servers are unauthenticated by default.
        Self {
            inner: OpenAiAdapter::new(
                ProviderFamily::Ollama,
                client,
                Some(base_url),
                None,
                rates,
            ),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Ollama
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.inner.complete(request).await
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_models().await
    }

    async fn probe(&self) -> Result<ProbeResult, ProviderError> {
        self.inner.probe().await
    }
}
