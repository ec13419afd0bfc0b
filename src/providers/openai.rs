//! OpenAI-compatible chat completions client.
//!
//! Serves both the hosted OpenAI family and user-configured custom
//! endpoints; the local (Ollama) adapter delegates here too, since Ollama
//! exposes the same `/v1/chat/completions` compatibility surface.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::error::{parse_retry_after, ProviderError};
use super::{
    compute_cost, ChatMessage, Completion, CompletionRequest, CostRates, ProbeResult,
    ProviderAdapter, ProviderFamily,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible API client.
pub struct OpenAiAdapter {
    family: ProviderFamily,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rates: CostRates,
}

impl OpenAiAdapter {
    pub fn new(
        family: ProviderFamily,
        client: Client,
        base_url: Option<&str>,
        api_key: Option<String>,
        rates: CostRates,
    ) -> Self {
        let base_url = base_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            family,
            client,
            base_url,
            api_key,
            rates,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        self.family
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = ChatCompletionsBody {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        tracing::debug!(provider = %self.family, model = %request.model, "Sending chat completion");

        let response = self
            .post("/v1/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ProviderError::from_status(
                status.as_u16(),
                text,
                retry_after,
            ));
        }

        let parsed: ChatCompletionsResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::transient(None, format!("Failed to parse response: {}", e))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::transient(None, "No choices in response".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            cost_usd: compute_cost(usage.prompt_tokens, usage.completion_tokens, self.rates),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .get("/v1/models")
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ProviderError::from_status(
                status.as_u16(),
                text,
                retry_after,
            ));
        }

        let parsed: ModelsResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::transient(None, format!("Failed to parse model list: {}", e))
        })?;

        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    async fn probe(&self) -> Result<ProbeResult, ProviderError> {
        let start = Instant::now();
        let response = self
            .get("/v1/models")
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        if status.is_success() {
            Ok(ProbeResult {
                latency_ms,
                ok: true,
            })
        } else {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::from_status(
                status.as_u16(),
                text,
                retry_after,
            ))
        }
    }
}

/// Chat completions request body (OpenAI wire format).
#[derive(Debug, Serialize)]
struct ChatCompletionsBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

/// Chat completions response (OpenAI wire format).
#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Role;

    #[test]
    fn request_body_omits_unset_options() {
        let messages = vec![ChatMessage::new(Role::User, "hi")];
        let body = ChatCompletionsBody {
            model: "gpt-4o-mini",
            messages: &messages,
            max_tokens: None,
            temperature: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value.get("max_tokens").is_none());
        assert!(value.get("temperature").is_none());
    }

    #[test]
    fn response_parses_with_and_without_usage() {
        let with_usage = r#"{
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15},
            "model": "gpt-4o-mini"
        }"#;
        let parsed: ChatCompletionsResponse = serde_json::from_str(with_usage).unwrap();
        assert_eq!(parsed.usage.as_ref().unwrap().prompt_tokens, 12);
        assert_eq!(parsed.model.as_deref(), Some("gpt-4o-mini"));

        let without_usage = r#"{"choices": [{"message": {"content": "hello"}}]}"#;
        let parsed: ChatCompletionsResponse = serde_json::from_str(without_usage).unwrap();
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let adapter = OpenAiAdapter::new(
            ProviderFamily::OpenAi,
            Client::new(),
            Some("https://example.com/"),
            None,
            CostRates::default(),
        );
        assert_eq!(adapter.base_url, "https://example.com");
    }
}
