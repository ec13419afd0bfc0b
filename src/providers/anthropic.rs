//! Anthropic messages API client.
//!
//! The canonical message list puts the system prompt inline as a `system`
//! role message; Anthropic wants it as a top-level parameter, so it is
//! extracted here before dispatch.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::error::{parse_retry_after, ProviderError};
use super::{
    compute_cost, Completion, CompletionRequest, CostRates, ProbeResult, ProviderAdapter,
    ProviderFamily, Role,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Output tokens requested when the caller left `max_tokens` unset; the
/// messages API requires an explicit value.
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Anthropic messages API client.
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    rates: CostRates,
}

impl AnthropicAdapter {
    pub fn new(client: Client, base_url: Option<&str>, api_key: String, rates: CostRates) -> Self {
        let base_url = base_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            client,
            base_url,
            api_key,
            rates,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        // Pull system messages out of the conversation; Anthropic takes them
        // as a separate top-level parameter.
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(&message.content),
                Role::User => messages.push(WireMessage {
                    role: "user",
                    content: &message.content,
                }),
                Role::Assistant => messages.push(WireMessage {
                    role: "assistant",
                    content: &message.content,
                }),
            }
        }

        let body = MessagesBody {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
        };

        tracing::debug!(provider = "anthropic", model = %request.model, "Sending messages request");

        let response = self
            .request(reqwest::Method::POST, "/v1/messages")
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

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::transient(None, format!("Failed to parse response: {}", e))
        })?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            content,
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            cost_usd: compute_cost(
                parsed.usage.input_tokens,
                parsed.usage.output_tokens,
                self.rates,
            ),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .request(reqwest::Method::GET, "/v1/models")
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
            .request(reqwest::Method::GET, "/v1/models")
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

/// Messages API request body.
#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Messages API response.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: WireUsage,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
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
    use crate::providers::ChatMessage;

    #[test]
    fn system_messages_leave_the_conversation() {
        let request = CompletionRequest {
            model: "claude-3-5-haiku-latest".to_string(),
            messages: vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "hi"),
            ],
            max_tokens: Some(64),
            temperature: None,
        };

        let mut system_parts: Vec<&str> = Vec::new();
        let mut conversation = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(&message.content),
                _ => conversation.push(message),
            }
        }
        assert_eq!(system_parts, vec!["be brief"]);
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn response_concatenates_text_blocks() {
        let raw = r#"{
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": ", world"}],
            "usage": {"input_tokens": 10, "output_tokens": 4},
            "model": "claude-3-5-haiku-latest"
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let content: String = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect();
        assert_eq!(content, "Hello, world");
        assert_eq!(parsed.usage.input_tokens, 10);
    }

    #[test]
    fn wire_body_shape() {
        let body = MessagesBody {
            model: "claude-3-5-haiku-latest",
            messages: vec![WireMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: 64,
            temperature: None,
            system: Some("be brief".to_string()),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["system"], "be brief");
        assert_eq!(value["max_tokens"], 64);
        assert!(value.get("temperature").is_none());
    }
}
