//! HTTP route handlers and server wiring.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::alerts::AlertDispatcher;
use crate::budget::BudgetEnforcer;
use crate::config::Config;
use crate::error::HubError;
use crate::health::{HealthTracker, SharedHealthTracker};
use crate::monitor::Monitor;
use crate::pipeline::{CallContext, Pipeline, PipelineRequest};
use crate::providers::{ChatMessage, ProviderFamily, Role};
use crate::storage::{ConnectionData, Store};
use crate::vault::Vault;

use super::alerts as alerts_api;
use super::dashboard;
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub vault: Vault,
    pub pipeline: Arc<Pipeline>,
    pub health: SharedHealthTracker,
    pub enforcer: BudgetEnforcer,
}

/// Start the HTTP server; returns when the process is asked to shut down
/// and the background tasks have been joined.
pub async fn serve(config: Config, vault: Vault) -> anyhow::Result<()> {
    let store = Store::open(config.database_path.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    // Shared upstream HTTP client (connection pooling). No global timeout:
    // per-request deadlines are enforced in the executor.
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap_or_default();

    import_env_connections(&store, &vault).await;

    let health: SharedHealthTracker = Arc::new(HealthTracker::new(
        config.alerts.consecutive_error_threshold,
    ));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        store.clone(),
        vault.clone(),
        Arc::clone(&health),
        client.clone(),
    ));
    let enforcer = BudgetEnforcer::new(store.clone());

    // Background tasks share one shutdown token, cancelled on ctrl-c.
    let shutdown = CancellationToken::new();
    let dispatcher = AlertDispatcher::new(&config.alerts, client.clone(), shutdown.clone());
    let monitor = Arc::new(Monitor::new(
        store.clone(),
        Arc::clone(&health),
        enforcer.clone(),
        dispatcher,
        config.alerts.clone(),
        config.health.clone(),
        vault.clone(),
        client.clone(),
    ));
    let monitor_handles = Arc::clone(&monitor).spawn(shutdown.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        vault,
        pipeline,
        health,
        enforcer,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .merge(dashboard::routes())
        .merge(alerts_api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Cancel and join the background loops before exiting.
    shutdown.cancel();
    for handle in monitor_handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}

/// Create connections from well-known environment variables so a fresh
/// install can route without touching the dashboard. Idempotent: families
/// that already have a connection are left alone.
async fn import_env_connections(store: &Store, vault: &Vault) {
    let existing = match store.list_connections().await {
        Ok(connections) => connections,
        Err(e) => {
            tracing::error!(error = %e, "Cannot list connections for environment import");
            return;
        }
    };
    let has_family =
        |family: ProviderFamily| existing.iter().any(|c| c.service == family);

    let candidates: [(&str, ProviderFamily, &str); 2] = [
        ("OPENAI_API_KEY", ProviderFamily::OpenAi, "OpenAI (imported)"),
        (
            "ANTHROPIC_API_KEY",
            ProviderFamily::Anthropic,
            "Anthropic (imported)",
        ),
    ];

    for (var, family, name) in candidates {
        let key = match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => continue,
        };
        if has_family(family) {
            continue;
        }
        let encrypted = match vault.encrypt(&key) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                tracing::error!(var, error = %e, "Cannot encrypt imported credential");
                continue;
            }
        };
        let result = store
            .upsert_connection(
                None,
                ConnectionData {
                    name: name.to_string(),
                    service: family,
                    category: Some("llm".to_string()),
                    base_url: None,
                    api_key_enc: Some(encrypted),
                    token_enc: None,
                    credential_path_enc: None,
                    enabled: true,
                    is_default: false,
                    daily_limit_usd: 0.0,
                    weekly_limit_usd: 0.0,
                    monthly_limit_usd: 0.0,
                },
            )
            .await;
        match result {
            Ok(connection) => {
                tracing::info!(connection_id = connection.id, provider = %family, "Imported connection from environment");
            }
            Err(e) => {
                tracing::error!(provider = %family, error = %e, "Environment import failed");
            }
        }
    }

    if let Ok(base_url) = std::env::var("OLLAMA_BASE_URL") {
        if !base_url.trim().is_empty() && !has_family(ProviderFamily::Ollama) {
            let result = store
                .upsert_connection(
                    None,
                    ConnectionData {
                        name: "Ollama (imported)".to_string(),
                        service: ProviderFamily::Ollama,
                        category: Some("llm".to_string()),
                        base_url: Some(base_url),
                        api_key_enc: None,
                        token_enc: None,
                        credential_path_enc: None,
                        enabled: true,
                        is_default: false,
                        daily_limit_usd: 0.0,
                        weekly_limit_usd: 0.0,
                        monthly_limit_usd: 0.0,
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Ollama environment import failed");
            }
        }
    }
}

/// `GET /health`
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /v1/models`
async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelsView>, ApiError> {
    let grouped = state.pipeline.list_models().await?;
    Ok(Json(ModelsView {
        data: grouped
            .into_iter()
            .map(|(provider, models)| ProviderModels { provider, models })
            .collect(),
    }))
}

fn parse_role(raw: &str) -> Result<Role, HubError> {
    match raw {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(HubError::bad_request(format!(
            "unsupported message role '{}'",
            other
        ))),
    }
}

/// `POST /v1/chat/completions`
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Response, ApiError> {
    if body.stream == Some(true) {
        return Err(ApiError(HubError::bad_request(
            "streaming responses are not supported",
        )));
    }

    let mut messages = Vec::with_capacity(body.messages.len());
    for message in &body.messages {
        messages.push(ChatMessage::new(
            parse_role(&message.role)?,
            message.content.clone(),
        ));
    }

    let request = PipelineRequest {
        model: body.model,
        messages,
        max_tokens: body.max_tokens,
        temperature: body.temperature,
    };

    let outcome = state.pipeline.execute(request, CallContext::default()).await?;

    let view = ChatCompletionView {
        content: outcome.content,
        model: outcome.model,
        provider: outcome.provider,
        prompt_tokens: outcome.prompt_tokens,
        completion_tokens: outcome.completion_tokens,
        total_tokens: outcome.total_tokens,
        cost_usd: outcome.cost_usd,
        latency_ms: outcome.latency_ms,
    };

    let mut response = (StatusCode::OK, Json(view)).into_response();
    if let Some(fallback) = outcome.fallback {
        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static("x-hub-fallback"),
            HeaderValue::from_static("true"),
        );
        if let Ok(value) = HeaderValue::from_str(&fallback.original_provider) {
            headers.insert(HeaderName::from_static("x-hub-original-provider"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&fallback.actual_provider) {
            headers.insert(HeaderName::from_static("x-hub-actual-provider"), value);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_accepts_canonical_roles_only() {
        assert_eq!(parse_role("system").unwrap(), Role::System);
        assert_eq!(parse_role("user").unwrap(), Role::User);
        assert_eq!(parse_role("assistant").unwrap(), Role::Assistant);
        assert!(parse_role("tool").is_err());
        assert!(parse_role("").is_err());
    }

    #[test]
    fn completion_body_defaults() {
        let body: ChatCompletionBody = serde_json::from_str(
            r#"{"model": "local", "messages": [{"role": "user", "content": "hi"}]}"#,
        )
        .unwrap();
        assert_eq!(body.model, "local");
        assert!(body.max_tokens.is_none());
        assert!(body.stream.is_none());
    }
}
