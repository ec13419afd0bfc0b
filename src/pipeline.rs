//! The request pipeline: the canonical request-lifecycle function.
//!
//! Every caller (HTTP completion endpoint, workflow step executor, MCP tool
//! adapter) goes through [`Pipeline::execute`]. Steps run in a fixed order,
//! each a hard gate: resolve model, route, budget pre-flight, execute,
//! persist, update health, return. Exactly one request row is appended per
//! terminating invocation, including budget rejections and total failures;
//! a persistence failure after the upstream already answered is logged
//! loudly but never fails the response.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::budget::BudgetEnforcer;
use crate::config::Config;
use crate::error::HubError;
use crate::executor::{ExecOutcome, Executor, PreparedRoute};
use crate::health::SharedHealthTracker;
use crate::providers::{
    adapter_for, ChatMessage, CompletionRequest, CostRates, CredentialSet, ProviderAdapter,
};
use crate::router::{self, FallbackRules, Route, RoutingRules};
use crate::storage::{NewApiCall, NewRequest, Store};
use crate::vault::Vault;

/// Builds the adapter for one routed hop; swappable so tests can script
/// upstream behaviour.
pub type AdapterFactory =
    Arc<dyn Fn(&Route, CredentialSet, CostRates) -> Box<dyn ProviderAdapter> + Send + Sync>;

/// A caller's completion request in canonical form.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

/// Per-call context: identity of the calling surface plus cancellation.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Workflow name when invoked by the workflow engine.
    pub workflow: Option<String>,
    /// Caller-supplied deadline override.
    pub deadline: Option<Duration>,
    /// Cancelled when the caller goes away.
    pub cancel: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            workflow: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Fallback provenance for observability headers.
#[derive(Debug, Clone)]
pub struct FallbackInfo {
    pub original_provider: String,
    pub actual_provider: String,
}

/// The normalised pipeline response.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub fallback: Option<FallbackInfo>,
}

/// The orchestration spine shared by all entry points.
pub struct Pipeline {
    store: Store,
    vault: Vault,
    enforcer: BudgetEnforcer,
    executor: Executor,
    health: SharedHealthTracker,
    routing_rules: RoutingRules,
    fallback_rules: FallbackRules,
    local_model: String,
    request_deadline: Duration,
    adapter_factory: AdapterFactory,
    /// Models already warned about missing pricing (one warning per model).
    unpriced_warned: Mutex<HashSet<String>>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        store: Store,
        vault: Vault,
        health: SharedHealthTracker,
        client: reqwest::Client,
    ) -> Self {
        let factory_client = client;
        let adapter_factory: AdapterFactory = Arc::new(move |route, credentials, rates| {
            adapter_for(
                route.family,
                route.connection.base_url.as_deref(),
                &credentials,
                rates,
                factory_client.clone(),
            )
        });
        Self::with_adapter_factory(config, store, vault, health, adapter_factory)
    }

    /// Construct with a custom adapter factory (test seam).
    pub fn with_adapter_factory(
        config: &Config,
        store: Store,
        vault: Vault,
        health: SharedHealthTracker,
        adapter_factory: AdapterFactory,
    ) -> Self {
        Self {
            enforcer: BudgetEnforcer::new(store.clone()),
            executor: Executor::new(config.retry.clone()),
            store,
            vault,
            health,
            routing_rules: config.routing_rules.clone(),
            fallback_rules: config.fallback_rules.clone(),
            local_model: config.local_model.clone(),
            request_deadline: config.request_deadline,
            adapter_factory,
            unpriced_warned: Mutex::new(HashSet::new()),
        }
    }

    /// Run one request through the full lifecycle.
    pub async fn execute(
        &self,
        request: PipelineRequest,
        ctx: CallContext,
    ) -> Result<PipelineResponse, HubError> {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "pipeline",
            %correlation_id,
            model = %request.model,
            workflow = ctx.workflow.as_deref().unwrap_or(""),
        );
        self.execute_inner(request, ctx).instrument(span).await
    }

    async fn execute_inner(
        &self,
        request: PipelineRequest,
        ctx: CallContext,
    ) -> Result<PipelineResponse, HubError> {
        let started = std::time::Instant::now();

        // Step 1: resolve model (and validate caller input).
        let resolved_model = match self.resolve_model(&request) {
            Ok(model) => model,
            Err(err) => {
                self.persist_failure(&request.model, "", &err, started, &ctx)
                    .await;
                return Err(err);
            }
        };
        tracing::debug!(resolved_model = %resolved_model, "Model resolved");

        // Step 2: route.
        let connections = self.store.list_connections().await?;
        let chain = router::plan(
            &resolved_model,
            &connections,
            &self.routing_rules,
            &self.fallback_rules,
        );
        let primary = match chain.first() {
            Some(primary) => primary.clone(),
            None => {
                let err = HubError::ProviderNotConfigured {
                    model: resolved_model.clone(),
                };
                self.persist_failure(&resolved_model, "", &err, started, &ctx)
                    .await;
                return Err(err);
            }
        };
        tracing::debug!(
            primary = %primary.family,
            chain_len = chain.len(),
            "Route resolved"
        );

        // Step 3: budget pre-flight on the primary connection only; fallback
        // budgets are accepted best-effort.
        if let Err(err) = self.enforcer.check(&primary.connection).await {
            tracing::warn!(provider = %primary.family, error = %err, "Budget pre-flight rejected");
            self.persist_failure(&resolved_model, primary.family.as_str(), &err, started, &ctx)
                .await;
            return Err(err);
        }

        // Step 4: execute through the retry/fallback executor.
        let prepared = match self.prepare_chain(&chain, &resolved_model).await {
            Ok(prepared) => prepared,
            Err(err) => {
                self.persist_failure(&resolved_model, primary.family.as_str(), &err, started, &ctx)
                    .await;
                return Err(err);
            }
        };
        let completion_request = CompletionRequest {
            model: resolved_model.clone(),
            messages: request.messages.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let deadline = tokio::time::Instant::now() + ctx.deadline.unwrap_or(self.request_deadline);

        let outcome = self
            .executor
            .execute(&prepared, &completion_request, deadline, &ctx.cancel)
            .await;

        match outcome {
            Ok(exec) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                // Step 5: persist. The response exists; a write failure is
                // loud but not fatal.
                let row = NewRequest {
                    model: resolved_model.clone(),
                    provider: exec.provider.clone(),
                    prompt_tokens: exec.completion.prompt_tokens,
                    completion_tokens: exec.completion.completion_tokens,
                    cost_usd: exec.completion.cost_usd,
                    latency_ms,
                    success: true,
                    error: None,
                    workflow: ctx.workflow.clone(),
                };
                if let Err(e) = self.store.insert_request(row).await {
                    tracing::error!(
                        error = %e,
                        "PERSISTENCE FAILURE: completed request row was not recorded"
                    );
                }

                // Step 6: update health.
                self.health.record_outcome(exec.connection_id, true).await;

                // Step 7: return the normalised response.
                Ok(self.build_response(exec, resolved_model, latency_ms))
            }
            Err(err) => {
                let provider = match &err {
                    HubError::Upstream { provider, .. } => provider.clone(),
                    _ => primary.family.as_str().to_string(),
                };
                self.persist_failure(&resolved_model, &provider, &err, started, &ctx)
                    .await;

                // Terminal upstream failures count against the provider that
                // produced them; cancellations are not an outcome.
                if matches!(err, HubError::Upstream { .. }) {
                    if let Some(route) = chain
                        .iter()
                        .find(|route| route.family.as_str() == provider)
                    {
                        self.health
                            .record_outcome(route.connection.id, false)
                            .await;
                    }
                }
                Err(err)
            }
        }
    }

    /// List advertised models per enabled connection, grouped by family.
    ///
    /// Providers that fail to answer are logged and omitted. Each upstream
    /// listing is recorded on the `api_calls` ledger.
    pub async fn list_models(&self) -> Result<Vec<(String, Vec<String>)>, HubError> {
        let connections = self.store.list_connections().await?;
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();

        for connection in connections.iter().filter(|c| c.enabled) {
            let route = Route {
                family: connection.service,
                connection: connection.clone(),
            };
            let credentials = self.decrypt_credentials(&route)?;
            let adapter = (self.adapter_factory)(&route, credentials, CostRates::default());
            let call_started = std::time::Instant::now();
            let result = adapter.list_models().await;

            let ledger_row = NewApiCall {
                service: connection.service.as_str().to_string(),
                operation: "list_models".to_string(),
                endpoint: "/v1/models".to_string(),
                method: "GET".to_string(),
                status_code: result.as_ref().err().and_then(|e| e.status),
                latency_ms: call_started.elapsed().as_millis() as u64,
                cost_usd: 0.0,
                metadata: serde_json::json!({"connection_id": connection.id}),
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            };
            if let Err(e) = self.store.insert_api_call(ledger_row).await {
                tracing::error!(error = %e, "PERSISTENCE FAILURE: api call row was not recorded");
            }

            match result {
                Ok(models) => {
                    let family = connection.service.as_str().to_string();
                    match grouped.iter_mut().find(|(f, _)| *f == family) {
                        Some((_, existing)) => {
                            for model in models {
                                if !existing.contains(&model) {
                                    existing.push(model);
                                }
                            }
                        }
                        None => grouped.push((family, models)),
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = connection.id,
                        provider = %connection.service,
                        error = %e,
                        "Model listing failed for provider"
                    );
                }
            }
        }
        Ok(grouped)
    }

    fn resolve_model(&self, request: &PipelineRequest) -> Result<String, HubError> {
        let model = request.model.trim();
        if model.is_empty() {
            return Err(HubError::bad_request("model must not be empty"));
        }
        if request.messages.is_empty() {
            return Err(HubError::bad_request("messages must not be empty"));
        }
        if request.max_tokens == Some(0) {
            return Err(HubError::bad_request("max_tokens must be positive"));
        }
        Ok(if model == "local" {
            self.local_model.clone()
        } else {
            model.to_string()
        })
    }

    fn decrypt_credentials(&self, route: &Route) -> Result<CredentialSet, HubError> {
        let decrypt = |value: Option<&str>| -> Result<Option<String>, HubError> {
            value
                .map(|raw| self.vault.decrypt(raw))
                .transpose()
                .map_err(|e| HubError::internal(format!("credential decryption failed: {}", e)))
        };
        Ok(CredentialSet {
            api_key: decrypt(route.connection.api_key_enc.as_deref())?,
            token: decrypt(route.connection.token_enc.as_deref())?,
            credential_path: decrypt(route.connection.credential_path_enc.as_deref())?,
        })
    }

    async fn prepare_chain(
        &self,
        chain: &[Route],
        model: &str,
    ) -> Result<Vec<PreparedRoute>, HubError> {
        let mut prepared = Vec::with_capacity(chain.len());
        for route in chain {
            let credentials = self.decrypt_credentials(route)?;
            let rates = self
                .store
                .resolve_cost_config(route.connection.id, model.to_string())
                .await?
                .map(|config| CostRates {
                    input_usd_per_million: config.input_usd_per_million,
                    output_usd_per_million: config.output_usd_per_million,
                })
                .unwrap_or_default();

            if rates.is_zero() && !route.family.is_local() {
                let mut warned = self.unpriced_warned.lock().unwrap();
                if warned.insert(model.to_string()) {
                    tracing::warn!(
                        model,
                        provider = %route.family,
                        "No cost config for cloud model; cost will be recorded as zero"
                    );
                }
            }

            prepared.push(PreparedRoute {
                family: route.family,
                connection_id: route.connection.id,
                adapter: (self.adapter_factory)(route, credentials, rates),
            });
        }
        Ok(prepared)
    }

    async fn persist_failure(
        &self,
        model: &str,
        provider: &str,
        err: &HubError,
        started: std::time::Instant,
        ctx: &CallContext,
    ) {
        let row = NewRequest {
            model: model.to_string(),
            provider: provider.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            latency_ms: started.elapsed().as_millis() as u64,
            success: false,
            error: Some(err.code().to_string()),
            workflow: ctx.workflow.clone(),
        };
        if let Err(e) = self.store.insert_request(row).await {
            tracing::error!(
                error = %e,
                "PERSISTENCE FAILURE: failed request row was not recorded"
            );
        }
    }

    fn build_response(
        &self,
        exec: ExecOutcome,
        model: String,
        latency_ms: u64,
    ) -> PipelineResponse {
        let fallback = if exec.fallback {
            Some(FallbackInfo {
                original_provider: exec.original_provider.clone(),
                actual_provider: exec.provider.clone(),
            })
        } else {
            None
        };
        PipelineResponse {
            content: exec.completion.content,
            model,
            provider: exec.provider,
            prompt_tokens: exec.completion.prompt_tokens,
            completion_tokens: exec.completion.completion_tokens,
            total_tokens: exec
                .completion
                .prompt_tokens
                .saturating_add(exec.completion.completion_tokens),
            cost_usd: exec.completion.cost_usd,
            latency_ms,
            fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthTracker;
    use crate::providers::{
        Completion, ProbeResult, ProviderError, ProviderFamily, Role,
    };
    use crate::storage::{ConnectionData, NewRequest};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Factory-driven mock: scripts outcomes per provider family.
    struct ScriptedAdapter {
        family: ProviderFamily,
        script: Arc<Mutex<VecDeque<Result<Completion, ProviderError>>>>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn family(&self) -> ProviderFamily {
            self.family
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::transient(None, "script empty".to_string())))
        }

        async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec![format!("{}-model", self.family)])
        }

        async fn probe(&self) -> Result<ProbeResult, ProviderError> {
            Ok(ProbeResult {
                latency_ms: 1,
                ok: true,
            })
        }
    }

    /// Shared scripts/counters per family, handed out by the factory.
    #[derive(Clone, Default)]
    struct Scripts {
        inner: Arc<Mutex<HashMap<ProviderFamily, Arc<Mutex<VecDeque<Result<Completion, ProviderError>>>>>>>,
        calls: Arc<Mutex<HashMap<ProviderFamily, Arc<AtomicU32>>>>,
    }

    impl Scripts {
        fn set(&self, family: ProviderFamily, script: Vec<Result<Completion, ProviderError>>) {
            self.inner
                .lock()
                .unwrap()
                .insert(family, Arc::new(Mutex::new(script.into())));
        }

        fn calls(&self, family: ProviderFamily) -> u32 {
            self.calls
                .lock()
                .unwrap()
                .get(&family)
                .map(|c| c.load(Ordering::SeqCst))
                .unwrap_or(0)
        }

        fn factory(&self) -> AdapterFactory {
            let scripts = self.clone();
            Arc::new(move |route, _credentials, _rates| {
                let script = scripts
                    .inner
                    .lock()
                    .unwrap()
                    .entry(route.family)
                    .or_default()
                    .clone();
                let calls = scripts
                    .calls
                    .lock()
                    .unwrap()
                    .entry(route.family)
                    .or_insert_with(|| Arc::new(AtomicU32::new(0)))
                    .clone();
                Box::new(ScriptedAdapter {
                    family: route.family,
                    script,
                    calls,
                })
            })
        }
    }

    fn completion(cost: f64) -> Completion {
        Completion {
            content: "hello back".to_string(),
            prompt_tokens: 12,
            completion_tokens: 4,
            model: "echoed".to_string(),
            cost_usd: cost,
        }
    }

    fn user_request(model: &str) -> PipelineRequest {
        PipelineRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            max_tokens: Some(10),
            temperature: None,
        }
    }

    struct Harness {
        pipeline: Pipeline,
        store: Store,
        scripts: Scripts,
        _dir: tempfile::TempDir,
    }

    async fn harness(config: Config) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("hub.db")).await.unwrap();
        let scripts = Scripts::default();
        let pipeline = Pipeline::with_adapter_factory(
            &config,
            store.clone(),
            Vault::new([3u8; 32]),
            Arc::new(HealthTracker::new(3)),
            scripts.factory(),
        );
        Harness {
            pipeline,
            store,
            scripts,
            _dir: dir,
        }
    }

    async fn add_connection(
        store: &Store,
        family: ProviderFamily,
        daily_limit: f64,
    ) -> crate::storage::ConnectionRecord {
        store
            .upsert_connection(
                None,
                ConnectionData {
                    name: format!("{} connection", family),
                    service: family,
                    category: None,
                    base_url: None,
                    api_key_enc: None,
                    token_enc: None,
                    credential_path_enc: None,
                    enabled: true,
                    is_default: false,
                    daily_limit_usd: daily_limit,
                    weekly_limit_usd: 0.0,
                    monthly_limit_usd: 0.0,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_local_model() {
        let h = harness(Config::default()).await;
        add_connection(&h.store, ProviderFamily::Ollama, 0.0).await;
        h.scripts
            .set(ProviderFamily::Ollama, vec![Ok(completion(0.0))]);

        let response = h
            .pipeline
            .execute(user_request("qwen2.5:32b"), CallContext::default())
            .await
            .unwrap();

        assert_eq!(response.content, "hello back");
        assert_eq!(response.cost_usd, 0.0);
        assert_eq!(response.provider, "ollama");
        assert_eq!(response.total_tokens, 16);
        assert!(response.fallback.is_none());
        assert_eq!(h.scripts.calls(ProviderFamily::Ollama), 1);

        let rows = h.store.recent_requests(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].success);
        assert_eq!(rows[0].provider, "ollama");
        assert_eq!(rows[0].model, "qwen2.5:32b");
    }

    #[tokio::test]
    async fn local_alias_resolves_before_dispatch() {
        let h = harness(Config::default()).await;
        add_connection(&h.store, ProviderFamily::Ollama, 0.0).await;
        h.scripts
            .set(ProviderFamily::Ollama, vec![Ok(completion(0.0))]);

        h.pipeline
            .execute(user_request("local"), CallContext::default())
            .await
            .unwrap();

        let rows = h.store.recent_requests(1).await.unwrap();
        // The persisted model is the resolved one, never the alias
        assert_eq!(rows[0].model, Config::default().local_model);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_openai_falls_back_to_ollama() {
        let mut config = Config::default();
        config.fallback_rules = FallbackRules::from_spec("openai:ollama").unwrap();
        let h = harness(config).await;
        add_connection(&h.store, ProviderFamily::OpenAi, 0.0).await;
        add_connection(&h.store, ProviderFamily::Ollama, 0.0).await;

        let rate_limit = || Err(ProviderError::rate_limited("slow down".to_string(), None));
        h.scripts.set(
            ProviderFamily::OpenAi,
            vec![rate_limit(), rate_limit(), rate_limit()],
        );
        h.scripts
            .set(ProviderFamily::Ollama, vec![Ok(completion(0.0))]);

        let response = h
            .pipeline
            .execute(user_request("gpt-4o-mini"), CallContext::default())
            .await
            .unwrap();

        let fallback = response.fallback.expect("fallback annotation");
        assert_eq!(fallback.original_provider, "openai");
        assert_eq!(fallback.actual_provider, "ollama");
        assert_eq!(h.scripts.calls(ProviderFamily::OpenAi), 3);
        assert_eq!(h.scripts.calls(ProviderFamily::Ollama), 1);

        let rows = h.store.recent_requests(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provider, "ollama");
        assert!(rows[0].success);
    }

    #[tokio::test]
    async fn budget_exceeded_rejects_without_upstream_call() {
        let h = harness(Config::default()).await;
        add_connection(&h.store, ProviderFamily::OpenAi, 1.0).await;
        h.store
            .insert_request(NewRequest {
                model: "gpt-4o-mini".to_string(),
                provider: "openai".to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                cost_usd: 1.0,
                latency_ms: 10,
                success: true,
                error: None,
                workflow: None,
            })
            .await
            .unwrap();

        let err = h
            .pipeline
            .execute(user_request("gpt-4o-mini"), CallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::BudgetExceeded { .. }));
        assert_eq!(h.scripts.calls(ProviderFamily::OpenAi), 0);

        let rows = h.store.recent_requests(1).await.unwrap();
        assert!(!rows[0].success);
        assert_eq!(rows[0].error.as_deref(), Some("budget_exceeded"));
    }

    #[tokio::test]
    async fn budget_override_allows_the_call() {
        let h = harness(Config::default()).await;
        let connection = add_connection(&h.store, ProviderFamily::OpenAi, 1.0).await;
        h.store
            .insert_request(NewRequest {
                model: "gpt-4o-mini".to_string(),
                provider: "openai".to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                cost_usd: 1.0,
                latency_ms: 10,
                success: true,
                error: None,
                workflow: None,
            })
            .await
            .unwrap();
        // Override set 10 minutes ago for an hour: still in effect
        h.store
            .set_budget_override(
                connection.id,
                Utc::now() + chrono::Duration::minutes(50),
            )
            .await
            .unwrap();

        h.scripts
            .set(ProviderFamily::OpenAi, vec![Ok(completion(0.01))]);
        let response = h
            .pipeline
            .execute(user_request("gpt-4o-mini"), CallContext::default())
            .await
            .unwrap();
        assert_eq!(response.provider, "openai");
        assert_eq!(h.scripts.calls(ProviderFamily::OpenAi), 1);
    }

    #[tokio::test]
    async fn bad_input_rejected_and_still_persisted() {
        let h = harness(Config::default()).await;
        add_connection(&h.store, ProviderFamily::Ollama, 0.0).await;

        let empty_model = PipelineRequest {
            model: "  ".to_string(),
            ..user_request("x")
        };
        assert!(matches!(
            h.pipeline
                .execute(empty_model, CallContext::default())
                .await,
            Err(HubError::BadRequest { .. })
        ));

        let no_messages = PipelineRequest {
            messages: vec![],
            ..user_request("local")
        };
        assert!(matches!(
            h.pipeline
                .execute(no_messages, CallContext::default())
                .await,
            Err(HubError::BadRequest { .. })
        ));

        let zero_tokens = PipelineRequest {
            max_tokens: Some(0),
            ..user_request("local")
        };
        assert!(matches!(
            h.pipeline
                .execute(zero_tokens, CallContext::default())
                .await,
            Err(HubError::BadRequest { .. })
        ));

        // Exactly one row per terminating invocation
        let rows = h.store.recent_requests(10).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| !r.success));
        assert!(rows
            .iter()
            .all(|r| r.error.as_deref() == Some("bad_request")));
    }

    #[tokio::test]
    async fn unrouteable_model_is_provider_not_configured() {
        let h = harness(Config::default()).await;
        // No connections at all
        let err = h
            .pipeline
            .execute(user_request("gpt-4o-mini"), CallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ProviderNotConfigured { .. }));

        let rows = h.store.recent_requests(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].error.as_deref(),
            Some("provider_not_configured")
        );
    }

    #[tokio::test]
    async fn exhausted_chain_persists_terminal_failure() {
        let h = harness(Config::default()).await;
        add_connection(&h.store, ProviderFamily::OpenAi, 0.0).await;
        h.scripts.set(
            ProviderFamily::OpenAi,
            vec![Err(ProviderError::auth(401, "bad key".to_string()))],
        );

        let err = h
            .pipeline
            .execute(user_request("gpt-4o-mini"), CallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Upstream { .. }));

        let rows = h.store.recent_requests(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].success);
        assert_eq!(rows[0].error.as_deref(), Some("auth"));
        assert_eq!(rows[0].provider, "openai");
    }

    #[tokio::test]
    async fn workflow_name_lands_on_the_row() {
        let h = harness(Config::default()).await;
        add_connection(&h.store, ProviderFamily::Ollama, 0.0).await;
        h.scripts
            .set(ProviderFamily::Ollama, vec![Ok(completion(0.0))]);

        let ctx = CallContext {
            workflow: Some("nightly-digest".to_string()),
            ..CallContext::default()
        };
        h.pipeline
            .execute(user_request("local"), ctx)
            .await
            .unwrap();

        let rows = h.store.recent_requests(1).await.unwrap();
        assert_eq!(rows[0].workflow.as_deref(), Some("nightly-digest"));
    }

    #[tokio::test]
    async fn list_models_groups_by_family() {
        let h = harness(Config::default()).await;
        add_connection(&h.store, ProviderFamily::Ollama, 0.0).await;
        add_connection(&h.store, ProviderFamily::OpenAi, 0.0).await;

        let grouped = h.pipeline.list_models().await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert!(grouped
            .iter()
            .any(|(family, models)| family == "ollama" && models == &vec!["ollama-model"]));

        // Each upstream listing lands on the api_calls ledger
        let calls = h.store.recent_api_calls(10).await.unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.operation == "list_models" && c.success));
    }
}
