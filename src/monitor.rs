//! Background health monitor and alert manager.
//!
//! Two cooperating single-instance loops, registered at startup and
//! cancelled/joined on shutdown:
//!
//! - the probe loop actively probes providers that are currently degraded
//!   or errored (healthy providers are probed passively by real traffic);
//! - the alert loop evaluates three independent conditions per enabled
//!   connection (consecutive errors, latency spike, budget threshold),
//!   raising deduplicated alerts and auto-resolving ones whose condition
//!   has cleared.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertDispatcher;
use crate::budget::BudgetEnforcer;
use crate::config::{AlertSettings, HealthSettings};
use crate::health::SharedHealthTracker;
use crate::providers::{adapter_for, CostRates, CredentialSet};
use crate::storage::{AlertKind, AlertSeverity, ConnectionRecord, Store};
use crate::vault::Vault;

/// How far back the consecutive-errors condition looks.
const ERROR_LOOKBACK_MINUTES: i64 = 10;

/// Rolling window of successful latencies compared against the baseline.
const LATENCY_RECENT_SAMPLES: usize = 10;

/// Baseline population size (median of these precedes the recent window).
const LATENCY_BASELINE_SAMPLES: usize = 100;

/// Minimum baseline samples before the latency condition is evaluated.
const LATENCY_MIN_BASELINE: usize = 10;

pub struct Monitor {
    store: Store,
    health: SharedHealthTracker,
    enforcer: BudgetEnforcer,
    dispatcher: AlertDispatcher,
    alert_settings: AlertSettings,
    health_settings: HealthSettings,
    vault: Vault,
    client: reqwest::Client,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        health: SharedHealthTracker,
        enforcer: BudgetEnforcer,
        dispatcher: AlertDispatcher,
        alert_settings: AlertSettings,
        health_settings: HealthSettings,
        vault: Vault,
        client: reqwest::Client,
    ) -> Self {
        Self {
            store,
            health,
            enforcer,
            dispatcher,
            alert_settings,
            health_settings,
            vault,
            client,
        }
    }

    /// Spawn both loops; the returned handles complete once `shutdown`
    /// fires and the current cycle finishes.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let monitor = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                monitor.probe_loop(shutdown).await;
            }));
        }

        if self.alert_settings.enabled {
            let monitor = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                monitor.alert_loop(shutdown).await;
            }));
        } else {
            tracing::info!("Alert manager disabled by configuration");
        }

        handles
    }

    async fn probe_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.health_settings.probe_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.run_probe_cycle().await,
            }
        }
        tracing::debug!("Probe loop stopped");
    }

    async fn alert_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.alert_settings.check_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.run_alert_cycle().await,
            }
        }
        tracing::debug!("Alert loop stopped");
    }

    /// One probe pass over every unhealthy, enabled connection.
    pub async fn run_probe_cycle(&self) {
        let unhealthy = self.health.unhealthy_ids().await;
        for connection_id in unhealthy {
            let connection = match self.store.get_connection(connection_id).await {
                Ok(Some(connection)) if connection.enabled => connection,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(connection_id, error = %e, "Probe cycle read failed");
                    continue;
                }
            };

            let ok = self.probe_connection(&connection).await;
            self.health.record_probe(connection_id, ok).await;
            tracing::debug!(
                connection_id,
                provider = %connection.service,
                ok,
                "Probe completed"
            );
        }
    }

    async fn probe_connection(&self, connection: &ConnectionRecord) -> bool {
        let credentials = match self.decrypt_credentials(connection) {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!(
                    connection_id = connection.id,
                    error = %e,
                    "Cannot decrypt credentials for probe"
                );
                return false;
            }
        };

        let adapter = adapter_for(
            connection.service,
            connection.base_url.as_deref(),
            &credentials,
            CostRates::default(),
            self.client.clone(),
        );

        matches!(
            tokio::time::timeout(self.health_settings.probe_timeout, adapter.probe()).await,
            Ok(Ok(result)) if result.ok
        )
    }

    fn decrypt_credentials(&self, connection: &ConnectionRecord) -> anyhow::Result<CredentialSet> {
        Ok(CredentialSet {
            api_key: connection
                .api_key_enc
                .as_deref()
                .map(|raw| self.vault.decrypt(raw))
                .transpose()?,
            token: connection
                .token_enc
                .as_deref()
                .map(|raw| self.vault.decrypt(raw))
                .transpose()?,
            credential_path: connection
                .credential_path_enc
                .as_deref()
                .map(|raw| self.vault.decrypt(raw))
                .transpose()?,
        })
    }

    /// One evaluation pass over every enabled connection.
    pub async fn run_alert_cycle(&self) {
        let connections = match self.store.list_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                tracing::error!(error = %e, "Alert cycle read failed");
                return;
            }
        };

        for connection in connections.iter().filter(|c| c.enabled) {
            self.check_consecutive_errors(connection).await;
            self.check_latency_spike(connection).await;
            self.check_budget_threshold(connection).await;
        }
    }

    async fn raise_or_resolve(
        &self,
        connection: &ConnectionRecord,
        kind: AlertKind,
        severity: AlertSeverity,
        fired: bool,
        message: String,
        metadata: serde_json::Value,
    ) {
        if fired {
            match self
                .store
                .alert_upsert_active(connection.id, kind, severity, message, metadata)
                .await
            {
                Ok(Some(alert)) => {
                    tracing::warn!(
                        connection_id = connection.id,
                        kind = %kind,
                        alert_id = alert.id,
                        "Alert raised"
                    );
                    self.dispatcher.dispatch(alert);
                }
                Ok(None) => {} // deduplicated
                Err(e) => {
                    tracing::error!(connection_id = connection.id, kind = %kind, error = %e, "Alert insert failed");
                }
            }
        } else {
            match self.store.alert_resolve(connection.id, kind).await {
                Ok(true) => {
                    tracing::info!(connection_id = connection.id, kind = %kind, "Alert auto-resolved");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(connection_id = connection.id, kind = %kind, error = %e, "Alert resolve failed");
                }
            }
        }
    }

    async fn check_consecutive_errors(&self, connection: &ConnectionRecord) {
        let threshold = self.alert_settings.consecutive_error_threshold;
        let since = Utc::now() - ChronoDuration::minutes(ERROR_LOOKBACK_MINUTES);
        let recent = match self
            .store
            .recent_requests_for_provider(
                connection.service.as_str().to_string(),
                since,
                threshold,
            )
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                tracing::error!(connection_id = connection.id, error = %e, "Consecutive-error query failed");
                return;
            }
        };

        let fired =
            recent.len() as u32 >= threshold && recent.iter().all(|request| !request.success);
        let message = format!(
            "Last {} requests against {} all failed within the past {} minutes",
            threshold, connection.name, ERROR_LOOKBACK_MINUTES
        );
        let metadata = serde_json::json!({
            "threshold": threshold,
            "lookback_minutes": ERROR_LOOKBACK_MINUTES,
        });
        self.raise_or_resolve(
            connection,
            AlertKind::ConsecutiveErrors,
            AlertSeverity::Error,
            fired,
            message,
            metadata,
        )
        .await;
    }

    async fn check_latency_spike(&self, connection: &ConnectionRecord) {
        let limit = (LATENCY_RECENT_SAMPLES + LATENCY_BASELINE_SAMPLES) as u32;
        let samples = match self
            .store
            .latency_samples(connection.service.as_str().to_string(), limit)
            .await
        {
            Ok(samples) => samples,
            Err(e) => {
                tracing::error!(connection_id = connection.id, error = %e, "Latency query failed");
                return;
            }
        };

        // Not enough history to form both a window and a baseline.
        if samples.len() < LATENCY_RECENT_SAMPLES + LATENCY_MIN_BASELINE {
            return;
        }

        let recent = &samples[..LATENCY_RECENT_SAMPLES];
        let baseline = &samples[LATENCY_RECENT_SAMPLES..];
        let recent_mean = mean(recent);
        let baseline_median = median(baseline);

        let fired = baseline_median > 0.0
            && recent_mean >= baseline_median * self.alert_settings.latency_multiplier;

        // Sustained slowness also degrades the provider's health state.
        self.health
            .record_latency_observation(connection.id, fired)
            .await;

        let message = format!(
            "Mean latency of last {} requests ({:.0} ms) is {:.1}x the baseline ({:.0} ms)",
            LATENCY_RECENT_SAMPLES,
            recent_mean,
            if baseline_median > 0.0 {
                recent_mean / baseline_median
            } else {
                0.0
            },
            baseline_median
        );
        let metadata = serde_json::json!({
            "recent_mean_ms": recent_mean,
            "baseline_median_ms": baseline_median,
            "multiplier": self.alert_settings.latency_multiplier,
        });
        self.raise_or_resolve(
            connection,
            AlertKind::LatencySpike,
            AlertSeverity::Warning,
            fired,
            message,
            metadata,
        )
        .await;
    }

    async fn check_budget_threshold(&self, connection: &ConnectionRecord) {
        let breach = match self
            .enforcer
            .threshold_breach(connection, self.alert_settings.budget_threshold_percent)
            .await
        {
            Ok(breach) => breach,
            Err(e) => {
                tracing::error!(connection_id = connection.id, error = %e, "Budget threshold query failed");
                return;
            }
        };

        let (fired, message, metadata) = match &breach {
            Some(breach) => (
                true,
                format!(
                    "{} window for {} at {:.0}% of its ${:.2} limit (${:.2} spent)",
                    breach.window, connection.name, breach.percent, breach.limit_usd, breach.spent_usd
                ),
                serde_json::json!({
                    "window": breach.window.as_str(),
                    "spent": breach.spent_usd,
                    "limit": breach.limit_usd,
                    "percent": breach.percent,
                }),
            ),
            None => (false, String::new(), serde_json::Value::Null),
        };

        self.raise_or_resolve(
            connection,
            AlertKind::BudgetThreshold,
            AlertSeverity::Warning,
            fired,
            message,
            metadata,
        )
        .await;
    }
}

fn mean(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<u64>() as f64 / samples.len() as f64
}

fn median(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}
