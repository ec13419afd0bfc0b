//! In-memory provider health tracking.
//!
//! One entry per connection, recomputed continuously and transient across
//! restarts (cold start = all healthy). The pipeline reports every request
//! outcome; the probe loop reports active probe outcomes for degraded
//! providers. The router and dashboard read snapshots only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Probe/request successes in a row required to return to healthy.
const RECOVERY_SUCCESSES: u32 = 3;

/// Latency samples over baseline in a row required to degrade.
const SLOW_SAMPLE_THRESHOLD: u32 = 3;

/// Provider health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Error,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health bookkeeping for a single connection.
#[derive(Debug, Clone)]
struct ProviderHealth {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    consecutive_slow: u32,
    last_probe_ok: Option<bool>,
    last_probe_at: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            consecutive_slow: 0,
            last_probe_ok: None,
            last_probe_at: None,
        }
    }
}

/// Serializable snapshot for the dashboard read model.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub connection_id: i64,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe_ok: Option<bool>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Shared health tracker, keyed by connection id.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    entries: Arc<RwLock<HashMap<i64, ProviderHealth>>>,
    /// Consecutive failures that demote healthy to degraded; twice this
    /// demotes degraded to error.
    error_threshold: u32,
}

impl HealthTracker {
    pub fn new(error_threshold: u32) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            error_threshold: error_threshold.max(1),
        }
    }

    fn apply_success(&self, health: &mut ProviderHealth) {
        health.consecutive_failures = 0;
        match health.state {
            HealthState::Healthy => {
                health.consecutive_successes = health.consecutive_successes.saturating_add(1);
            }
            HealthState::Degraded | HealthState::Error => {
                health.consecutive_successes = health.consecutive_successes.saturating_add(1);
                if health.consecutive_successes >= RECOVERY_SUCCESSES {
                    health.state = HealthState::Healthy;
                    health.consecutive_successes = 0;
                    health.consecutive_slow = 0;
                }
            }
        }
    }

    fn apply_failure(&self, health: &mut ProviderHealth) {
        health.consecutive_successes = 0;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        if health.consecutive_failures >= self.error_threshold * 2 {
            health.state = HealthState::Error;
        } else if health.consecutive_failures >= self.error_threshold {
            health.state = HealthState::Degraded;
        }
    }

    /// Record a foreground request outcome for a connection.
    pub async fn record_outcome(&self, connection_id: i64, success: bool) {
        let mut entries = self.entries.write().await;
        let health = entries.entry(connection_id).or_default();
        let before = health.state;
        if success {
            self.apply_success(health);
        } else {
            self.apply_failure(health);
        }
        if health.state != before {
            tracing::info!(
                connection_id,
                from = %before,
                to = %health.state,
                consecutive_failures = health.consecutive_failures,
                "Provider health state changed"
            );
        }
    }

    /// Record an active probe outcome (probe loop only).
    pub async fn record_probe(&self, connection_id: i64, ok: bool) {
        {
            let mut entries = self.entries.write().await;
            let health = entries.entry(connection_id).or_default();
            health.last_probe_ok = Some(ok);
            health.last_probe_at = Some(Utc::now());
        }
        self.record_outcome(connection_id, ok).await;
    }

    /// Record whether the latest latency observation sits over the
    /// baseline; sustained slowness degrades a healthy provider.
    pub async fn record_latency_observation(&self, connection_id: i64, slow: bool) {
        let mut entries = self.entries.write().await;
        let health = entries.entry(connection_id).or_default();
        if slow {
            health.consecutive_slow = health.consecutive_slow.saturating_add(1);
            if health.state == HealthState::Healthy
                && health.consecutive_slow >= SLOW_SAMPLE_THRESHOLD
            {
                health.state = HealthState::Degraded;
                tracing::info!(connection_id, "Provider degraded on sustained latency");
            }
        } else {
            health.consecutive_slow = 0;
        }
    }

    /// Current state for a connection (healthy when never seen).
    pub async fn state(&self, connection_id: i64) -> HealthState {
        self.entries
            .read()
            .await
            .get(&connection_id)
            .map(|h| h.state)
            .unwrap_or(HealthState::Healthy)
    }

    /// Connection ids currently degraded or errored; the probe loop's
    /// worklist.
    pub async fn unhealthy_ids(&self) -> Vec<i64> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.state != HealthState::Healthy)
            .map(|(&id, _)| id)
            .collect()
    }

    pub async fn snapshot(&self, connection_id: i64) -> HealthSnapshot {
        let entries = self.entries.read().await;
        let health = entries.get(&connection_id).cloned().unwrap_or_default();
        HealthSnapshot {
            connection_id,
            state: health.state,
            consecutive_failures: health.consecutive_failures,
            consecutive_successes: health.consecutive_successes,
            last_probe_ok: health.last_probe_ok,
            last_probe_at: health.last_probe_at,
        }
    }

    pub async fn snapshot_all(&self) -> Vec<HealthSnapshot> {
        let entries = self.entries.read().await;
        let mut snapshots: Vec<HealthSnapshot> = entries
            .iter()
            .map(|(&id, health)| HealthSnapshot {
                connection_id: id,
                state: health.state,
                consecutive_failures: health.consecutive_failures,
                consecutive_successes: health.consecutive_successes,
                last_probe_ok: health.last_probe_ok,
                last_probe_at: health.last_probe_at,
            })
            .collect();
        snapshots.sort_by_key(|s| s.connection_id);
        snapshots
    }
}

/// Shared tracker type.
pub type SharedHealthTracker = Arc<HealthTracker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_connections_are_healthy() {
        let tracker = HealthTracker::new(3);
        assert_eq!(tracker.state(42).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn threshold_failures_degrade_and_double_errors() {
        let tracker = HealthTracker::new(3);
        for _ in 0..3 {
            tracker.record_outcome(1, false).await;
        }
        assert_eq!(tracker.state(1).await, HealthState::Degraded);

        for _ in 0..3 {
            tracker.record_outcome(1, false).await;
        }
        assert_eq!(tracker.state(1).await, HealthState::Error);
    }

    #[tokio::test]
    async fn three_probe_successes_recover() {
        let tracker = HealthTracker::new(3);
        for _ in 0..6 {
            tracker.record_outcome(1, false).await;
        }
        assert_eq!(tracker.state(1).await, HealthState::Error);

        tracker.record_probe(1, true).await;
        tracker.record_probe(1, true).await;
        assert_eq!(tracker.state(1).await, HealthState::Error);
        tracker.record_probe(1, true).await;
        assert_eq!(tracker.state(1).await, HealthState::Healthy);

        let snapshot = tracker.snapshot(1).await;
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.last_probe_ok, Some(true));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let tracker = HealthTracker::new(3);
        tracker.record_outcome(1, false).await;
        tracker.record_outcome(1, false).await;
        tracker.record_outcome(1, true).await;
        tracker.record_outcome(1, false).await;
        // Streak was broken: still healthy
        assert_eq!(tracker.state(1).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn sustained_slow_samples_degrade() {
        let tracker = HealthTracker::new(3);
        tracker.record_latency_observation(1, true).await;
        tracker.record_latency_observation(1, true).await;
        assert_eq!(tracker.state(1).await, HealthState::Healthy);
        tracker.record_latency_observation(1, true).await;
        assert_eq!(tracker.state(1).await, HealthState::Degraded);
    }

    #[tokio::test]
    async fn fast_sample_resets_slow_streak() {
        let tracker = HealthTracker::new(3);
        tracker.record_latency_observation(1, true).await;
        tracker.record_latency_observation(1, true).await;
        tracker.record_latency_observation(1, false).await;
        tracker.record_latency_observation(1, true).await;
        assert_eq!(tracker.state(1).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn unhealthy_worklist_contains_degraded_only() {
        let tracker = HealthTracker::new(2);
        tracker.record_outcome(1, true).await;
        for _ in 0..2 {
            tracker.record_outcome(2, false).await;
        }
        assert_eq!(tracker.unhealthy_ids().await, vec![2]);
    }
}
