//! Budget enforcement over rolling spend windows.
//!
//! Pre-flight only: the enforcer reads aggregate spend before a request is
//! dispatched and rejects when a non-zero window is at its limit. Post-flight
//! attribution happens through the persisted request row, so concurrent
//! requests can overshoot by at most (concurrency x single-request cost).
//! No locks are held between pre-flight and post-flight.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::storage::{ConnectionRecord, Store};

/// A rolling spend window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetWindow {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetWindow {
    pub const ALL: [BudgetWindow; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    /// The rolling interval spend is summed over.
    pub fn duration(&self) -> ChronoDuration {
        match self {
            Self::Daily => ChronoDuration::hours(24),
            Self::Weekly => ChronoDuration::days(7),
            Self::Monthly => ChronoDuration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// The connection's configured limit for this window (0 = unlimited).
    pub fn limit_for(&self, connection: &ConnectionRecord) -> f64 {
        match self {
            Self::Daily => connection.daily_limit_usd,
            Self::Weekly => connection.weekly_limit_usd,
            Self::Monthly => connection.monthly_limit_usd,
        }
    }
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A window running hot against its limit (alerting input).
#[derive(Debug, Clone, Serialize)]
pub struct BudgetBreach {
    pub window: BudgetWindow,
    pub spent_usd: f64,
    pub limit_usd: f64,
    pub percent: f64,
}

/// Pre-flight spend checks and override management.
#[derive(Clone)]
pub struct BudgetEnforcer {
    store: Store,
}

impl BudgetEnforcer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Pre-flight: reject when any non-zero window for this connection is at
    /// or over its limit. An unexpired budget override skips every check;
    /// once it lapses, enforcement resumes with no state change required.
    pub async fn check(&self, connection: &ConnectionRecord) -> Result<(), HubError> {
        let now = Utc::now();
        if connection.override_active(now) {
            tracing::debug!(
                connection_id = connection.id,
                until = %connection.budget_override_until.unwrap_or(now),
                "Budget override active, skipping enforcement"
            );
            return Ok(());
        }

        for window in BudgetWindow::ALL {
            let limit = window.limit_for(connection);
            if limit <= 0.0 {
                continue;
            }
            let spent = self
                .store
                .aggregate_spend(connection.service.as_str().to_string(), window)
                .await?;
            if spent >= limit {
                return Err(HubError::BudgetExceeded {
                    window,
                    limit_usd: limit,
                    spent_usd: spent,
                });
            }
        }
        Ok(())
    }

    /// Suspend enforcement for `duration`. The override expires naturally;
    /// there is no un-override operation.
    pub async fn override_budget(
        &self,
        connection_id: i64,
        duration: std::time::Duration,
    ) -> Result<Option<DateTime<Utc>>, HubError> {
        let until = Utc::now()
            + ChronoDuration::from_std(duration)
                .map_err(|e| HubError::bad_request(format!("invalid override duration: {}", e)))?;
        let updated = self.store.set_budget_override(connection_id, until).await?;
        if updated {
            tracing::info!(connection_id, until = %until, "Budget override set");
            Ok(Some(until))
        } else {
            Ok(None)
        }
    }

    /// The hottest non-zero window at or over `percent` of its limit, if
    /// any. Drives the budget-threshold alert.
    pub async fn threshold_breach(
        &self,
        connection: &ConnectionRecord,
        percent: f64,
    ) -> Result<Option<BudgetBreach>, HubError> {
        let mut hottest: Option<BudgetBreach> = None;
        for window in BudgetWindow::ALL {
            let limit = window.limit_for(connection);
            if limit <= 0.0 {
                continue;
            }
            let spent = self
                .store
                .aggregate_spend(connection.service.as_str().to_string(), window)
                .await?;
            let used = spent / limit * 100.0;
            if used >= percent && hottest.as_ref().map(|b| used > b.percent).unwrap_or(true) {
                hottest = Some(BudgetBreach {
                    window,
                    spent_usd: spent,
                    limit_usd: limit,
                    percent: used,
                });
            }
        }
        Ok(hottest)
    }
}
