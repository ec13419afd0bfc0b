//! Dashboard read model and CRUD surface.
//!
//! Everything here is stateless: aggregates are recomputed from the store
//! per fetch, and credential fields are masked before they leave the
//! process.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::NaiveDate;

use crate::budget::BudgetWindow;
use crate::error::HubError;
use crate::providers::ProviderFamily;
use crate::storage::{
    BudgetLimits, ConnectionData, ConnectionRecord, CostConfigRecord, RequestRecord, StatsSummary,
    TimeGranularity, UsagePoint,
};
use crate::vault::mask;

use super::routes::AppState;
use super::types::*;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/dashboard/stats", get(get_stats))
        .route("/api/dashboard/usage", get(get_usage))
        .route("/api/dashboard/requests", get(get_requests))
        .route("/api/dashboard/health", get(get_health))
        .route(
            "/api/dashboard/connections",
            get(list_connections).post(create_connection),
        )
        .route(
            "/api/dashboard/connections/:id",
            get(get_connection)
                .put(replace_connection)
                .patch(patch_connection)
                .delete(delete_connection),
        )
        .route(
            "/api/dashboard/connections/:id/toggle",
            post(toggle_connection),
        )
        .route(
            "/api/dashboard/connections/:id/budget-override",
            post(override_budget),
        )
        .route(
            "/api/dashboard/budget",
            get(get_budget).put(put_budget),
        )
        .route(
            "/api/dashboard/costs",
            get(list_costs).post(create_cost),
        )
        .route("/api/dashboard/costs/:id", put(update_cost))
}

/// `GET /api/dashboard/stats`
async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsSummary>, ApiError> {
    Ok(Json(state.store.stats_24h().await?))
}

/// `GET /api/dashboard/usage?period={daily,weekly,monthly}&anchor={date}`
async fn get_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> Result<Json<Vec<UsagePoint>>, ApiError> {
    let granularity = match params.period.as_deref() {
        None => TimeGranularity::Daily,
        Some(raw) => TimeGranularity::from_str(raw).ok_or_else(|| {
            ApiError(HubError::bad_request(format!(
                "unknown period '{}' (expected daily, weekly, or monthly)",
                raw
            )))
        })?,
    };
    let anchor = params
        .anchor
        .as_deref()
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                ApiError(HubError::bad_request(format!(
                    "invalid anchor date '{}' (expected YYYY-MM-DD)",
                    raw
                )))
            })
        })
        .transpose()?;

    Ok(Json(state.store.usage_timeseries(granularity, anchor).await?))
}

/// `GET /api/dashboard/requests?limit=N`
async fn get_requests(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<RequestRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500);
    Ok(Json(state.store.recent_requests(limit).await?))
}

/// `GET /api/dashboard/health`
async fn get_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConnectionHealthView>>, ApiError> {
    let connections = state.store.list_connections().await?;
    let mut views = Vec::with_capacity(connections.len());
    for connection in connections {
        let snapshot = state.health.snapshot(connection.id).await;
        views.push(ConnectionHealthView {
            connection_id: connection.id,
            name: connection.name,
            service: connection.service,
            state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures,
            consecutive_successes: snapshot.consecutive_successes,
            last_probe_ok: snapshot.last_probe_ok,
            last_probe_at: snapshot.last_probe_at,
        });
    }
    Ok(Json(views))
}

async fn view_of(state: &AppState, record: &ConnectionRecord) -> Result<ConnectionView, ApiError> {
    let health = state.health.state(record.id).await;
    let spend = state
        .store
        .aggregate_spend(record.service.as_str().to_string(), BudgetWindow::Daily)
        .await?;
    let vault = state.vault.clone();
    Ok(connection_view(record, health, spend, move |ciphertext| {
        match vault.decrypt(ciphertext) {
            Ok(plaintext) => mask(&plaintext),
            Err(e) => {
                tracing::error!(error = %e, "Credential decryption failed for dashboard view");
                "****".to_string()
            }
        }
    }))
}

/// `GET /api/dashboard/connections`
async fn list_connections(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConnectionView>>, ApiError> {
    let records = state.store.list_connections().await?;
    let mut views = Vec::with_capacity(records.len());
    for record in &records {
        views.push(view_of(&state, record).await?);
    }
    Ok(Json(views))
}

/// `GET /api/dashboard/connections/:id`
async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ConnectionView>, ApiError> {
    let record = state
        .store
        .get_connection(id)
        .await?
        .ok_or_else(|| not_found(id))?;
    Ok(Json(view_of(&state, &record).await?))
}

fn not_found(id: i64) -> ApiError {
    ApiError(HubError::NotFound {
        detail: format!("connection {} not found", id),
    })
}

fn parse_service(raw: &str) -> Result<ProviderFamily, ApiError> {
    ProviderFamily::from_str(raw).ok_or_else(|| {
        ApiError(HubError::bad_request(format!(
            "unknown service '{}' (expected openai, anthropic, ollama, or custom)",
            raw
        )))
    })
}

fn validate_base_url(base_url: &Option<String>) -> Result<(), ApiError> {
    if let Some(raw) = base_url {
        if !raw.trim().is_empty() && url::Url::parse(raw).is_err() {
            return Err(ApiError(HubError::bad_request(format!(
                "invalid base URL '{}'",
                raw
            ))));
        }
    }
    Ok(())
}

fn encrypt_opt(state: &AppState, value: Option<&str>) -> Result<Option<String>, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .map(|plaintext| state.vault.encrypt(plaintext))
        .transpose()
        .map_err(|e| ApiError(HubError::internal(format!("credential encryption: {}", e))))
}

fn data_from_body(state: &AppState, body: &ConnectionBody) -> Result<ConnectionData, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError(HubError::bad_request("name must not be empty")));
    }
    validate_base_url(&body.base_url)?;
    Ok(ConnectionData {
        name: body.name.clone(),
        service: parse_service(&body.service)?,
        category: body.category.clone(),
        base_url: body.base_url.clone(),
        api_key_enc: encrypt_opt(state, body.api_key.as_deref())?,
        token_enc: encrypt_opt(state, body.token.as_deref())?,
        credential_path_enc: encrypt_opt(state, body.credential_path.as_deref())?,
        enabled: body.enabled,
        is_default: body.is_default,
        daily_limit_usd: body.daily_limit_usd,
        weekly_limit_usd: body.weekly_limit_usd,
        monthly_limit_usd: body.monthly_limit_usd,
    })
}

/// `POST /api/dashboard/connections`
async fn create_connection(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConnectionBody>,
) -> Result<(StatusCode, Json<ConnectionView>), ApiError> {
    let data = data_from_body(&state, &body)?;
    let record = state.store.upsert_connection(None, data).await?;
    tracing::info!(connection_id = record.id, service = %record.service, "Connection created");
    Ok((StatusCode::CREATED, Json(view_of(&state, &record).await?)))
}

/// `PUT /api/dashboard/connections/:id` - full replace.
async fn replace_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ConnectionBody>,
) -> Result<Json<ConnectionView>, ApiError> {
    state
        .store
        .get_connection(id)
        .await?
        .ok_or_else(|| not_found(id))?;
    let data = data_from_body(&state, &body)?;
    let record = state.store.upsert_connection(Some(id), data).await?;
    Ok(Json(view_of(&state, &record).await?))
}

/// `PATCH /api/dashboard/connections/:id` - partial update; absent
/// credential fields keep their stored ciphertext.
async fn patch_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(patch): Json<ConnectionPatch>,
) -> Result<Json<ConnectionView>, ApiError> {
    let existing = state
        .store
        .get_connection(id)
        .await?
        .ok_or_else(|| not_found(id))?;

    validate_base_url(&patch.base_url)?;
    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            return Err(ApiError(HubError::bad_request("name must not be empty")));
        }
    }

    let data = ConnectionData {
        name: patch.name.unwrap_or(existing.name),
        service: existing.service,
        category: patch.category.or(existing.category),
        base_url: patch.base_url.or(existing.base_url),
        api_key_enc: match patch.api_key.as_deref() {
            Some(plaintext) => encrypt_opt(&state, Some(plaintext))?,
            None => existing.api_key_enc,
        },
        token_enc: match patch.token.as_deref() {
            Some(plaintext) => encrypt_opt(&state, Some(plaintext))?,
            None => existing.token_enc,
        },
        credential_path_enc: match patch.credential_path.as_deref() {
            Some(plaintext) => encrypt_opt(&state, Some(plaintext))?,
            None => existing.credential_path_enc,
        },
        enabled: patch.enabled.unwrap_or(existing.enabled),
        is_default: patch.is_default.unwrap_or(existing.is_default),
        daily_limit_usd: patch.daily_limit_usd.unwrap_or(existing.daily_limit_usd),
        weekly_limit_usd: patch.weekly_limit_usd.unwrap_or(existing.weekly_limit_usd),
        monthly_limit_usd: patch
            .monthly_limit_usd
            .unwrap_or(existing.monthly_limit_usd),
    };

    let record = state.store.upsert_connection(Some(id), data).await?;
    Ok(Json(view_of(&state, &record).await?))
}

/// `DELETE /api/dashboard/connections/:id`
async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_connection_cascade(id).await? {
        tracing::info!(connection_id = id, "Connection deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}

/// `POST /api/dashboard/connections/:id/toggle`
async fn toggle_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ConnectionView>, ApiError> {
    let existing = state
        .store
        .get_connection(id)
        .await?
        .ok_or_else(|| not_found(id))?;
    let record = state
        .store
        .set_connection_enabled(id, !existing.enabled)
        .await?
        .ok_or_else(|| not_found(id))?;
    Ok(Json(view_of(&state, &record).await?))
}

/// `POST /api/dashboard/connections/:id/budget-override`
async fn override_budget(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<BudgetOverrideBody>,
) -> Result<Json<BudgetOverrideView>, ApiError> {
    if body.duration_minutes == 0 {
        return Err(ApiError(HubError::bad_request(
            "duration_minutes must be positive",
        )));
    }
    let until = state
        .enforcer
        .override_budget(
            id,
            std::time::Duration::from_secs(body.duration_minutes * 60),
        )
        .await?
        .ok_or_else(|| not_found(id))?;
    Ok(Json(BudgetOverrideView {
        connection_id: id,
        override_until: until,
    }))
}

/// `GET /api/dashboard/budget`
async fn get_budget(State(state): State<Arc<AppState>>) -> Result<Json<BudgetLimits>, ApiError> {
    Ok(Json(state.store.get_budget_limits().await?))
}

/// `PUT /api/dashboard/budget`
async fn put_budget(
    State(state): State<Arc<AppState>>,
    Json(limits): Json<BudgetLimits>,
) -> Result<Json<BudgetLimits>, ApiError> {
    if limits.daily_usd < 0.0 || limits.weekly_usd < 0.0 || limits.monthly_usd < 0.0 {
        return Err(ApiError(HubError::bad_request(
            "budget limits must be non-negative",
        )));
    }
    state.store.put_budget_limits(limits).await?;
    Ok(Json(limits))
}

/// `GET /api/dashboard/costs`
async fn list_costs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CostConfigRecord>>, ApiError> {
    Ok(Json(state.store.list_cost_configs().await?))
}

fn validate_cost_body(body: &CostConfigBody) -> Result<(), ApiError> {
    if body.model_pattern.trim().is_empty() {
        return Err(ApiError(HubError::bad_request(
            "model_pattern must not be empty",
        )));
    }
    if body.input_usd_per_million < 0.0 || body.output_usd_per_million < 0.0 {
        return Err(ApiError(HubError::bad_request(
            "cost rates must be non-negative",
        )));
    }
    Ok(())
}

/// `POST /api/dashboard/costs`
async fn create_cost(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CostConfigBody>,
) -> Result<(StatusCode, Json<CostConfigRecord>), ApiError> {
    validate_cost_body(&body)?;
    let record = state
        .store
        .upsert_cost_config(
            None,
            body.model_pattern,
            body.connection_id,
            body.input_usd_per_million,
            body.output_usd_per_million,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `PUT /api/dashboard/costs/:id`
async fn update_cost(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CostConfigBody>,
) -> Result<Json<CostConfigRecord>, ApiError> {
    validate_cost_body(&body)?;
    let record = state
        .store
        .upsert_cost_config(
            Some(id),
            body.model_pattern,
            body.connection_id,
            body.input_usd_per_million,
            body.output_usd_per_million,
        )
        .await?;
    Ok(Json(record))
}
