//! Alert surface: listing and user-driven dismissal.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};

use crate::error::HubError;
use crate::storage::AlertRecord;

use super::routes::AppState;
use super::types::{ApiError, LimitParams};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/active", get(list_active))
        .route("/api/alerts/:id/dismiss", post(dismiss))
}

/// `GET /api/alerts?limit=N` - recent alerts, raised and cleared alike.
async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<AlertRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500);
    Ok(Json(state.store.alert_list_recent(limit).await?))
}

/// `GET /api/alerts/active`
async fn list_active(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AlertRecord>>, ApiError> {
    Ok(Json(state.store.alert_list_active().await?))
}

/// `POST /api/alerts/:id/dismiss`
async fn dismiss(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.store.alert_dismiss(id).await? {
        Ok(Json(serde_json::json!({"dismissed": true, "id": id})))
    } else {
        Err(ApiError(HubError::NotFound {
            detail: format!("no active alert with id {}", id),
        }))
    }
}
