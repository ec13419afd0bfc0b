//! HTTP API for the gateway.
//!
//! ## Endpoints
//!
//! - `GET /health` - Liveness check
//! - `GET /v1/models` - Models grouped by provider family
//! - `POST /v1/chat/completions` - OpenAI-compatible completion
//! - `GET /api/dashboard/stats` - 24h stat tiles
//! - `GET /api/dashboard/usage` - Per-day usage time series
//! - `GET /api/dashboard/requests` - Recent request rows
//! - `GET /api/dashboard/health` - Provider health snapshots
//! - `/api/dashboard/connections[...]` - Connection CRUD, toggle, budget override
//! - `GET|PUT /api/dashboard/budget` - Global budget limits
//! - `/api/dashboard/costs[...]` - Cost config CRUD
//! - `/api/alerts[...]` - Alert listing and dismissal

pub mod alerts;
pub mod dashboard;
mod routes;
pub mod types;

pub use routes::{serve, AppState};
pub use types::*;
