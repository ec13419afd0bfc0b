//! # llm-hub
//!
//! A localhost AI gateway that puts one OpenAI-compatible HTTP API in front
//! of heterogeneous upstream providers (hosted LLM APIs, local inference
//! servers), with per-connection cost accounting, encrypted credential
//! storage, automatic retry/fallback, and background health monitoring.
//!
//! ## Request flow
//!
//! ```text
//! HTTP handler ──► pipeline ──► budget check ──► router ──► executor ──► adapter ──► upstream
//!                     │                                                      │
//!                     └── persist request row ◄── health update ◄────────────┘
//! ```
//!
//! Background: a probe loop re-checks degraded providers, and an alert loop
//! evaluates error/latency/budget conditions, deduplicating alerts and
//! fanning them out to the configured dispatch channels.
//!
//! ## Modules
//! - `pipeline`: the single request-lifecycle entry point shared by all callers
//! - `providers`: the adapter capability set and one adapter per provider family
//! - `router`: pure model-name → connection-chain resolution
//! - `budget`: pre-flight spend enforcement over rolling windows
//! - `executor`: bounded retry with backoff and fallback selection
//! - `storage`: embedded SQLite persistence (append-only request/call ledger)
//! - `vault`: AES-256-GCM credential encryption and masking
//! - `health` / `monitor` / `alerts`: provider health tracking and alerting
//! - `api`: the axum HTTP surface

pub mod alerts;
pub mod api;
pub mod budget;
pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod monitor;
pub mod pipeline;
pub mod providers;
pub mod router;
pub mod storage;
pub mod vault;

pub use config::Config;
pub use error::HubError;
