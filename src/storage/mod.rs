//! Embedded SQLite persistence.
//!
//! A single connection guarded by a mutex; every call runs on the blocking
//! pool. Schema bootstrap is idempotent (`CREATE TABLE IF NOT EXISTS` only,
//! no destructive migrations) and foreign keys are enabled unconditionally
//! so deleting a connection cascades to its cost configs.

mod records;

pub use records::*;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::budget::BudgetWindow;
use crate::error::HubError;
use crate::providers::ProviderFamily;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    service TEXT NOT NULL,
    category TEXT,
    base_url TEXT,
    api_key_enc TEXT,
    token_enc TEXT,
    credential_path_enc TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    is_default INTEGER NOT NULL DEFAULT 0,
    daily_limit_usd REAL NOT NULL DEFAULT 0,
    weekly_limit_usd REAL NOT NULL DEFAULT 0,
    monthly_limit_usd REAL NOT NULL DEFAULT 0,
    budget_override_until TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cost_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_pattern TEXT NOT NULL,
    connection_id INTEGER REFERENCES connections(id) ON DELETE CASCADE,
    input_usd_per_million REAL NOT NULL DEFAULT 0,
    output_usd_per_million REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    UNIQUE(connection_id, model_pattern)
);

CREATE TABLE IF NOT EXISTS budget_limits (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    daily_usd REAL NOT NULL,
    weekly_usd REAL NOT NULL,
    monthly_usd REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    model TEXT NOT NULL,
    provider TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL,
    error TEXT,
    workflow TEXT
);

CREATE INDEX IF NOT EXISTS idx_requests_created ON requests(created_at);
CREATE INDEX IF NOT EXISTS idx_requests_provider ON requests(provider, created_at);

CREATE TABLE IF NOT EXISTS api_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    service TEXT NOT NULL,
    operation TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    status_code INTEGER,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    success INTEGER NOT NULL,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_api_calls_created ON api_calls(created_at);
CREATE INDEX IF NOT EXISTS idx_api_calls_service ON api_calls(service, created_at);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    dismissed_at TEXT,
    dedup_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_active_dedup
    ON alerts(dedup_key)
    WHERE resolved_at IS NULL AND dismissed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);
"#;

/// Suppress a re-raised alert with the same dedup key for this long after
/// the previous one was created.
const REALERT_COOLDOWN_MINUTES: i64 = 15;

/// Serialize a timestamp for storage (fixed-width, lexicographically ordered).
fn to_db(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, warning and substituting the epoch on corrupt
/// values rather than failing the whole row.
fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::warn!(raw_value = %raw, error = %e, "Corrupt timestamp in database");
            DateTime::<Utc>::UNIX_EPOCH
        })
}

fn parse_family(raw: &str) -> ProviderFamily {
    ProviderFamily::from_str(raw).unwrap_or_else(|| {
        tracing::warn!(raw_value = %raw, "Unknown service key in database; treating as custom");
        ProviderFamily::Custom
    })
}

/// Transactional gateway to the embedded database.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and run the
    /// idempotent schema bootstrap.
    pub async fn open(path: PathBuf) -> Result<Self, HubError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| HubError::persistence(format!("create database dir: {}", e)))?;
            }
        }

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, HubError> {
            let conn = Connection::open(&path)
                .map_err(|e| HubError::persistence(format!("open database: {}", e)))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| HubError::persistence(format!("schema bootstrap: {}", e)))?;
            Ok(conn)
        })
        .await
        .map_err(|e| HubError::internal(format!("storage task join error: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, HubError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| HubError::internal(format!("storage task join error: {}", e)))?
        .map_err(|e| HubError::persistence(e.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Requests / api calls (append-only)
    // ─────────────────────────────────────────────────────────────────────

    pub async fn insert_request(&self, new: NewRequest) -> Result<i64, HubError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO requests (created_at, model, provider, prompt_tokens,
                     completion_tokens, cost_usd, latency_ms, success, error, workflow)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    to_db(Utc::now()),
                    new.model,
                    new.provider,
                    new.prompt_tokens as i64,
                    new.completion_tokens as i64,
                    new.cost_usd,
                    new.latency_ms as i64,
                    new.success,
                    new.error,
                    new.workflow,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn insert_api_call(&self, new: NewApiCall) -> Result<i64, HubError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO api_calls (created_at, service, operation, endpoint, method,
                     status_code, latency_ms, cost_usd, metadata, success, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    to_db(Utc::now()),
                    new.service,
                    new.operation,
                    new.endpoint,
                    new.method,
                    new.status_code.map(|c| c as i64),
                    new.latency_ms as i64,
                    new.cost_usd,
                    new.metadata.to_string(),
                    new.success,
                    new.error,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    fn parse_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRecord> {
        Ok(RequestRecord {
            id: row.get(0)?,
            created_at: parse_datetime(&row.get::<_, String>(1)?),
            model: row.get(2)?,
            provider: row.get(3)?,
            prompt_tokens: row.get::<_, i64>(4)? as u64,
            completion_tokens: row.get::<_, i64>(5)? as u64,
            cost_usd: row.get(6)?,
            latency_ms: row.get::<_, i64>(7)? as u64,
            success: row.get(8)?,
            error: row.get(9)?,
            workflow: row.get(10)?,
        })
    }

    const REQUEST_COLUMNS: &'static str = "id, created_at, model, provider, prompt_tokens, \
         completion_tokens, cost_usd, latency_ms, success, error, workflow";

    /// Most recent requests, newest first.
    pub async fn recent_requests(&self, limit: u32) -> Result<Vec<RequestRecord>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM requests ORDER BY id DESC LIMIT ?1",
                Self::REQUEST_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], Self::parse_request_row)?;
            rows.collect()
        })
        .await
    }

    /// Most recent requests for one provider since `since`, newest first.
    pub async fn recent_requests_for_provider(
        &self,
        provider: String,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RequestRecord>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM requests
                 WHERE provider = ?1 AND created_at > ?2
                 ORDER BY id DESC LIMIT ?3",
                Self::REQUEST_COLUMNS
            ))?;
            let rows = stmt.query_map(params![provider, to_db(since), limit], Self::parse_request_row)?;
            rows.collect()
        })
        .await
    }

    /// Latencies of the most recent successful requests for a provider,
    /// newest first. Used by the latency-spike alert condition.
    pub async fn latency_samples(
        &self,
        provider: String,
        limit: u32,
    ) -> Result<Vec<u64>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT latency_ms FROM requests
                 WHERE provider = ?1 AND success = 1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![provider, limit], |row| {
                Ok(row.get::<_, i64>(0)? as u64)
            })?;
            rows.collect()
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────

    fn parse_api_call_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiCallRecord> {
        let metadata_raw: String = row.get(9)?;
        Ok(ApiCallRecord {
            id: row.get(0)?,
            created_at: parse_datetime(&row.get::<_, String>(1)?),
            service: row.get(2)?,
            operation: row.get(3)?,
            endpoint: row.get(4)?,
            method: row.get(5)?,
            status_code: row.get::<_, Option<i64>>(6)?.map(|c| c as u16),
            latency_ms: row.get::<_, i64>(7)? as u64,
            cost_usd: row.get(8)?,
            metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
            success: row.get(10)?,
            error: row.get(11)?,
        })
    }

    /// Most recent non-LLM upstream calls, newest first.
    pub async fn recent_api_calls(&self, limit: u32) -> Result<Vec<ApiCallRecord>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, service, operation, endpoint, method, status_code,
                        latency_ms, cost_usd, metadata, success, error
                 FROM api_calls ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], Self::parse_api_call_row)?;
            rows.collect()
        })
        .await
    }

    fn parse_connection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRecord> {
        Ok(ConnectionRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            service: parse_family(&row.get::<_, String>(2)?),
            category: row.get(3)?,
            base_url: row.get(4)?,
            api_key_enc: row.get(5)?,
            token_enc: row.get(6)?,
            credential_path_enc: row.get(7)?,
            enabled: row.get(8)?,
            is_default: row.get(9)?,
            daily_limit_usd: row.get(10)?,
            weekly_limit_usd: row.get(11)?,
            monthly_limit_usd: row.get(12)?,
            budget_override_until: row
                .get::<_, Option<String>>(13)?
                .map(|raw| parse_datetime(&raw)),
            created_at: parse_datetime(&row.get::<_, String>(14)?),
            updated_at: parse_datetime(&row.get::<_, String>(15)?),
        })
    }

    const CONNECTION_COLUMNS: &'static str = "id, name, service, category, base_url, \
         api_key_enc, token_enc, credential_path_enc, enabled, is_default, \
         daily_limit_usd, weekly_limit_usd, monthly_limit_usd, budget_override_until, \
         created_at, updated_at";

    pub async fn list_connections(&self) -> Result<Vec<ConnectionRecord>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM connections ORDER BY id ASC",
                Self::CONNECTION_COLUMNS
            ))?;
            let rows = stmt.query_map([], Self::parse_connection_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn get_connection(&self, id: i64) -> Result<Option<ConnectionRecord>, HubError> {
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM connections WHERE id = ?1",
                    Self::CONNECTION_COLUMNS
                ),
                params![id],
                Self::parse_connection_row,
            )
            .optional()
        })
        .await
    }

    /// Create (`id = None`) or update a connection.
    ///
    /// Creation also seeds a zero-cost `*` cost config so every (connection,
    /// model) lookup resolves. Setting `is_default` clears the flag on every
    /// other connection in the same transaction.
    pub async fn upsert_connection(
        &self,
        id: Option<i64>,
        data: ConnectionData,
    ) -> Result<ConnectionRecord, HubError> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let now = to_db(Utc::now());

            if data.is_default {
                tx.execute("UPDATE connections SET is_default = 0", [])?;
            }

            let id = match id {
                None => {
                    tx.execute(
                        "INSERT INTO connections (name, service, category, base_url,
                             api_key_enc, token_enc, credential_path_enc, enabled, is_default,
                             daily_limit_usd, weekly_limit_usd, monthly_limit_usd,
                             created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                        params![
                            data.name,
                            data.service.as_str(),
                            data.category,
                            data.base_url,
                            data.api_key_enc,
                            data.token_enc,
                            data.credential_path_enc,
                            data.enabled,
                            data.is_default,
                            data.daily_limit_usd,
                            data.weekly_limit_usd,
                            data.monthly_limit_usd,
                            now,
                        ],
                    )?;
                    let id = tx.last_insert_rowid();
                    // Seed a free default price; operators price cloud models later.
                    tx.execute(
                        "INSERT OR IGNORE INTO cost_configs
                             (model_pattern, connection_id, input_usd_per_million,
                              output_usd_per_million, updated_at)
                         VALUES ('*', ?1, 0, 0, ?2)",
                        params![id, now],
                    )?;
                    id
                }
                Some(id) => {
                    let changed = tx.execute(
                        "UPDATE connections SET name = ?1, service = ?2, category = ?3,
                             base_url = ?4, api_key_enc = ?5, token_enc = ?6,
                             credential_path_enc = ?7, enabled = ?8, is_default = ?9,
                             daily_limit_usd = ?10, weekly_limit_usd = ?11,
                             monthly_limit_usd = ?12, updated_at = ?13
                         WHERE id = ?14",
                        params![
                            data.name,
                            data.service.as_str(),
                            data.category,
                            data.base_url,
                            data.api_key_enc,
                            data.token_enc,
                            data.credential_path_enc,
                            data.enabled,
                            data.is_default,
                            data.daily_limit_usd,
                            data.weekly_limit_usd,
                            data.monthly_limit_usd,
                            now,
                            id,
                        ],
                    )?;
                    if changed == 0 {
                        return Err(rusqlite::Error::QueryReturnedNoRows);
                    }
                    id
                }
            };

            let record = tx.query_row(
                &format!(
                    "SELECT {} FROM connections WHERE id = ?1",
                    Self::CONNECTION_COLUMNS
                ),
                params![id],
                Self::parse_connection_row,
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    /// Flip the enabled flag; everything else (except `updated_at`) is
    /// preserved.
    pub async fn set_connection_enabled(
        &self,
        id: i64,
        enabled: bool,
    ) -> Result<Option<ConnectionRecord>, HubError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE connections SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled, to_db(Utc::now()), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            conn.query_row(
                &format!(
                    "SELECT {} FROM connections WHERE id = ?1",
                    Self::CONNECTION_COLUMNS
                ),
                params![id],
                Self::parse_connection_row,
            )
            .optional()
        })
        .await
    }

    /// Set `budget_override_until`; enforcement resumes when it lapses with
    /// no further state change.
    pub async fn set_budget_override(
        &self,
        id: i64,
        until: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE connections SET budget_override_until = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_db(until), to_db(Utc::now()), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Delete a connection; its cost configs go in the same transaction via
    /// the foreign-key cascade.
    pub async fn delete_connection_cascade(&self, id: i64) -> Result<bool, HubError> {
        self.call(move |conn| {
            let changed = conn.execute("DELETE FROM connections WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Budget limits & cost configs
    // ─────────────────────────────────────────────────────────────────────

    /// Read the global limits, creating the default row on first access.
    pub async fn get_budget_limits(&self) -> Result<BudgetLimits, HubError> {
        self.call(move |conn| {
            let defaults = BudgetLimits::default();
            conn.execute(
                "INSERT OR IGNORE INTO budget_limits (id, daily_usd, weekly_usd, monthly_usd)
                 VALUES (1, ?1, ?2, ?3)",
                params![defaults.daily_usd, defaults.weekly_usd, defaults.monthly_usd],
            )?;
            conn.query_row(
                "SELECT daily_usd, weekly_usd, monthly_usd FROM budget_limits WHERE id = 1",
                [],
                |row| {
                    Ok(BudgetLimits {
                        daily_usd: row.get(0)?,
                        weekly_usd: row.get(1)?,
                        monthly_usd: row.get(2)?,
                    })
                },
            )
        })
        .await
    }

    pub async fn put_budget_limits(&self, limits: BudgetLimits) -> Result<(), HubError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO budget_limits (id, daily_usd, weekly_usd, monthly_usd)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     daily_usd = excluded.daily_usd,
                     weekly_usd = excluded.weekly_usd,
                     monthly_usd = excluded.monthly_usd",
                params![limits.daily_usd, limits.weekly_usd, limits.monthly_usd],
            )?;
            Ok(())
        })
        .await
    }

    fn parse_cost_config_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostConfigRecord> {
        Ok(CostConfigRecord {
            id: row.get(0)?,
            model_pattern: row.get(1)?,
            connection_id: row.get(2)?,
            input_usd_per_million: row.get(3)?,
            output_usd_per_million: row.get(4)?,
            updated_at: parse_datetime(&row.get::<_, String>(5)?),
        })
    }

    const COST_CONFIG_COLUMNS: &'static str = "id, model_pattern, connection_id, \
         input_usd_per_million, output_usd_per_million, updated_at";

    pub async fn list_cost_configs(&self) -> Result<Vec<CostConfigRecord>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM cost_configs ORDER BY id ASC",
                Self::COST_CONFIG_COLUMNS
            ))?;
            let rows = stmt.query_map([], Self::parse_cost_config_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn upsert_cost_config(
        &self,
        id: Option<i64>,
        model_pattern: String,
        connection_id: Option<i64>,
        input_usd_per_million: f64,
        output_usd_per_million: f64,
    ) -> Result<CostConfigRecord, HubError> {
        self.call(move |conn| {
            let now = to_db(Utc::now());
            let id = match id {
                None => {
                    conn.execute(
                        "INSERT INTO cost_configs
                             (model_pattern, connection_id, input_usd_per_million,
                              output_usd_per_million, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(connection_id, model_pattern) DO UPDATE SET
                             input_usd_per_million = excluded.input_usd_per_million,
                             output_usd_per_million = excluded.output_usd_per_million,
                             updated_at = excluded.updated_at",
                        params![
                            model_pattern,
                            connection_id,
                            input_usd_per_million,
                            output_usd_per_million,
                            now
                        ],
                    )?;
                    conn.query_row(
                        "SELECT id FROM cost_configs
                         WHERE model_pattern = ?1 AND connection_id IS ?2",
                        params![model_pattern, connection_id],
                        |row| row.get::<_, i64>(0),
                    )?
                }
                Some(id) => {
                    let changed = conn.execute(
                        "UPDATE cost_configs SET model_pattern = ?1, connection_id = ?2,
                             input_usd_per_million = ?3, output_usd_per_million = ?4,
                             updated_at = ?5
                         WHERE id = ?6",
                        params![
                            model_pattern,
                            connection_id,
                            input_usd_per_million,
                            output_usd_per_million,
                            now,
                            id
                        ],
                    )?;
                    if changed == 0 {
                        return Err(rusqlite::Error::QueryReturnedNoRows);
                    }
                    id
                }
            };
            conn.query_row(
                &format!(
                    "SELECT {} FROM cost_configs WHERE id = ?1",
                    Self::COST_CONFIG_COLUMNS
                ),
                params![id],
                Self::parse_cost_config_row,
            )
        })
        .await
    }

    /// Resolve the pricing row for a (connection, model) pair.
    ///
    /// Precedence: connection-specific exact match, connection-specific `*`,
    /// legacy global exact match, legacy global `*`.
    pub async fn resolve_cost_config(
        &self,
        connection_id: i64,
        model: String,
    ) -> Result<Option<CostConfigRecord>, HubError> {
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM cost_configs
                     WHERE (connection_id = ?1 AND model_pattern IN (?2, '*'))
                        OR (connection_id IS NULL AND model_pattern IN (?2, '*'))
                     ORDER BY (connection_id IS NULL) ASC, (model_pattern = '*') ASC
                     LIMIT 1",
                    Self::COST_CONFIG_COLUMNS
                ),
                params![connection_id, model],
                Self::parse_cost_config_row,
            )
            .optional()
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Aggregates
    // ─────────────────────────────────────────────────────────────────────

    /// Sum spend attributed to a provider key over a rolling window, across
    /// both the request ledger and the non-LLM call ledger.
    pub async fn aggregate_spend(
        &self,
        provider: String,
        window: BudgetWindow,
    ) -> Result<f64, HubError> {
        let cutoff = to_db(Utc::now() - window.duration());
        self.call(move |conn| {
            let requests: f64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0) FROM requests
                 WHERE provider = ?1 AND created_at > ?2",
                params![provider, cutoff],
                |row| row.get(0),
            )?;
            let api_calls: f64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0) FROM api_calls
                 WHERE service = ?1 AND created_at > ?2",
                params![provider, cutoff],
                |row| row.get(0),
            )?;
            Ok(requests + api_calls)
        })
        .await
    }

    /// Per-day, per-provider token/cost sums over a window of UTC days.
    ///
    /// `daily` covers the last 30 days ending today; `weekly`/`monthly`
    /// cover a 7- or 30-day window ending at `anchor` (today if absent).
    pub async fn usage_timeseries(
        &self,
        granularity: TimeGranularity,
        anchor: Option<NaiveDate>,
    ) -> Result<Vec<UsagePoint>, HubError> {
        let today = Utc::now().date_naive();
        let (days, end) = match granularity {
            TimeGranularity::Daily => (30, today),
            TimeGranularity::Weekly => (7, anchor.unwrap_or(today)),
            TimeGranularity::Monthly => (30, anchor.unwrap_or(today)),
        };
        let start = end - ChronoDuration::days(days - 1);
        let end_exclusive = end + ChronoDuration::days(1);
        let start_str = start.format("%Y-%m-%d").to_string();
        let end_str = end_exclusive.format("%Y-%m-%d").to_string();

        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT strftime('%Y-%m-%d', created_at) AS day, provider,
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        COALESCE(SUM(cost_usd), 0),
                        COUNT(*)
                 FROM requests
                 WHERE created_at >= ?1 AND created_at < ?2
                 GROUP BY day, provider
                 ORDER BY day ASC, provider ASC",
            )?;
            let rows = stmt.query_map(params![start_str, end_str], |row| {
                Ok(UsagePoint {
                    day: row.get(0)?,
                    provider: row.get(1)?,
                    prompt_tokens: row.get::<_, i64>(2)? as u64,
                    completion_tokens: row.get::<_, i64>(3)? as u64,
                    cost_usd: row.get(4)?,
                    requests: row.get::<_, i64>(5)? as u64,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// 24-hour totals for the dashboard stat tiles.
    pub async fn stats_24h(&self) -> Result<StatsSummary, HubError> {
        let cutoff = to_db(Utc::now() - ChronoDuration::hours(24));
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(success), 0),
                        COALESCE(SUM(cost_usd), 0),
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        AVG(CASE WHEN success = 1 THEN latency_ms END)
                 FROM requests WHERE created_at > ?1",
                params![cutoff],
                |row| {
                    let total: i64 = row.get(0)?;
                    let successful: i64 = row.get(1)?;
                    Ok(StatsSummary {
                        total_requests: total as u64,
                        successful_requests: successful as u64,
                        failed_requests: (total - successful).max(0) as u64,
                        total_cost_usd: row.get(2)?,
                        total_prompt_tokens: row.get::<_, i64>(3)? as u64,
                        total_completion_tokens: row.get::<_, i64>(4)? as u64,
                        avg_latency_ms: row.get(5)?,
                    })
                },
            )
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Alerts
    // ─────────────────────────────────────────────────────────────────────

    fn parse_alert_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRecord> {
        let kind_raw: String = row.get(5)?;
        let severity_raw: String = row.get(6)?;
        let metadata_raw: String = row.get(8)?;
        Ok(AlertRecord {
            id: row.get(0)?,
            created_at: parse_datetime(&row.get::<_, String>(1)?),
            resolved_at: row
                .get::<_, Option<String>>(2)?
                .map(|raw| parse_datetime(&raw)),
            dismissed_at: row
                .get::<_, Option<String>>(3)?
                .map(|raw| parse_datetime(&raw)),
            dedup_key: row.get(4)?,
            kind: AlertKind::from_str(&kind_raw).unwrap_or(AlertKind::ConsecutiveErrors),
            severity: AlertSeverity::from_str(&severity_raw).unwrap_or(AlertSeverity::Warning),
            message: row.get(7)?,
            metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        })
    }

    const ALERT_COLUMNS: &'static str =
        "id, created_at, resolved_at, dismissed_at, dedup_key, kind, severity, message, metadata";

    /// Insert a new active alert unless one with the same dedup key is
    /// already active or was created within the re-alert cooldown. Returns
    /// the inserted record, or `None` when deduplicated.
    pub async fn alert_upsert_active(
        &self,
        connection_id: i64,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        metadata: serde_json::Value,
    ) -> Result<Option<AlertRecord>, HubError> {
        let dedup_key = alert_dedup_key(connection_id, kind);
        self.call(move |conn| {
            let now = Utc::now();
            let cooldown_cutoff = to_db(now - ChronoDuration::minutes(REALERT_COOLDOWN_MINUTES));
            let changed = conn.execute(
                "INSERT INTO alerts (created_at, dedup_key, kind, severity, message, metadata)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6
                 WHERE NOT EXISTS (
                     SELECT 1 FROM alerts
                     WHERE dedup_key = ?2
                       AND ((resolved_at IS NULL AND dismissed_at IS NULL)
                            OR created_at > ?7)
                 )",
                params![
                    to_db(now),
                    dedup_key,
                    kind.as_str(),
                    severity.as_str(),
                    message,
                    metadata.to_string(),
                    cooldown_cutoff,
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM alerts WHERE id = ?1", Self::ALERT_COLUMNS),
                params![id],
                Self::parse_alert_row,
            )
            .optional()
        })
        .await
    }

    /// Auto-clear: mark the active alert for this dedup key resolved.
    pub async fn alert_resolve(&self, connection_id: i64, kind: AlertKind) -> Result<bool, HubError> {
        let dedup_key = alert_dedup_key(connection_id, kind);
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE alerts SET resolved_at = ?1
                 WHERE dedup_key = ?2 AND resolved_at IS NULL AND dismissed_at IS NULL",
                params![to_db(Utc::now()), dedup_key],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// User-driven dismissal by alert id.
    pub async fn alert_dismiss(&self, id: i64) -> Result<bool, HubError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE alerts SET dismissed_at = ?1
                 WHERE id = ?2 AND resolved_at IS NULL AND dismissed_at IS NULL",
                params![to_db(Utc::now()), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn alert_list_active(&self) -> Result<Vec<AlertRecord>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM alerts
                 WHERE resolved_at IS NULL AND dismissed_at IS NULL
                 ORDER BY id DESC",
                Self::ALERT_COLUMNS
            ))?;
            let rows = stmt.query_map([], Self::parse_alert_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn alert_list_recent(&self, limit: u32) -> Result<Vec<AlertRecord>, HubError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM alerts ORDER BY id DESC LIMIT ?1",
                Self::ALERT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], Self::parse_alert_row)?;
            rows.collect()
        })
        .await
    }
}

/// Bucketing for the usage time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGranularity {
    Daily,
    Weekly,
    Monthly,
}

impl TimeGranularity {
    pub fn from_str(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("hub.db")).await.unwrap();
        (store, dir)
    }

    fn sample_connection(service: ProviderFamily) -> ConnectionData {
        ConnectionData {
            name: format!("{} primary", service),
            service,
            category: Some("llm".to_string()),
            base_url: None,
            api_key_enc: Some("enc:v1:ZmFrZQ==".to_string()),
            token_enc: None,
            credential_path_enc: None,
            enabled: true,
            is_default: false,
            daily_limit_usd: 0.0,
            weekly_limit_usd: 0.0,
            monthly_limit_usd: 0.0,
        }
    }

    fn sample_request(provider: &str, cost: f64, success: bool) -> NewRequest {
        NewRequest {
            model: "gpt-4o-mini".to_string(),
            provider: provider.to_string(),
            prompt_tokens: 100,
            completion_tokens: 20,
            cost_usd: cost,
            latency_ms: 250,
            success,
            error: if success {
                None
            } else {
                Some("upstream_transient".to_string())
            },
            workflow: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");

        let store = Store::open(path.clone()).await.unwrap();
        let conn = store
            .upsert_connection(None, sample_connection(ProviderFamily::OpenAi))
            .await
            .unwrap();
        drop(store);

        // Re-open: same tables, no rows lost
        let store = Store::open(path).await.unwrap();
        let listed = store.list_connections().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, conn.id);
    }

    #[tokio::test]
    async fn toggle_roundtrip_preserves_row() {
        let (store, _dir) = test_store().await;
        let created = store
            .upsert_connection(None, sample_connection(ProviderFamily::OpenAi))
            .await
            .unwrap();

        let disabled = store
            .set_connection_enabled(created.id, false)
            .await
            .unwrap()
            .unwrap();
        assert!(!disabled.enabled);

        let restored = store
            .set_connection_enabled(created.id, true)
            .await
            .unwrap()
            .unwrap();
        assert!(restored.enabled);
        assert_eq!(restored.name, created.name);
        assert_eq!(restored.service, created.service);
        assert_eq!(restored.api_key_enc, created.api_key_enc);
        assert_eq!(restored.daily_limit_usd, created.daily_limit_usd);
        assert_eq!(restored.created_at, created.created_at);
    }

    #[tokio::test]
    async fn delete_cascades_cost_configs() {
        let (store, _dir) = test_store().await;
        let created = store
            .upsert_connection(None, sample_connection(ProviderFamily::OpenAi))
            .await
            .unwrap();

        // The auto-seeded '*' config exists
        let configs = store.list_cost_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].connection_id, Some(created.id));

        assert!(store.delete_connection_cascade(created.id).await.unwrap());
        assert!(store.list_cost_configs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_flag_is_exclusive() {
        let (store, _dir) = test_store().await;
        let mut data = sample_connection(ProviderFamily::OpenAi);
        data.is_default = true;
        let first = store.upsert_connection(None, data.clone()).await.unwrap();

        data.name = "second".to_string();
        let second = store.upsert_connection(None, data).await.unwrap();

        let listed = store.list_connections().await.unwrap();
        let first_row = listed.iter().find(|c| c.id == first.id).unwrap();
        assert!(!first_row.is_default);
        assert!(second.is_default);
    }

    #[tokio::test]
    async fn budget_limits_default_on_first_read() {
        let (store, _dir) = test_store().await;
        let limits = store.get_budget_limits().await.unwrap();
        assert_eq!(limits.daily_usd, 5.0);
        assert_eq!(limits.weekly_usd, 25.0);
        assert_eq!(limits.monthly_usd, 80.0);

        store
            .put_budget_limits(BudgetLimits {
                daily_usd: 1.0,
                weekly_usd: 2.0,
                monthly_usd: 3.0,
            })
            .await
            .unwrap();
        let updated = store.get_budget_limits().await.unwrap();
        assert_eq!(updated.daily_usd, 1.0);
    }

    #[tokio::test]
    async fn aggregate_spend_sums_requests_and_api_calls() {
        let (store, _dir) = test_store().await;
        store
            .insert_request(sample_request("openai", 0.50, true))
            .await
            .unwrap();
        store
            .insert_request(sample_request("openai", 0.25, true))
            .await
            .unwrap();
        store
            .insert_request(sample_request("ollama", 9.99, true))
            .await
            .unwrap();
        store
            .insert_api_call(NewApiCall {
                service: "openai".to_string(),
                operation: "list_models".to_string(),
                endpoint: "/v1/models".to_string(),
                method: "GET".to_string(),
                status_code: Some(200),
                latency_ms: 80,
                cost_usd: 0.05,
                metadata: serde_json::json!({}),
                success: true,
                error: None,
            })
            .await
            .unwrap();

        let spend = store
            .aggregate_spend("openai".to_string(), BudgetWindow::Daily)
            .await
            .unwrap();
        assert!((spend - 0.80).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cost_config_resolution_prefers_connection_exact_match() {
        let (store, _dir) = test_store().await;
        let conn = store
            .upsert_connection(None, sample_connection(ProviderFamily::OpenAi))
            .await
            .unwrap();

        store
            .upsert_cost_config(None, "gpt-4o".to_string(), Some(conn.id), 2.5, 10.0)
            .await
            .unwrap();
        store
            .upsert_cost_config(None, "gpt-4o".to_string(), None, 99.0, 99.0)
            .await
            .unwrap();

        let resolved = store
            .resolve_cost_config(conn.id, "gpt-4o".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.input_usd_per_million, 2.5);

        // Unknown model falls back to the connection's '*' row (zero cost)
        let fallback = store
            .resolve_cost_config(conn.id, "gpt-unknown".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.model_pattern, "*");
        assert_eq!(fallback.input_usd_per_million, 0.0);
    }

    #[tokio::test]
    async fn alert_dedup_blocks_second_active() {
        let (store, _dir) = test_store().await;
        let first = store
            .alert_upsert_active(
                7,
                AlertKind::ConsecutiveErrors,
                AlertSeverity::Error,
                "3 consecutive failures".to_string(),
                serde_json::json!({"failures": 3}),
            )
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .alert_upsert_active(
                7,
                AlertKind::ConsecutiveErrors,
                AlertSeverity::Error,
                "still failing".to_string(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(second.is_none());

        let active = store.alert_list_active().await.unwrap();
        assert_eq!(active.len(), 1);

        // A different kind for the same connection is a different dedup key
        let other_kind = store
            .alert_upsert_active(
                7,
                AlertKind::LatencySpike,
                AlertSeverity::Warning,
                "latency x3".to_string(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(other_kind.is_some());
    }

    #[tokio::test]
    async fn alert_resolve_and_cooldown() {
        let (store, _dir) = test_store().await;
        store
            .alert_upsert_active(
                1,
                AlertKind::BudgetThreshold,
                AlertSeverity::Warning,
                "90% of daily budget".to_string(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        assert!(store
            .alert_resolve(1, AlertKind::BudgetThreshold)
            .await
            .unwrap());
        assert!(store.alert_list_active().await.unwrap().is_empty());

        // Within the 15-minute cooldown the same key is not re-raised
        let again = store
            .alert_upsert_active(
                1,
                AlertKind::BudgetThreshold,
                AlertSeverity::Warning,
                "90% of daily budget".to_string(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn alert_dismiss_clears_active() {
        let (store, _dir) = test_store().await;
        let alert = store
            .alert_upsert_active(
                2,
                AlertKind::LatencySpike,
                AlertSeverity::Warning,
                "slow".to_string(),
                serde_json::json!({}),
            )
            .await
            .unwrap()
            .unwrap();

        assert!(store.alert_dismiss(alert.id).await.unwrap());
        assert!(store.alert_list_active().await.unwrap().is_empty());
        // Dismissing twice is a no-op
        assert!(!store.alert_dismiss(alert.id).await.unwrap());
    }

    #[tokio::test]
    async fn usage_timeseries_buckets_by_day_and_provider() {
        let (store, _dir) = test_store().await;
        store
            .insert_request(sample_request("openai", 0.1, true))
            .await
            .unwrap();
        store
            .insert_request(sample_request("openai", 0.2, true))
            .await
            .unwrap();
        store
            .insert_request(sample_request("ollama", 0.0, true))
            .await
            .unwrap();

        let series = store
            .usage_timeseries(TimeGranularity::Daily, None)
            .await
            .unwrap();
        assert_eq!(series.len(), 2);
        let openai = series.iter().find(|p| p.provider == "openai").unwrap();
        assert_eq!(openai.requests, 2);
        assert_eq!(openai.prompt_tokens, 200);
    }

    #[tokio::test]
    async fn stats_24h_counts_success_and_failure() {
        let (store, _dir) = test_store().await;
        store
            .insert_request(sample_request("openai", 0.1, true))
            .await
            .unwrap();
        store
            .insert_request(sample_request("openai", 0.0, false))
            .await
            .unwrap();

        let stats = store.stats_24h().await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.failed_requests, 1);
        assert!(stats.avg_latency_ms.is_some());
    }

    #[tokio::test]
    async fn recent_requests_newest_first() {
        let (store, _dir) = test_store().await;
        for cost in [0.1, 0.2, 0.3] {
            store
                .insert_request(sample_request("openai", cost, true))
                .await
                .unwrap();
        }
        let recent = store.recent_requests(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].id > recent[1].id);
    }
}
