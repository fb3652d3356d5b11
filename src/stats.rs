//! Persistent endpoint statistics
//!
//! SQLite-backed store holding the endpoint roster, per-endpoint aggregate
//! counters, the append-only rate-limit event log and the append-only
//! request log. Aggregates are maintained transactionally together with the
//! log rows so restarts cannot observe a half-applied update.

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS endpoints (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    url         TEXT NOT NULL UNIQUE,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS endpoint_statistics (
    endpoint_id            INTEGER PRIMARY KEY REFERENCES endpoints(id),
    total_requests         INTEGER NOT NULL DEFAULT 0,
    successful_requests    INTEGER NOT NULL DEFAULT 0,
    failed_requests        INTEGER NOT NULL DEFAULT 0,
    rate_limited_requests  INTEGER NOT NULL DEFAULT 0,
    total_response_time_ms INTEGER NOT NULL DEFAULT 0,
    avg_response_time_ms   REAL NOT NULL DEFAULT 0,
    last_request_at        INTEGER
);

CREATE TABLE IF NOT EXISTS rate_limit_events (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id          INTEGER NOT NULL REFERENCES endpoints(id),
    detected_at          INTEGER NOT NULL,
    recovery_at          INTEGER NOT NULL,
    cooldown_duration_ms INTEGER NOT NULL,
    http_status          INTEGER,
    message              TEXT
);

CREATE TABLE IF NOT EXISTS request_log (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id      INTEGER NOT NULL REFERENCES endpoints(id),
    method           TEXT NOT NULL,
    success          INTEGER NOT NULL,
    response_time_ms INTEGER NOT NULL,
    http_status      INTEGER,
    error_message    TEXT,
    created_at       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rate_limit_events_endpoint_time
    ON rate_limit_events(endpoint_id, detected_at);
CREATE INDEX IF NOT EXISTS idx_request_log_endpoint_time
    ON request_log(endpoint_id, created_at);
"#;

/// One row of the request log, chronological order
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub method: String,
    pub success: bool,
    pub response_time_ms: u64,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
    pub created_at_ms: i64,
}

/// Aggregate statistics for one endpoint, as reported by `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatisticsRow {
    pub endpoint_id: i64,
    pub url: String,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub rate_limited_requests: i64,
    pub total_response_time_ms: i64,
    pub avg_response_time_ms: f64,
    pub last_request_at_ms: Option<i64>,
}

/// SQLite-backed statistics store shared by workers and the ingress
pub struct StatsStore {
    pool: SqlitePool,
}

impl StatsStore {
    /// Open (and migrate) the database at `path`, creating parent
    /// directories and the file as needed
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory for {}", path))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        Self::open_with(options).await
    }

    /// In-memory database, used by tests
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        Self::open_with(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn open_with(options: SqliteConnectOptions) -> anyhow::Result<Self> {
        // Single connection: SQLite serializes writers anyway, and this keeps
        // an in-memory database alive for the whole pool lifetime
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open statistics database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to apply statistics schema")?;
        Ok(())
    }

    /// Idempotent endpoint upsert; creates the matching statistics row on
    /// first sight and returns the endpoint id
    pub async fn ensure_endpoint(&self, url: &str) -> anyhow::Result<i64> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO endpoints (url, active, created_at, updated_at) \
             VALUES (?1, 1, ?2, ?2) \
             ON CONFLICT(url) DO UPDATE SET updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(url)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.try_get("id")?;

        sqlx::query("INSERT OR IGNORE INTO endpoint_statistics (endpoint_id) VALUES (?1)")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Append a request-log row and recompute the aggregates in the same
    /// transaction
    pub async fn record_request(
        &self,
        endpoint_id: i64,
        method: &str,
        success: bool,
        response_time_ms: u64,
        http_status: Option<u16>,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO request_log \
             (endpoint_id, method, success, response_time_ms, http_status, error_message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(endpoint_id)
        .bind(method)
        .bind(success)
        .bind(response_time_ms as i64)
        .bind(http_status.map(|s| s as i64))
        .bind(error_message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Column references on the right-hand side read the pre-update values
        sqlx::query(
            "UPDATE endpoint_statistics SET \
             total_requests = total_requests + 1, \
             successful_requests = successful_requests + ?2, \
             failed_requests = failed_requests + ?3, \
             total_response_time_ms = total_response_time_ms + ?4, \
             avg_response_time_ms = CAST(total_response_time_ms + ?4 AS REAL) / (total_requests + 1), \
             last_request_at = ?5 \
             WHERE endpoint_id = ?1",
        )
        .bind(endpoint_id)
        .bind(if success { 1i64 } else { 0 })
        .bind(if success { 0i64 } else { 1 })
        .bind(response_time_ms as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Append a rate-limit event and bump the rate-limited counter
    pub async fn record_rate_limit_event(
        &self,
        endpoint_id: i64,
        cooldown_ms: u64,
        http_status: Option<u16>,
        message: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO rate_limit_events \
             (endpoint_id, detected_at, recovery_at, cooldown_duration_ms, http_status, message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(endpoint_id)
        .bind(now)
        .bind(now + cooldown_ms as i64)
        .bind(cooldown_ms as i64)
        .bind(http_status.map(|s| s as i64))
        .bind(message)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE endpoint_statistics SET rate_limited_requests = rate_limited_requests + 1 \
             WHERE endpoint_id = ?1",
        )
        .bind(endpoint_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Most recent request-log entries for an endpoint, oldest first
    pub async fn recent_requests(
        &self,
        endpoint_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<RequestLogEntry>> {
        let rows = sqlx::query(
            "SELECT method, success, response_time_ms, http_status, error_message, created_at \
             FROM request_log WHERE endpoint_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(endpoint_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(RequestLogEntry {
                method: row.try_get("method")?,
                success: row.try_get::<i64, _>("success")? != 0,
                response_time_ms: row.try_get::<i64, _>("response_time_ms")? as u64,
                http_status: row
                    .try_get::<Option<i64>, _>("http_status")?
                    .map(|s| s as u16),
                error_message: row.try_get("error_message")?,
                created_at_ms: row.try_get("created_at")?,
            });
        }
        entries.reverse();
        Ok(entries)
    }

    /// Average cooldown over the trailing `days` of rate-limit events, or
    /// `None` when the endpoint has no events in that window
    pub async fn average_cooldown(
        &self,
        endpoint_id: i64,
        days: u32,
    ) -> anyhow::Result<Option<u64>> {
        let cutoff = Utc::now().timestamp_millis() - days as i64 * 86_400_000;
        let row = sqlx::query(
            "SELECT AVG(cooldown_duration_ms) AS avg_ms FROM rate_limit_events \
             WHERE endpoint_id = ?1 AND detected_at >= ?2",
        )
        .bind(endpoint_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        let avg: Option<f64> = row.try_get("avg_ms")?;
        Ok(avg.map(|ms| ms.round() as u64))
    }

    /// Aggregate rows for every known endpoint
    pub async fn endpoint_statistics(&self) -> anyhow::Result<Vec<EndpointStatisticsRow>> {
        let rows = sqlx::query(
            "SELECT e.id, e.url, s.total_requests, s.successful_requests, s.failed_requests, \
             s.rate_limited_requests, s.total_response_time_ms, s.avg_response_time_ms, \
             s.last_request_at \
             FROM endpoints e JOIN endpoint_statistics s ON s.endpoint_id = e.id \
             ORDER BY e.id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(EndpointStatisticsRow {
                endpoint_id: row.try_get("id")?,
                url: row.try_get("url")?,
                total_requests: row.try_get("total_requests")?,
                successful_requests: row.try_get("successful_requests")?,
                failed_requests: row.try_get("failed_requests")?,
                rate_limited_requests: row.try_get("rate_limited_requests")?,
                total_response_time_ms: row.try_get("total_response_time_ms")?,
                avg_response_time_ms: row.try_get("avg_response_time_ms")?,
                last_request_at_ms: row.try_get("last_request_at")?,
            });
        }
        Ok(out)
    }

    /// Flush and close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
