//! SQLite storage backend
//!
//! Pool settings follow the usual edge-deployment tuning: WAL journal for
//! concurrent reads, normal synchronous mode, short busy timeout. The pool
//! lives behind a lock so disconnect/reconnect swaps the whole session.
//!
//! Schema expectations: `tagnames(opc_tag_name, db_field_name)` for the
//! mapping, a wide `process_data(captured_at, <one column per mapped tag>)`
//! table owned by the deployment, and `event_log` for the audit trail. The
//! mapping and audit tables are created when missing; the wide table's
//! column set is deployment configuration and is never created or altered
//! here.

use super::{is_valid_column, HistoryRow, PersistenceBatch, Severity, Storage};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const CREATE_TAGNAMES: &str = "CREATE TABLE IF NOT EXISTS tagnames (
    opc_tag_name TEXT PRIMARY KEY,
    db_field_name TEXT NOT NULL
)";

const CREATE_EVENT_LOG: &str = "CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    message TEXT NOT NULL,
    severity TEXT NOT NULL
)";

/// sqlx-backed storage session
pub struct SqliteStorage {
    path: String,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteStorage {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pool: RwLock::new(None),
        }
    }

    /// Database file path this session was configured with
    pub fn path(&self) -> &str {
        &self.path
    }

    fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .clone()
            .ok_or(GatewayError::StorageDisconnected)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn connect(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::StorageConnection(e.to_string()))?;

        sqlx::query(CREATE_TAGNAMES).execute(&pool).await?;
        sqlx::query(CREATE_EVENT_LOG).execute(&pool).await?;

        info!(path = %self.path, "storage session connected");
        *self.pool.write() = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("storage session closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.read().is_some()
    }

    async fn load_mapping(&self) -> Result<HashMap<String, String>> {
        let pool = self.pool()?;
        let rows = sqlx::query("SELECT opc_tag_name, db_field_name FROM tagnames")
            .fetch_all(&pool)
            .await?;

        let mut mapping = HashMap::with_capacity(rows.len());
        for row in rows {
            let tag: String = row.try_get("opc_tag_name")?;
            let column: String = row.try_get("db_field_name")?;
            if is_valid_column(&column) {
                mapping.insert(tag, column);
            } else {
                warn!(tag = %tag, column = %column, "skipping non-identifier column in tagnames");
            }
        }

        info!(count = mapping.len(), "loaded tag-to-column mappings");
        Ok(mapping)
    }

    async fn insert_batch(&self, batch: &PersistenceBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let pool = self.pool()?;

        // Column names come from the validated mapping only; re-check here
        // so this statement can never be assembled from anything else.
        let mut fields = String::from("captured_at");
        let mut placeholders = String::from("?");
        for (column, _) in &batch.columns {
            if !is_valid_column(column) {
                return Err(GatewayError::PersistenceCycle(format!(
                    "invalid column name in batch: {}",
                    column
                )));
            }
            fields.push_str(", ");
            fields.push_str(column);
            placeholders.push_str(", ?");
        }

        let sql = format!(
            "INSERT INTO process_data ({}) VALUES ({})",
            fields, placeholders
        );

        let mut query = sqlx::query(&sql).bind(batch.captured_at);
        for (_, value) in &batch.columns {
            query = query.bind(value);
        }
        query.execute(&pool).await?;

        Ok(())
    }

    async fn log_event(&self, category: &str, message: &str, severity: Severity) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO event_log (timestamp, event_type, message, severity) VALUES (?, ?, ?, ?)",
        )
        .bind(Utc::now())
        .bind(category)
        .bind(message)
        .bind(severity.as_str())
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn query_history(
        &self,
        column: &str,
        window_hours: i64,
        max_rows: i64,
    ) -> Result<Vec<HistoryRow>> {
        if !is_valid_column(column) {
            return Err(GatewayError::NotFound {
                resource: column.to_string(),
            });
        }

        let pool = self.pool()?;
        let cutoff = Utc::now() - ChronoDuration::hours(window_hours.max(1));

        let sql = format!(
            "SELECT captured_at, {col} AS value FROM process_data \
             WHERE captured_at >= ? AND {col} IS NOT NULL \
             ORDER BY captured_at LIMIT ?",
            col = column
        );

        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(max_rows.max(1))
            .fetch_all(&pool)
            .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            history.push(HistoryRow {
                value: row.try_get("value")?,
                timestamp: row.try_get("captured_at")?,
            });
        }
        Ok(history)
    }
}
