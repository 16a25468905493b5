//! History and statistics store.
//!
//! SQLite persistence for:
//! - Execution records (one row per operation, one summary row per run)
//! - Notification events (write-once event log)
//!
//! The module is organized into submodules:
//! - `records` - All record types (entities) and closed vocabularies
//! - `stats` - Pure aggregate/trend/suggestion functions over fetched rows
//!
//! Init creates the schema, repairs runs interrupted by a crash (rows stuck
//! in `running`), and compacts history past the retention window.

pub mod records;
pub mod stats;

pub use records::*;
pub use stats::{StatisticsSummary, TrendReport};

use crate::errors::DatabaseError;
use chrono::{Duration, Utc};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub struct Database {
    pool: Pool<Sqlite>,
}

fn query_err(context: &str) -> impl FnOnce(sqlx::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::QueryFailed {
        query: context.to_string(),
        reason: e.to_string(),
    }
}

impl Database {
    /// Expose pool for integration test queries
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Opens (creating if needed) the history database and runs the full
    /// init sequence: schema, stuck-run repair, retention compaction.
    pub async fn new(database_path: &str, retention_days: i64) -> Result<Self, DatabaseError> {
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::ConnectionFailed {
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", database_path);
        debug!("Connecting to history database: {}", database_url);

        let pool = SqlitePool::connect(&database_url).await.map_err(|e| {
            DatabaseError::ConnectionFailed {
                reason: format!("{} ({})", e, database_url),
            }
        })?;

        let database = Self { pool };
        database.initialize_tables().await?;

        let repaired = database.repair_stuck_runs().await?;
        if repaired > 0 {
            warn!("Repaired {} runs left in 'running' state by a crash", repaired);
        }

        let compacted = database.compact_history(retention_days).await?;
        if compacted > 0 {
            info!(
                "Compaction removed {} records older than {} days",
                compacted, retention_days
            );
        }

        Ok(database)
    }

    async fn initialize_tables(&self) -> Result<(), DatabaseError> {
        let records_table_sql = r#"
            CREATE TABLE IF NOT EXISTS execution_records (
                id TEXT PRIMARY KEY,
                operation_type TEXT NOT NULL,
                profile TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                completed_at DATETIME,
                duration_seconds INTEGER NOT NULL DEFAULT 0,
                space_freed_bytes INTEGER NOT NULL DEFAULT 0,
                files_processed INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                system_load_at_start REAL NOT NULL DEFAULT 0,
                memory_usage_at_start INTEGER NOT NULL DEFAULT 0,
                trigger_kind TEXT NOT NULL,
                details TEXT
            )
        "#;
        sqlx::query(records_table_sql)
            .execute(&self.pool)
            .await
            .map_err(query_err("create execution_records"))?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_records_profile ON execution_records(profile, started_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_records_status ON execution_records(status, started_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_records_operation ON execution_records(operation_type, started_at DESC)",
        ] {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(query_err("create execution_records index"))?;
        }

        let events_table_sql = r#"
            CREATE TABLE IF NOT EXISTS notification_events (
                id TEXT PRIMARY KEY,
                timestamp DATETIME NOT NULL,
                level TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                operation TEXT
            )
        "#;
        sqlx::query(events_table_sql)
            .execute(&self.pool)
            .await
            .map_err(query_err("create notification_events"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON notification_events(timestamp DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(query_err("create notification_events index"))?;

        let meta_table_sql = r#"
            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
        "#;
        sqlx::query(meta_table_sql)
            .execute(&self.pool)
            .await
            .map_err(query_err("create schema_meta"))?;

        sqlx::query("INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?)")
            .bind(SCHEMA_VERSION.to_string())
            .execute(&self.pool)
            .await
            .map_err(query_err("write schema_version"))?;

        debug!("History store schema ready");
        Ok(())
    }

    /// Flips records still marked `running` whose start is older than the
    /// stuck threshold to `crashed`. A crash of the orchestrator must not
    /// leave phantom in-progress rows.
    pub async fn repair_stuck_runs(&self) -> Result<u32, DatabaseError> {
        let cutoff = Utc::now() - Duration::hours(crate::constants::history::STUCK_RUN_HOURS);

        let result = sqlx::query(
            r#"
            UPDATE execution_records
            SET status = 'crashed',
                completed_at = ?,
                details = 'marked crashed at init: run was stuck in running state'
            WHERE status = 'running' AND started_at < ?
            "#,
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(query_err("repair stuck runs"))?;

        Ok(result.rows_affected() as u32)
    }

    /// Deletes execution records and notification events older than the
    /// retention window. Returns the number of rows removed.
    pub async fn compact_history(&self, retention_days: i64) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(retention_days);

        let records = sqlx::query("DELETE FROM execution_records WHERE started_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(query_err("compact execution_records"))?;

        let events = sqlx::query("DELETE FROM notification_events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(query_err("compact notification_events"))?;

        Ok(records.rows_affected() + events.rows_affected())
    }

    // ========================================================================
    // Execution records
    // ========================================================================

    pub async fn insert_execution_record(
        &self,
        record: &ExecutionRecord,
    ) -> Result<(), DatabaseError> {
        debug!("Storing execution record {}", record.id);

        sqlx::query(
            r#"
            INSERT INTO execution_records (
                id, operation_type, profile, status, started_at, completed_at,
                duration_seconds, space_freed_bytes, files_processed, error_count,
                system_load_at_start, memory_usage_at_start, trigger_kind, details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.operation_type)
        .bind(&record.profile)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_seconds)
        .bind(record.space_freed_bytes)
        .bind(record.files_processed)
        .bind(record.error_count)
        .bind(record.system_load_at_start)
        .bind(record.memory_usage_at_start)
        .bind(record.trigger.as_str())
        .bind(&record.details)
        .execute(&self.pool)
        .await
        .map_err(query_err("insert execution_record"))?;

        Ok(())
    }

    /// Finalizes a run-summary row begun in the `running` state. This is the
    /// only mutation of an execution record; completed rows are immutable.
    pub async fn complete_execution_record(
        &self,
        record: &ExecutionRecord,
    ) -> Result<(), DatabaseError> {
        debug!(
            "Completing execution record {} with status {}",
            record.id, record.status
        );

        sqlx::query(
            r#"
            UPDATE execution_records
            SET status = ?, completed_at = ?, duration_seconds = ?,
                space_freed_bytes = ?, files_processed = ?, error_count = ?,
                details = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.completed_at)
        .bind(record.duration_seconds)
        .bind(record.space_freed_bytes)
        .bind(record.files_processed)
        .bind(record.error_count)
        .bind(&record.details)
        .bind(&record.id)
        .execute(&self.pool)
        .await
        .map_err(query_err("complete execution_record"))?;

        Ok(())
    }

    pub async fn get_execution_record(
        &self,
        record_id: &str,
    ) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, operation_type, profile, status, started_at, completed_at,
                   duration_seconds, space_freed_bytes, files_processed, error_count,
                   system_load_at_start, memory_usage_at_start, trigger_kind, details
            FROM execution_records
            WHERE id = ?
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("get execution_record"))?;

        row.map(row_to_execution_record).transpose()
    }

    /// History query: newest first, optionally filtered by profile, bounded
    /// by a day window and a row cap.
    pub async fn query_history(
        &self,
        profile: Option<&str>,
        days: i64,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(days);

        let rows = match profile {
            Some(profile) => {
                sqlx::query(
                    r#"
                    SELECT id, operation_type, profile, status, started_at, completed_at,
                           duration_seconds, space_freed_bytes, files_processed, error_count,
                           system_load_at_start, memory_usage_at_start, trigger_kind, details
                    FROM execution_records
                    WHERE profile = ? AND started_at >= ?
                    ORDER BY started_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(profile)
                .bind(cutoff)
                .bind(crate::constants::history::MAX_HISTORY_ROWS)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, operation_type, profile, status, started_at, completed_at,
                           duration_seconds, space_freed_bytes, files_processed, error_count,
                           system_load_at_start, memory_usage_at_start, trigger_kind, details
                    FROM execution_records
                    WHERE started_at >= ?
                    ORDER BY started_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(cutoff)
                .bind(crate::constants::history::MAX_HISTORY_ROWS)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(query_err("query history"))?;

        rows.into_iter().map(row_to_execution_record).collect()
    }

    pub async fn last_run_for_profile(
        &self,
        profile: &str,
    ) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, operation_type, profile, status, started_at, completed_at,
                   duration_seconds, space_freed_bytes, files_processed, error_count,
                   system_load_at_start, memory_usage_at_start, trigger_kind, details
            FROM execution_records
            WHERE profile = ? AND operation_type = ?
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(profile)
        .bind(RUN_RECORD_TYPE)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("last run for profile"))?;

        row.map(row_to_execution_record).transpose()
    }

    // ========================================================================
    // Notification events
    // ========================================================================

    pub async fn append_notification_event(
        &self,
        event: &NotificationEventRecord,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO notification_events (id, timestamp, level, title, message, operation)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(event.timestamp)
        .bind(event.level.as_str())
        .bind(&event.title)
        .bind(&event.message)
        .bind(&event.operation)
        .execute(&self.pool)
        .await
        .map_err(query_err("append notification_event"))?;

        Ok(())
    }

    pub async fn recent_notification_events(
        &self,
        limit: i64,
    ) -> Result<Vec<NotificationEventRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, level, title, message, operation
            FROM notification_events
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("recent notification_events"))?;

        rows.into_iter()
            .map(|row| {
                let level: String = row.try_get("level").map_err(row_err)?;
                Ok(NotificationEventRecord {
                    id: row.try_get("id").map_err(row_err)?,
                    timestamp: row.try_get("timestamp").map_err(row_err)?,
                    level: NotificationLevel::from_str(&level)
                        .map_err(|reason| DatabaseError::SerializationError { reason })?,
                    title: row.try_get("title").map_err(row_err)?,
                    message: row.try_get("message").map_err(row_err)?,
                    operation: row.try_get("operation").map_err(row_err)?,
                })
            })
            .collect()
    }
}

fn row_err(e: sqlx::Error) -> DatabaseError {
    DatabaseError::SerializationError {
        reason: e.to_string(),
    }
}

fn row_to_execution_record(
    row: sqlx::sqlite::SqliteRow,
) -> Result<ExecutionRecord, DatabaseError> {
    let status: String = row.try_get("status").map_err(row_err)?;
    let trigger: String = row.try_get("trigger_kind").map_err(row_err)?;

    Ok(ExecutionRecord {
        id: row.try_get("id").map_err(row_err)?,
        operation_type: row.try_get("operation_type").map_err(row_err)?,
        profile: row.try_get("profile").map_err(row_err)?,
        status: RunStatus::from_str(&status)
            .map_err(|reason| DatabaseError::SerializationError { reason })?,
        started_at: row.try_get("started_at").map_err(row_err)?,
        completed_at: row.try_get("completed_at").map_err(row_err)?,
        duration_seconds: row.try_get("duration_seconds").map_err(row_err)?,
        space_freed_bytes: row.try_get("space_freed_bytes").map_err(row_err)?,
        files_processed: row.try_get("files_processed").map_err(row_err)?,
        error_count: row.try_get("error_count").map_err(row_err)?,
        system_load_at_start: row.try_get("system_load_at_start").map_err(row_err)?,
        memory_usage_at_start: row.try_get("memory_usage_at_start").map_err(row_err)?,
        trigger: Trigger::from_str(&trigger)
            .map_err(|reason| DatabaseError::SerializationError { reason })?,
        details: row.try_get("details").map_err(row_err)?,
    })
}
