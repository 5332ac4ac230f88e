//! SQLite snapshot store.
//!
//! Implements `SnapshotStore` from `stepweave-core`. The full snapshot is
//! stored as JSON in `payload`; the summary columns exist for listing.
//! Timestamps are fixed-width RFC 3339 so `ORDER BY suspended_at` sorts
//! chronologically.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepweave_core::repository::SnapshotStore;
use stepweave_types::error::RepositoryError;
use stepweave_types::snapshot::{SnapshotSummary, SuspendedExecutionState};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SnapshotStore`.
pub struct SqliteSnapshotStore {
    pool: DatabasePool,
}

impl SqliteSnapshotStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct SummaryRow {
    execution_id: String,
    flow_name: String,
    resume_from_step_index: i64,
    reason: String,
    suspended_at: String,
}

impl SummaryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            flow_name: row.try_get("flow_name")?,
            resume_from_step_index: row.try_get("resume_from_step_index")?,
            reason: row.try_get("reason")?,
            suspended_at: row.try_get("suspended_at")?,
        })
    }

    fn into_summary(self) -> Result<SnapshotSummary, RepositoryError> {
        let execution_id = Uuid::parse_str(&self.execution_id)
            .map_err(|e| RepositoryError::Query(format!("invalid execution_id: {e}")))?;
        let resume_from_step_index = usize::try_from(self.resume_from_step_index)
            .map_err(|e| RepositoryError::Query(format!("invalid resume index: {e}")))?;
        Ok(SnapshotSummary {
            execution_id,
            flow_name: self.flow_name,
            resume_from_step_index,
            suspended_at: parse_datetime(&self.suspended_at)?,
            reason: self.reason,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

// ---------------------------------------------------------------------------
// SnapshotStore implementation
// ---------------------------------------------------------------------------

impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &SuspendedExecutionState) -> Result<(), RepositoryError> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize snapshot: {e}")))?;

        sqlx::query(
            r#"INSERT INTO snapshots (execution_id, flow_name, resume_from_step_index, reason, suspended_at, payload)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT (execution_id) DO UPDATE SET
                   flow_name = excluded.flow_name,
                   resume_from_step_index = excluded.resume_from_step_index,
                   reason = excluded.reason,
                   suspended_at = excluded.suspended_at,
                   payload = excluded.payload"#,
        )
        .bind(snapshot.execution_id.to_string())
        .bind(&snapshot.flow_definition.name)
        .bind(snapshot.resume_from_step_index as i64)
        .bind(&snapshot.reason)
        .bind(snapshot.suspended_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(&payload)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(execution_id = %snapshot.execution_id, "snapshot saved");
        Ok(())
    }

    async fn take(&self, execution_id: &Uuid) -> Result<Option<SuspendedExecutionState>, RepositoryError> {
        let row = sqlx::query("DELETE FROM snapshots WHERE execution_id = ? RETURNING payload")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row
            .try_get("payload")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let snapshot = serde_json::from_str(&payload)
            .map_err(|e| RepositoryError::Query(format!("invalid snapshot payload: {e}")))?;
        Ok(Some(snapshot))
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT execution_id, flow_name, resume_from_step_index, reason, suspended_at \
             FROM snapshots ORDER BY suspended_at DESC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                SummaryRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_summary()
            })
            .collect()
    }
}
