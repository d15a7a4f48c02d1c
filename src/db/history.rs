//! History management operations.

use crate::types::HistoryEntry;
use crate::{Error, Result};

use super::{Database, HistoryRow};

const HISTORY_COLUMNS: &str = "id, job_id, name, category, destination, status, fail_message, \
                               size_bytes, download_time_secs, completed_at";

impl Database {
    /// Insert a finished job into history
    pub async fn insert_history(&self, entry: &HistoryEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO history (
                job_id, name, category, destination, status, fail_message,
                size_bytes, download_time_secs, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.job_id.to_string())
        .bind(&entry.name)
        .bind(&entry.category)
        .bind(
            entry
                .destination
                .as_ref()
                .and_then(|p| p.to_str().map(String::from)),
        )
        .bind(entry.status.to_i32())
        .bind(&entry.fail_message)
        .bind(entry.size_bytes as i64)
        .bind(entry.download_time.as_secs() as i64)
        .bind(entry.completed_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(result.last_insert_rowid())
    }

    /// Query history with pagination and optional status filter
    ///
    /// Returns history entries ordered by completion time (most recent first).
    pub async fn query_history(
        &self,
        status_filter: Option<i32>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let rows = if let Some(status) = status_filter {
            sqlx::query_as::<_, HistoryRow>(&format!(
                "SELECT {HISTORY_COLUMNS} FROM history WHERE status = ? \
                 ORDER BY completed_at DESC, id DESC LIMIT ? OFFSET ?"
            ))
            .bind(status)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, HistoryRow>(&format!(
                "SELECT {HISTORY_COLUMNS} FROM history \
                 ORDER BY completed_at DESC, id DESC LIMIT ? OFFSET ?"
            ))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(Error::Sqlx)?;

        Ok(rows.into_iter().map(HistoryEntry::from).collect())
    }

    /// Count history entries (optionally filtered by status)
    pub async fn count_history(&self, status_filter: Option<i32>) -> Result<i64> {
        let count = if let Some(status) = status_filter {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM history WHERE status = ?")
                .bind(status)
                .fetch_one(&self.pool)
                .await
        } else {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM history")
                .fetch_one(&self.pool)
                .await
        }
        .map_err(Error::Sqlx)?;

        Ok(count)
    }

    /// Delete history entries older than the specified timestamp
    ///
    /// Returns the number of records deleted.
    pub async fn delete_history_before(&self, before_timestamp: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM history WHERE completed_at < ?")
            .bind(before_timestamp)
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;

        Ok(result.rows_affected())
    }

    /// Get a single history entry by ID
    pub async fn get_history_entry(&self, id: i64) -> Result<Option<HistoryEntry>> {
        let row = sqlx::query_as::<_, HistoryRow>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(row.map(HistoryEntry::from))
    }
}
