//! History store
//!
//! Finished jobs (completed or failed) leave a record behind. The engine
//! talks to the store through [`HistoryRecorder`]; [`Database`] is the
//! SQLite implementation and [`MemoryHistory`] keeps records in memory.
//!
//! ## Submodules
//!
//! - [`migrations`]: connection setup and schema migrations
//! - [`history`]: inserts and queries on the `history` table

use async_trait::async_trait;
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::error::Result;
use crate::types::{HistoryEntry, JobId, Status};

mod history;
mod migrations;

/// Destination of completed-job records
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Store one record and return its id
    async fn record(&self, entry: &HistoryEntry) -> Result<i64>;

    /// Most recent records first
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>>;
}

/// History record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct HistoryRow {
    /// Unique database ID
    pub id: i64,
    /// Job id as 16 hex digits
    pub job_id: String,
    /// Job name
    pub name: String,
    /// Category label
    pub category: Option<String>,
    /// Destination directory on disk
    pub destination: Option<String>,
    /// Completion status code
    pub status: i32,
    /// Why the job failed
    pub fail_message: Option<String>,
    /// Total size in bytes
    pub size_bytes: i64,
    /// Total download duration in seconds
    pub download_time_secs: i64,
    /// Unix timestamp when the job finished
    pub completed_at: i64,
}

impl From<HistoryRow> for HistoryEntry {
    fn from(row: HistoryRow) -> Self {
        use chrono::{TimeZone, Utc};
        use std::time::Duration;

        HistoryEntry {
            id: row.id,
            job_id: row.job_id.parse().unwrap_or(JobId(0)),
            name: row.name,
            category: row.category,
            destination: row.destination.map(PathBuf::from),
            status: Status::from_i32(row.status),
            fail_message: row.fail_message,
            size_bytes: row.size_bytes as u64,
            download_time: Duration::from_secs(row.download_time_secs as u64),
            completed_at: Utc
                .timestamp_opt(row.completed_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Database handle
pub struct Database {
    pool: SqlitePool,
}

#[async_trait]
impl HistoryRecorder for Database {
    async fn record(&self, entry: &HistoryEntry) -> Result<i64> {
        self.insert_history(entry).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.query_history(None, limit, 0).await
    }
}

/// In-memory history, newest last
#[derive(Debug, Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryRecorder for MemoryHistory {
    async fn record(&self, entry: &HistoryEntry) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let id = entries.len() as i64 + 1;
        let mut entry = entry.clone();
        entry.id = id;
        entries.push(entry);
        Ok(id)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
