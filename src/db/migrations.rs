//! Connection setup and the history schema.
//!
//! The schema version lives in SQLite's `user_version` pragma.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use tracing::info;

use super::Database;
use crate::error::DatabaseError;
use crate::{Error, Result};

const SCHEMA_VERSION: i64 = 1;

const HISTORY_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        name TEXT NOT NULL,
        category TEXT,
        destination TEXT,
        status INTEGER NOT NULL,
        fail_message TEXT,
        size_bytes INTEGER NOT NULL,
        download_time_secs INTEGER NOT NULL,
        completed_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_history_completed ON history(completed_at)",
];

fn connection_failed(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Database(DatabaseError::ConnectionFailed(format!("{context}: {e}")))
}

fn migration_failed(e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::MigrationFailed(e.to_string()))
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| connection_failed("failed to create database directory", e))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| connection_failed("failed to parse database path", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| connection_failed("failed to connect to database", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(migration_failed)?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        info!(from = version, to = SCHEMA_VERSION, "migrating history database");
        let mut tx = self.pool.begin().await.map_err(migration_failed)?;
        for statement in HISTORY_SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(migration_failed)?;
        }
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *tx)
            .await
            .map_err(migration_failed)?;
        tx.commit().await.map_err(migration_failed)
    }

    /// Close the pool, waiting for open connections
    pub async fn close(self) {
        self.pool.close().await;
    }
}
