//! SQLite pool shared by the relational and KV stores
//!
//! Opening a database file runs `PRAGMA quick_check` before the schema is
//! applied. A damaged image is reported with the `SQLITE_CORRUPT` code, the
//! same signal a failing statement carries, so the relational store restores
//! from its backup whether the damage shows up at open or mid-operation. A
//! restored image goes through the same check before it is accepted.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::{StoreError, SQLITE_CORRUPT};

const FILE_MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// An open, checked and migrated SQLite database
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens a WAL database file, creating it and its directory if needed
    ///
    /// # Errors
    ///
    /// A file that is not a readable SQLite image fails with an error for
    /// which [`StoreError::is_corruption`] holds.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::connection(format!("Failed to open {}", db_path.display()), e))?;

        let opened = Self::prepare(pool).await?;
        tracing::info!(path = %db_path.display(), "Database opened");
        Ok(opened)
    }

    /// Private in-memory database; one connection, since each SQLite memory
    /// database lives and dies with its connection
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::connection("Failed to create in-memory database", e))?;
        Self::prepare(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection; pending checkouts finish first
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Checks the image and applies the schema, closing the pool on failure
    async fn prepare(pool: SqlitePool) -> Result<Self, StoreError> {
        let checked = match check_integrity(&pool).await {
            Ok(()) => apply_schema(&pool).await,
            Err(e) => Err(e),
        };
        match checked {
            Ok(()) => Ok(Self { pool }),
            Err(e) => {
                pool.close().await;
                Err(e)
            }
        }
    }
}

async fn check_integrity(pool: &SqlitePool) -> Result<(), StoreError> {
    let verdict: String = sqlx::query_scalar("PRAGMA quick_check(1)")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::connection("Integrity check failed to run", e))?;
    if verdict == "ok" {
        return Ok(());
    }
    Err(StoreError::ConnectionFailed {
        message: format!("Integrity check failed: {}", verdict),
        code: Some(SQLITE_CORRUPT),
    })
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(include_str!("migrations/0001_profile_schema.sql"))
        .execute(pool)
        .await
        .map_err(|e| StoreError::migration("Failed to apply profile schema", e))?;
    tracing::debug!("Profile schema applied");
    Ok(())
}
