//! SQLite implementation of the relational store port
//!
//! Every statement runs against the current pool. When SQLite reports a
//! corrupt image (`SQLITE_CORRUPT` / `SQLITE_NOTADB`) the store restores the
//! database file from the last backup, reopens the pool and retries the
//! statement exactly once.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteArguments, SqlitePool, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};
use tokio::sync::RwLock;

use dprofile_core::domain::StorageError;
use dprofile_core::ports::{IRelationalStore, Row, Value, ValuesBucket};

use crate::{check_identifier, DatabasePool, StoreError};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Where the database lives
#[derive(Debug, Clone)]
enum Location {
    File { db: PathBuf, backup: PathBuf },
    Memory,
}

/// `IRelationalStore` backed by SQLite
pub struct SqliteRelationalStore {
    location: Location,
    init_max_attempts: u32,
    init_retry_interval: Duration,
    pool: RwLock<Option<DatabasePool>>,
}

impl SqliteRelationalStore {
    /// File-backed store with a backup location used for restore
    pub fn new(db_path: &Path, backup_path: &Path) -> Self {
        Self {
            location: Location::File {
                db: db_path.to_path_buf(),
                backup: backup_path.to_path_buf(),
            },
            init_max_attempts: 3,
            init_retry_interval: Duration::from_millis(200),
            pool: RwLock::new(None),
        }
    }

    /// In-memory store for tests; backup and restore are unsupported
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            init_max_attempts: 1,
            init_retry_interval: Duration::ZERO,
            pool: RwLock::new(None),
        }
    }

    /// Overrides how often `init` tries to open the database
    pub fn with_init_retry(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.init_max_attempts = max_attempts.max(1);
        self.init_retry_interval = interval;
        self
    }

    async fn open(&self) -> Result<DatabasePool, StoreError> {
        match &self.location {
            Location::File { db, .. } => DatabasePool::new(db).await,
            Location::Memory => DatabasePool::in_memory().await,
        }
    }

    async fn current_pool(&self) -> Result<SqlitePool, StorageError> {
        self.pool
            .read()
            .await
            .as_ref()
            .map(|p| p.pool().clone())
            .ok_or_else(|| StoreError::NotInitialized.into())
    }

    /// Runs `op`, restoring and retrying once on corruption
    async fn with_restore<T, F, Fut>(&self, op: F) -> Result<T, StorageError>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let pool = self.current_pool().await?;
        match op(pool).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_corruption() => {
                tracing::warn!(error = %e, "Relational store corrupted, restoring from backup");
                self.restore()
                    .await
                    .map_err(|r| StorageError::RestoreFailed(r.to_string()))?;
                let pool = self.current_pool().await?;
                op(pool).await.map_err(StorageError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copies the backup over the database file and reopens the pool
    async fn restore_file(&self, db: &Path, backup: &Path) -> Result<DatabasePool, StoreError> {
        if !backup.exists() {
            return Err(StoreError::Io(format!(
                "no backup at {}",
                backup.display()
            )));
        }
        for sidecar in ["-wal", "-shm"] {
            let mut path = db.as_os_str().to_os_string();
            path.push(sidecar);
            let path = PathBuf::from(path);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        std::fs::copy(backup, db)?;
        DatabasePool::new(db).await
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.as_str()),
    }
}

fn row_from_sqlite(row: &SqliteRow) -> Result<Row, StoreError> {
    let mut columns = BTreeMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        let (is_null, type_name) = {
            let raw = row.try_get_raw(i)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };
        let value = if is_null {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::Integer(row.try_get::<i64, _>(i)?),
                "REAL" => Value::Text(row.try_get::<f64, _>(i)?.to_string()),
                _ => Value::Text(row.try_get::<String, _>(i)?),
            }
        };
        columns.insert(column.name().to_string(), value);
    }
    Ok(Row::new(columns))
}

#[async_trait::async_trait]
impl IRelationalStore for SqliteRelationalStore {
    async fn init(&self) -> Result<(), StorageError> {
        let mut last_error = None;
        for attempt in 1..=self.init_max_attempts {
            match self.open().await {
                Ok(pool) => {
                    *self.pool.write().await = Some(pool);
                    tracing::info!(attempt, "Relational store initialized");
                    return Ok(());
                }
                Err(e) if e.is_corruption() => {
                    tracing::warn!(attempt, error = %e, "Relational store corrupted on open");
                    return self
                        .restore()
                        .await
                        .map_err(|r| StorageError::RestoreFailed(r.to_string()));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Failed to open relational store");
                    last_error = Some(e);
                    if attempt < self.init_max_attempts {
                        tokio::time::sleep(self.init_retry_interval).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(StoreError::NotInitialized).into())
    }

    async fn uninit(&self) -> Result<(), StorageError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        tracing::info!("Relational store closed");
        Ok(())
    }

    async fn put(&self, table: &str, values: &ValuesBucket) -> Result<i64, StorageError> {
        self.with_restore(|pool| async move {
            let table = check_identifier(table)?;
            let columns = values
                .keys()
                .map(|c| check_identifier(c))
                .collect::<Result<Vec<_>, _>>()?;
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for value in values.values() {
                query = bind_value(query, value);
            }
            let result = query.execute(&pool).await?;
            Ok::<_, StoreError>(result.last_insert_rowid())
        })
        .await
    }

    async fn delete(
        &self,
        table: &str,
        where_clause: &str,
        args: &[Value],
    ) -> Result<u64, StorageError> {
        self.with_restore(|pool| async move {
            let table = check_identifier(table)?;
            let sql = format!("DELETE FROM {} WHERE {}", table, where_clause);
            let mut query = sqlx::query(&sql);
            for value in args {
                query = bind_value(query, value);
            }
            Ok::<_, StoreError>(query.execute(&pool).await?.rows_affected())
        })
        .await
    }

    async fn update(
        &self,
        table: &str,
        values: &ValuesBucket,
        where_clause: &str,
        args: &[Value],
    ) -> Result<u64, StorageError> {
        self.with_restore(|pool| async move {
            let table = check_identifier(table)?;
            let assignments = values
                .keys()
                .map(|c| check_identifier(c).map(|c| format!("{} = ?", c)))
                .collect::<Result<Vec<_>, _>>()?;
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                table,
                assignments.join(", "),
                where_clause
            );
            let mut query = sqlx::query(&sql);
            for value in values.values().chain(args.iter()) {
                query = bind_value(query, value);
            }
            Ok::<_, StoreError>(query.execute(&pool).await?.rows_affected())
        })
        .await
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, StorageError> {
        self.with_restore(|pool| async move {
            let mut query = sqlx::query(sql);
            for value in args {
                query = bind_value(query, value);
            }
            let rows = query.fetch_all(&pool).await?;
            rows.iter()
                .map(row_from_sqlite)
                .collect::<Result<Vec<_>, StoreError>>()
        })
        .await
    }

    async fn backup(&self) -> Result<(), StorageError> {
        let Location::File { backup, .. } = &self.location else {
            return Err(StorageError::Operation(
                "in-memory store has no backup location".to_string(),
            ));
        };
        let pool = self.current_pool().await?;
        if backup.exists() {
            std::fs::remove_file(backup).map_err(StoreError::from)?;
        }
        let target = backup.to_string_lossy().replace('\'', "''");
        sqlx::raw_sql(&format!("VACUUM INTO '{}'", target))
            .execute(&pool)
            .await
            .map_err(StoreError::from)?;
        tracing::info!(path = %backup.display(), "Relational store backed up");
        Ok(())
    }

    async fn restore(&self) -> Result<(), StorageError> {
        let Location::File { db, backup } = &self.location else {
            return Err(StorageError::RestoreFailed(
                "in-memory store cannot be restored".to_string(),
            ));
        };
        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }
        match self.restore_file(db, backup).await {
            Ok(pool) => {
                *guard = Some(pool);
                tracing::info!(path = %db.display(), "Relational store restored from backup");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to restore relational store");
                Err(StorageError::RestoreFailed(e.to_string()))
            }
        }
    }
}
