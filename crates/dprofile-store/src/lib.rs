//! Device Profile Store - SQLite storage adapters
//!
//! SQLite-based persistence for:
//! - The trust ledger tables (trust devices, accessers, accessees, ACLs)
//! - The dynamic profile KV entries with per-entry owner tracking
//!
//! ## Architecture
//!
//! This crate implements the `IRelationalStore` and `IKvStore` ports from
//! `dprofile-core` using SQLite as the storage backend. It is a driven
//! (secondary) adapter in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteRelationalStore`] - `IRelationalStore` with restore-and-retry on corruption
//! - [`SqliteKvStore`] - `IKvStore` with change notifications and in-process peer sync
//! - [`StoreError`] - Error types for store operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use dprofile_core::ports::IRelationalStore;
//! use dprofile_store::SqliteRelationalStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = SqliteRelationalStore::new(
//!     Path::new("/var/lib/dprofile/trust_profile.db"),
//!     Path::new("/var/lib/dprofile/trust_profile.db.bak"),
//! );
//! store.init().await?;
//! # Ok(())
//! # }
//! ```

pub mod kv;
pub mod pool;
pub mod relational;

pub use kv::SqliteKvStore;
pub use pool::DatabasePool;
pub use relational::SqliteRelationalStore;

use dprofile_core::domain::StorageError;

/// SQLite primary result code for a malformed database image
pub(crate) const SQLITE_CORRUPT: i32 = 11;
/// SQLite primary result code for a file that is not a database
const SQLITE_NOTADB: i32 = 26;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to establish a database connection
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String, code: Option<i32> },

    /// A database statement failed
    #[error("Query failed: {message}")]
    QueryFailed { message: String, code: Option<i32> },

    /// Schema migration failed
    #[error("Migration failed: {message}")]
    MigrationFailed { message: String, code: Option<i32> },

    /// A table or column name contains characters outside `[A-Za-z0-9_]`
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The store has not been initialized
    #[error("Store not initialized")]
    NotInitialized,

    /// Filesystem error while backing up or restoring
    #[error("I/O error: {0}")]
    Io(String),
}

/// Extended SQLite result code carried by a driver error, if any
pub(crate) fn sqlite_code(e: &sqlx::Error) -> Option<i32> {
    e.as_database_error()
        .and_then(|db| db.code())
        .and_then(|code| code.parse::<i32>().ok())
}

impl StoreError {
    pub(crate) fn connection(context: impl std::fmt::Display, e: sqlx::Error) -> Self {
        StoreError::ConnectionFailed {
            code: sqlite_code(&e),
            message: format!("{}: {}", context, e),
        }
    }

    pub(crate) fn migration(context: impl std::fmt::Display, e: sqlx::Error) -> Self {
        StoreError::MigrationFailed {
            code: sqlite_code(&e),
            message: format!("{}: {}", context, e),
        }
    }

    /// Whether SQLite reported a corrupt or unreadable database image
    pub fn is_corruption(&self) -> bool {
        let code = match self {
            StoreError::ConnectionFailed { code, .. }
            | StoreError::QueryFailed { code, .. }
            | StoreError::MigrationFailed { code, .. } => *code,
            _ => None,
        };
        matches!(code.map(|c| c & 0xff), Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::QueryFailed {
            code: sqlite_code(&e),
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        if e.is_corruption() {
            return StorageError::Corrupted(e.to_string());
        }
        match e {
            StoreError::NotInitialized => StorageError::Unavailable(e.to_string()),
            other => StorageError::Operation(other.to_string()),
        }
    }
}

/// Validates a table or column name before it is spliced into SQL
pub(crate) fn check_identifier(name: &str) -> Result<&str, StoreError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_uses_primary_code() {
        let corrupt = StoreError::QueryFailed {
            message: "database disk image is malformed".into(),
            code: Some(11),
        };
        assert!(corrupt.is_corruption());

        // SQLITE_CORRUPT_VTAB is an extended code of SQLITE_CORRUPT
        let extended = StoreError::QueryFailed {
            message: "vtab".into(),
            code: Some(267),
        };
        assert!(extended.is_corruption());

        let notadb = StoreError::ConnectionFailed {
            message: "file is not a database".into(),
            code: Some(26),
        };
        assert!(notadb.is_corruption());

        let busy = StoreError::QueryFailed {
            message: "database is locked".into(),
            code: Some(5),
        };
        assert!(!busy.is_corruption());
        assert!(!StoreError::NotInitialized.is_corruption());
    }

    #[test]
    fn maps_onto_port_errors() {
        let err: StorageError = StoreError::NotInitialized.into();
        assert!(matches!(err, StorageError::Unavailable(_)));

        let err: StorageError = StoreError::QueryFailed {
            message: "malformed".into(),
            code: Some(11),
        }
        .into();
        assert!(matches!(err, StorageError::Corrupted(_)));

        let err: StorageError = StoreError::InvalidIdentifier("a b".into()).into();
        assert!(matches!(err, StorageError::Operation(_)));
    }

    #[test]
    fn identifiers_are_restricted() {
        assert!(check_identifier("access_control_table").is_ok());
        assert!(check_identifier("accesserId").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("t; DROP TABLE x").is_err());
        assert!(check_identifier("a-b").is_err());
    }
}
