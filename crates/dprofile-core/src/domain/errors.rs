//! Domain error types
//!
//! [`ProfileError`] is the taxonomy returned by every public ledger and
//! engine operation. [`StorageError`] is what the storage ports report;
//! callers map it into a `ProfileError` naming the failed step.

use thiserror::Error;

/// The storage step that failed, carried by [`ProfileError::StorageFailed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Init,
    Query,
    PutAcl,
    PutAccesser,
    PutAccessee,
    PutTrustDevice,
    UpdateAcl,
    UpdateAccesser,
    UpdateAccessee,
    UpdateTrustDevice,
    DeleteAcl,
    DeleteAccesser,
    DeleteAccessee,
    DeleteTrustDevice,
    PutKv,
    GetKv,
    DeleteKv,
    SyncKv,
}

impl std::fmt::Display for StorageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageOp::Init => "initialize store",
            StorageOp::Query => "query",
            StorageOp::PutAcl => "put access control profile",
            StorageOp::PutAccesser => "put accesser profile",
            StorageOp::PutAccessee => "put accessee profile",
            StorageOp::PutTrustDevice => "put trust device profile",
            StorageOp::UpdateAcl => "update access control profile",
            StorageOp::UpdateAccesser => "update accesser profile",
            StorageOp::UpdateAccessee => "update accessee profile",
            StorageOp::UpdateTrustDevice => "update trust device profile",
            StorageOp::DeleteAcl => "delete access control profile",
            StorageOp::DeleteAccesser => "delete accesser profile",
            StorageOp::DeleteAccessee => "delete accessee profile",
            StorageOp::DeleteTrustDevice => "delete trust device profile",
            StorageOp::PutKv => "put kv entries",
            StorageOp::GetKv => "get kv entries",
            StorageOp::DeleteKv => "delete kv entries",
            StorageOp::SyncKv => "sync kv store",
        };
        write!(f, "{}", s)
    }
}

/// Errors reported by the storage ports
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The store handle has not been initialized (or was released)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store reported corruption and no restore was attempted
    #[error("Store corrupted: {0}")]
    Corrupted(String),

    /// Corruption was detected and restoring from backup failed
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Any other failed statement or request
    #[error("Operation failed: {0}")]
    Operation(String),
}

/// Errors returned by ledger and engine operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// Malformed, empty or out-of-range input
    #[error("Invalid parameter: {0}")]
    InvalidParams(String),

    /// The query target does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The exact record already exists
    #[error("Data already exists: {0}")]
    DataExists(String),

    /// The value is already present in the profile cache; nothing was written
    #[error("Profile already cached: {0}")]
    CacheExists(String),

    /// The storage handle is not initialized
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A storage step failed after the port's own retry
    #[error("Failed to {op}: {message}")]
    StorageFailed {
        /// The step that failed
        op: StorageOp,
        /// Port-level detail
        message: String,
    },

    /// The relational store could not be restored after corruption
    #[error("Database restore failed: {0}")]
    RestoreFailed(String),

    /// Attempted mutation of an immutable identity
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// The subscription registry rejected a trust notification
    #[error("Notification failed: {0}")]
    NotifyFailed(String),

    /// The non-OH sync adapter is missing or failed to initialize
    #[error("Sync adapter unavailable: {0}")]
    AdapterUnavailable(String),
}

impl ProfileError {
    /// Maps a port failure onto the taxonomy, naming the failed step
    pub fn storage(op: StorageOp, err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => ProfileError::StorageUnavailable(msg),
            StorageError::RestoreFailed(msg) => ProfileError::RestoreFailed(msg),
            StorageError::Corrupted(msg) | StorageError::Operation(msg) => {
                ProfileError::StorageFailed { op, message: msg }
            }
        }
    }

    /// Whether this error means the query target was absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProfileError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProfileError::InvalidParams("userId out of range".to_string());
        assert_eq!(err.to_string(), "Invalid parameter: userId out of range");

        let err = ProfileError::StorageFailed {
            op: StorageOp::PutAcl,
            message: "disk I/O error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to put access control profile: disk I/O error"
        );
    }

    #[test]
    fn test_storage_mapping() {
        let err = ProfileError::storage(
            StorageOp::Query,
            StorageError::Unavailable("not initialized".into()),
        );
        assert!(matches!(err, ProfileError::StorageUnavailable(_)));

        let err = ProfileError::storage(
            StorageOp::DeleteKv,
            StorageError::RestoreFailed("no backup".into()),
        );
        assert!(matches!(err, ProfileError::RestoreFailed(_)));

        let err = ProfileError::storage(
            StorageOp::PutKv,
            StorageError::Operation("constraint".into()),
        );
        assert_eq!(
            err,
            ProfileError::StorageFailed {
                op: StorageOp::PutKv,
                message: "constraint".into()
            }
        );
    }

    #[test]
    fn test_is_not_found() {
        assert!(ProfileError::NotFound("acl".into()).is_not_found());
        assert!(!ProfileError::NotAllowed("acl".into()).is_not_found());
    }
}
