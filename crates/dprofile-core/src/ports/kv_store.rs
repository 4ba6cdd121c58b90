//! KV store port (driven/secondary port)
//!
//! The replicated key-value store that holds flattened dynamic profiles.
//!
//! ## Design Notes
//!
//! - Every entry records the replica id ("owner") of the writer. Owners are
//!   opaque and compared by exact match only.
//! - Changes are published on a `tokio::sync::broadcast` channel; a lagging
//!   subscriber loses notifications rather than blocking writers.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::broadcast;

use crate::domain::{StorageError, SyncMode, SyncStatus};

/// One key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

impl KvEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A batch of changes applied to one store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvChangeNotification {
    pub store_id: String,
    pub inserts: Vec<KvEntry>,
    pub updates: Vec<KvEntry>,
    /// Deleted entries carry their last value
    pub deletes: Vec<KvEntry>,
}

impl KvChangeNotification {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Port for the replicated KV store
#[async_trait::async_trait]
pub trait IKvStore: Send + Sync {
    /// Identifier carried by this store's change notifications
    fn store_id(&self) -> &str;

    async fn init(&self) -> Result<(), StorageError>;

    async fn uninit(&self) -> Result<(), StorageError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Writes all entries atomically
    async fn put_batch(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn get_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StorageError>;

    /// Entries whose owner equals `owner`
    async fn get_by_owner(&self, owner: &str) -> Result<BTreeMap<String, String>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Deletes all listed keys atomically; absent keys are ignored
    async fn delete_batch(&self, keys: &[String]) -> Result<(), StorageError>;

    async fn delete_by_prefix(&self, prefix: &str) -> Result<(), StorageError>;

    /// Replicates with the given peers (by network id)
    async fn sync(
        &self,
        device_ids: &[String],
        mode: SyncMode,
    ) -> Result<HashMap<String, SyncStatus>, StorageError>;

    /// Subscribes to change notifications
    fn subscribe(&self) -> broadcast::Receiver<KvChangeNotification>;
}
