//! SQLite implementation of the KV store port
//!
//! Entries live in the `kv_entries` table together with the replica id of
//! their writer and the time of the last write. Replication between devices
//! is modelled in-process: peers are registered by network id with
//! [`SqliteKvStore::link_peer`] and `sync` copies owned entries between the
//! two stores, preserving ownership.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::{broadcast, RwLock};

use dprofile_core::domain::{anonymize, StorageError, SyncMode, SyncStatus};
use dprofile_core::ports::{IKvStore, KvChangeNotification, KvEntry};

use crate::{DatabasePool, StoreError};

/// Buffered change notifications per subscriber
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// `IKvStore` backed by SQLite
pub struct SqliteKvStore {
    store_id: String,
    owner: String,
    path: Option<PathBuf>,
    pool: RwLock<Option<DatabasePool>>,
    changes: broadcast::Sender<KvChangeNotification>,
    peers: DashMap<String, Arc<SqliteKvStore>>,
}

impl SqliteKvStore {
    /// File-backed store; local writes are recorded as owned by `owner`
    pub fn new(store_id: impl Into<String>, owner: impl Into<String>, path: PathBuf) -> Self {
        Self::build(store_id.into(), owner.into(), Some(path))
    }

    /// In-memory store for tests
    pub fn in_memory(store_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::build(store_id.into(), owner.into(), None)
    }

    fn build(store_id: String, owner: String, path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store_id,
            owner,
            path,
            pool: RwLock::new(None),
            changes,
            peers: DashMap::new(),
        }
    }

    /// Replica id recorded for local writes
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Registers a peer reachable under `network_id` for `sync`
    pub fn link_peer(&self, network_id: impl Into<String>, peer: Arc<SqliteKvStore>) {
        self.peers.insert(network_id.into(), peer);
    }

    async fn current_pool(&self) -> Result<SqlitePool, StoreError> {
        self.pool
            .read()
            .await
            .as_ref()
            .map(|p| p.pool().clone())
            .ok_or(StoreError::NotInitialized)
    }

    fn publish(&self, notification: KvChangeNotification) {
        if notification.is_empty() {
            return;
        }
        // No receivers is not an error
        let _ = self.changes.send(notification);
    }

    /// Writes entries on behalf of `owner`, as replication does
    ///
    /// Returns the change batch that was published.
    pub async fn put_with_owner(
        &self,
        entries: &BTreeMap<String, String>,
        owner: &str,
    ) -> Result<KvChangeNotification, StoreError> {
        let pool = self.current_pool().await?;
        let now = Utc::now().to_rfc3339();
        let mut notification = KvChangeNotification {
            store_id: self.store_id.clone(),
            ..Default::default()
        };

        let mut tx = pool.begin().await?;
        for (key, value) in entries {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await?;
            sqlx::query(
                "INSERT INTO kv_entries (key, value, owner, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 owner = excluded.owner, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(owner)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            let entry = KvEntry::new(key.clone(), value.clone());
            if existing.is_some() {
                notification.updates.push(entry);
            } else {
                notification.inserts.push(entry);
            }
        }
        tx.commit().await?;

        self.publish(notification.clone());
        Ok(notification)
    }

    async fn owned_entries(&self, owner: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let pool = self.current_pool().await?;
        let rows = sqlx::query("SELECT key, value FROM kv_entries WHERE owner = ?")
            .bind(owner)
            .fetch_all(&pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    async fn sync_with(&self, peer: &SqliteKvStore, mode: SyncMode) -> Result<(), StoreError> {
        if mode.pushes() {
            let local = self.owned_entries(&self.owner).await?;
            if !local.is_empty() {
                peer.put_with_owner(&local, &self.owner).await?;
            }
        }
        if mode.pulls() {
            let remote = peer.owned_entries(&peer.owner).await?;
            if !remote.is_empty() {
                self.put_with_owner(&remote, &peer.owner).await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IKvStore for SqliteKvStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn init(&self) -> Result<(), StorageError> {
        let mut current = self.pool.write().await;
        if current.is_some() {
            return Ok(());
        }
        let pool = match &self.path {
            Some(path) => DatabasePool::new(path).await?,
            None => DatabasePool::in_memory().await?,
        };
        *current = Some(pool);
        tracing::info!(store_id = %self.store_id, "KV store initialized");
        Ok(())
    }

    async fn uninit(&self) -> Result<(), StorageError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        tracing::info!(store_id = %self.store_id, "KV store closed");
        Ok(())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = BTreeMap::new();
        entries.insert(key.to_string(), value.to_string());
        self.put_batch(&entries).await
    }

    async fn put_batch(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.put_with_owner(entries, &self.owner).await?;
        tracing::debug!(count = entries.len(), "KV entries written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let pool = self.current_pool().await?;
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&pool)
            .await
            .map_err(StoreError::from)?;
        Ok(value)
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let pool = self.current_pool().await?;
        let rows = sqlx::query("SELECT key, value FROM kv_entries WHERE instr(key, ?) = 1")
            .bind(prefix)
            .fetch_all(&pool)
            .await
            .map_err(StoreError::from)?;
        Ok(rows
            .iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    async fn get_by_owner(&self, owner: &str) -> Result<BTreeMap<String, String>, StorageError> {
        Ok(self.owned_entries(owner).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.delete_batch(&[key.to_string()]).await
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let pool = self.current_pool().await?;
        let mut notification = KvChangeNotification {
            store_id: self.store_id.clone(),
            ..Default::default()
        };

        let mut tx = pool.begin().await.map_err(StoreError::from)?;
        for key in keys {
            let existing: Option<String> =
                sqlx::query_scalar("DELETE FROM kv_entries WHERE key = ? RETURNING value")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(StoreError::from)?;
            if let Some(value) = existing {
                notification.deletes.push(KvEntry::new(key.clone(), value));
            }
        }
        tx.commit().await.map_err(StoreError::from)?;

        tracing::debug!(count = notification.deletes.len(), "KV entries deleted");
        self.publish(notification);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let keys: Vec<String> = self.get_by_prefix(prefix).await?.into_keys().collect();
        self.delete_batch(&keys).await
    }

    async fn sync(
        &self,
        device_ids: &[String],
        mode: SyncMode,
    ) -> Result<HashMap<String, SyncStatus>, StorageError> {
        // Fail fast when this store is closed
        self.current_pool().await?;
        let mut results = HashMap::new();
        for network_id in device_ids {
            let peer = self.peers.get(network_id).map(|p| Arc::clone(p.value()));
            let status = match peer {
                Some(peer) => match self.sync_with(&peer, mode).await {
                    Ok(()) => SyncStatus::Succeeded,
                    Err(e) => {
                        tracing::warn!(
                            network_id = %anonymize(network_id),
                            error = %e,
                            "KV sync with peer failed"
                        );
                        SyncStatus::Failed
                    }
                },
                None => {
                    tracing::warn!(network_id = %anonymize(network_id), "Unknown sync peer");
                    SyncStatus::Failed
                }
            };
            results.insert(network_id.clone(), status);
        }
        Ok(results)
    }

    fn subscribe(&self) -> broadcast::Receiver<KvChangeNotification> {
        self.changes.subscribe()
    }
}
