//! Startup write buffering
//!
//! When the engine starts against a KV store that holds nothing for the
//! local device, profile writes are kept in memory until the caller signals
//! that startup collection is complete with
//! [`PutCacheHandle::save_put_temp_cache`]. The buffer and the `is_first`
//! flag are owned by one actor task; every KV write goes through it so a
//! flush never interleaves with another write.
//!
//! ```text
//! put_* ──→ mpsc::Sender<Request> ──→ PutCacheActor ──→ IKvStore::put_batch
//!                                          │
//!                                    putTempCache / is_first
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dprofile_core::domain::{ProfileError, StorageOp};
use dprofile_core::ports::IKvStore;

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// What a buffered put did with its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Held in memory until the next flush
    Buffered,
    /// Written to the store
    Written,
}

type Reply<T> = oneshot::Sender<Result<T, ProfileError>>;

enum Request {
    Put {
        entries: BTreeMap<String, String>,
        reply: Reply<PutOutcome>,
    },
    Write {
        entries: BTreeMap<String, String>,
        reply: Reply<()>,
    },
    Delete {
        keys: Vec<String>,
        reply: Reply<()>,
    },
    Save {
        extra: BTreeMap<String, String>,
        reply: Reply<()>,
    },
    IsFirst {
        reply: oneshot::Sender<bool>,
    },
    ResetFirst {
        reply: oneshot::Sender<()>,
    },
}

struct PutCacheActor {
    kv: Arc<dyn IKvStore>,
    is_first: bool,
    cache: BTreeMap<String, String>,
    requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,
}

impl PutCacheActor {
    async fn run(mut self) {
        info!(is_first = self.is_first, "Put cache started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }

        if !self.cache.is_empty() {
            warn!(count = self.cache.len(), "Put cache stopped with unflushed entries");
        }
        info!("Put cache stopped");
    }

    async fn handle(&mut self, request: Request) {
        // A dropped reply means the caller went away; nothing to do
        match request {
            Request::Put { entries, reply } => {
                let _ = reply.send(self.put(entries).await);
            }
            Request::Write { entries, reply } => {
                let _ = reply.send(self.write(&entries).await);
            }
            Request::Delete { keys, reply } => {
                let _ = reply.send(self.delete(&keys).await);
            }
            Request::Save { extra, reply } => {
                let _ = reply.send(self.save(extra).await);
            }
            Request::IsFirst { reply } => {
                let _ = reply.send(self.is_first);
            }
            Request::ResetFirst { reply } => {
                self.is_first = false;
                let _ = reply.send(());
            }
        }
    }

    async fn put(&mut self, entries: BTreeMap<String, String>) -> Result<PutOutcome, ProfileError> {
        if self.is_first {
            debug!(count = entries.len(), "Buffering profile entries");
            self.cache.extend(entries);
            return Ok(PutOutcome::Buffered);
        }
        self.write(&entries).await?;
        Ok(PutOutcome::Written)
    }

    async fn write(&self, entries: &BTreeMap<String, String>) -> Result<(), ProfileError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.kv
            .put_batch(entries)
            .await
            .map_err(|e| ProfileError::storage(StorageOp::PutKv, e))
    }

    /// Deletes from the store and from the buffer
    async fn delete(&mut self, keys: &[String]) -> Result<(), ProfileError> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            self.cache.remove(key);
        }
        self.kv
            .delete_batch(keys)
            .await
            .map_err(|e| ProfileError::storage(StorageOp::DeleteKv, e))
    }

    /// Merges `extra` over the buffer and writes the result in one batch
    ///
    /// The buffer and flag are left untouched when the write fails.
    async fn save(&mut self, extra: BTreeMap<String, String>) -> Result<(), ProfileError> {
        let mut merged = self.cache.clone();
        merged.extend(extra);

        if merged.is_empty() {
            self.is_first = false;
            return Ok(());
        }

        if let Err(e) = self.write(&merged).await {
            error!(error = %e, count = merged.len(), "Failed to flush put cache");
            return Err(e);
        }

        info!(count = merged.len(), "Put cache flushed");
        self.cache.clear();
        self.is_first = false;
        Ok(())
    }
}

/// Handle to the put-cache actor
#[derive(Clone)]
pub struct PutCacheHandle {
    requests: mpsc::Sender<Request>,
}

impl PutCacheHandle {
    /// Spawns the actor on the current runtime
    ///
    /// # Arguments
    /// * `kv` - Store the actor writes to
    /// * `is_first` - Whether writes start out buffered
    /// * `cancel` - Stops the actor when cancelled
    pub fn spawn(kv: Arc<dyn IKvStore>, is_first: bool, cancel: CancellationToken) -> Self {
        let (requests, receiver) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let actor = PutCacheActor {
            kv,
            is_first,
            cache: BTreeMap::new(),
            requests: receiver,
            cancel,
        };
        tokio::spawn(actor.run());
        Self { requests }
    }

    async fn call<T>(&self, request: Request, reply: oneshot::Receiver<T>) -> Result<T, ProfileError> {
        self.requests.send(request).await.map_err(|_| stopped())?;
        reply.await.map_err(|_| stopped())
    }

    /// Writes `entries`, or buffers them while the store is in its first run
    pub async fn put(&self, entries: BTreeMap<String, String>) -> Result<PutOutcome, ProfileError> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Put { entries, reply }, rx).await?
    }

    /// Writes `entries` immediately, bypassing the buffer
    pub async fn write(&self, entries: BTreeMap<String, String>) -> Result<(), ProfileError> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Write { entries, reply }, rx).await?
    }

    /// Deletes `keys` in one batch, dropping any buffered values for them
    pub async fn delete(&self, keys: Vec<String>) -> Result<(), ProfileError> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Delete { keys, reply }, rx).await?
    }

    /// Flushes the buffer merged with `extra` and ends the first run
    pub async fn save_put_temp_cache(
        &self,
        extra: BTreeMap<String, String>,
    ) -> Result<(), ProfileError> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Save { extra, reply }, rx).await?
    }

    pub async fn is_first(&self) -> Result<bool, ProfileError> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::IsFirst { reply }, rx).await
    }

    /// Ends the first run without flushing
    pub async fn reset_first(&self) -> Result<(), ProfileError> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::ResetFirst { reply }, rx).await
    }
}

fn stopped() -> ProfileError {
    ProfileError::StorageUnavailable("put cache is not running".to_string())
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use dprofile_store::SqliteKvStore;

    use super::*;

    async fn setup(is_first: bool) -> (Arc<SqliteKvStore>, PutCacheHandle, CancellationToken) {
        let kv = Arc::new(SqliteKvStore::in_memory("dp_kv_store", "uuid-local"));
        kv.init().await.unwrap();
        let cancel = CancellationToken::new();
        let handle = PutCacheHandle::spawn(
            Arc::clone(&kv) as Arc<dyn IKvStore>,
            is_first,
            cancel.clone(),
        );
        (kv, handle, cancel)
    }

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_first_run_buffers_until_saved() {
        let (kv, handle, _cancel) = setup(true).await;
        let mut changes = kv.subscribe();

        for i in 0..3 {
            let outcome = handle
                .put(entries(&[(&format!("dev#local#attr{i}"), "v")]))
                .await
                .unwrap();
            assert_eq!(outcome, PutOutcome::Buffered);
        }
        assert!(kv.get_by_prefix("dev#").await.unwrap().is_empty());

        handle.save_put_temp_cache(BTreeMap::new()).await.unwrap();
        assert!(!handle.is_first().await.unwrap());

        // All buffered writes land in a single batch
        let batch = changes.recv().await.unwrap();
        assert_eq!(batch.inserts.len(), 3);
        assert_eq!(kv.get_by_prefix("dev#").await.unwrap().len(), 3);

        // Second flush has nothing left to write
        handle.save_put_temp_cache(BTreeMap::new()).await.unwrap();
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_extra_entries_override_buffer() {
        let (kv, handle, _cancel) = setup(true).await;
        handle
            .put(entries(&[("k1", "buffered"), ("k2", "kept")]))
            .await
            .unwrap();
        handle
            .save_put_temp_cache(entries(&[("k1", "extra"), ("k3", "new")]))
            .await
            .unwrap();

        assert_eq!(kv.get("k1").await.unwrap().as_deref(), Some("extra"));
        assert_eq!(kv.get("k2").await.unwrap().as_deref(), Some("kept"));
        assert_eq!(kv.get("k3").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_later_puts_write_through() {
        let (kv, handle, _cancel) = setup(false).await;
        let outcome = handle.put(entries(&[("k", "v")])).await.unwrap();
        assert_eq!(outcome, PutOutcome::Written);
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_write_bypasses_buffer() {
        let (kv, handle, _cancel) = setup(true).await;
        handle.write(entries(&[("k", "v")])).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(handle.is_first().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer() {
        let (kv, handle, _cancel) = setup(true).await;
        handle.put(entries(&[("k", "v")])).await.unwrap();
        kv.uninit().await.unwrap();

        assert!(handle.save_put_temp_cache(BTreeMap::new()).await.is_err());
        assert!(handle.is_first().await.unwrap());

        kv.init().await.unwrap();
        handle.save_put_temp_cache(BTreeMap::new()).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_delete_drops_buffered_value() {
        let (kv, handle, _cancel) = setup(true).await;
        kv.put("stored", "v").await.unwrap();
        handle.put(entries(&[("buffered", "v")])).await.unwrap();

        handle
            .delete(vec!["stored".to_string(), "buffered".to_string()])
            .await
            .unwrap();
        handle.save_put_temp_cache(BTreeMap::new()).await.unwrap();

        assert!(kv.get("stored").await.unwrap().is_none());
        assert!(kv.get("buffered").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_first_stops_buffering() {
        let (_kv, handle, _cancel) = setup(true).await;
        handle.reset_first().await.unwrap();
        let outcome = handle.put(entries(&[("k", "v")])).await.unwrap();
        assert_eq!(outcome, PutOutcome::Written);
    }

    #[tokio::test]
    async fn test_cancelled_actor_reports_unavailable() {
        let (_kv, handle, cancel) = setup(false).await;
        cancel.cancel();
        // The actor checks cancellation before serving queued requests
        let result = handle.put(entries(&[("k", "v")])).await;
        assert!(matches!(result, Err(ProfileError::StorageUnavailable(_))));
    }
}
