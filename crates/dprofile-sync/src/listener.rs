//! KV change listener
//!
//! Turns raw KV change batches into canonical profile change events. A
//! batch may carry both the plain and the OH-suffixed spelling of the same
//! attribute; subscribers see only the suffixed one.
//!
//! ## Flow
//!
//! ```text
//! IKvStore::subscribe() ──→ run() ──→ on_change()
//!                                       │
//!                       inserts / updates / deletes
//!                                       │
//!                              filter_entries()
//!                                       │
//!                 ISubscriptionRegistry::notify_profile_change()
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dprofile_core::config::Config;
use dprofile_core::domain::key::{OhSuffixPolicy, CHARACTERISTIC_KEY};
use dprofile_core::domain::{anonymize, ChangeType, ProfileKey};
use dprofile_core::ports::{IKvStore, ISubscriptionRegistry, KvChangeNotification, KvEntry};

use crate::engine::read_entries;

pub struct KvDataChangeListener {
    kv: Arc<dyn IKvStore>,
    registry: Arc<dyn ISubscriptionRegistry>,
    policy: OhSuffixPolicy,
    /// Notifications from this store are not profile changes
    static_store_id: String,
    max_db_record_size: usize,
}

impl KvDataChangeListener {
    /// # Arguments
    /// * `kv` - Store used to look up suffixed counterparts
    /// * `registry` - Receives the filtered events
    /// * `config` - Supplies the suffix rules, static store id and batch limit
    pub fn new(
        kv: Arc<dyn IKvStore>,
        registry: Arc<dyn ISubscriptionRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            kv,
            registry,
            policy: config.profile.oh_suffix_policy(),
            static_store_id: config.store.static_store_id.clone(),
            max_db_record_size: config.profile.max_db_record_size,
        }
    }

    /// Consumes change notifications until cancelled or the store goes away
    pub async fn run(
        &self,
        mut changes: broadcast::Receiver<KvChangeNotification>,
        cancel: CancellationToken,
    ) {
        info!("KV change listener starting");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("KV change listener cancelled");
                    break;
                }

                change = changes.recv() => match change {
                    Ok(notification) => self.on_change(&notification).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "KV change listener lagged, notifications lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("KV change stream closed, listener shutting down");
                        break;
                    }
                },
            }
        }

        info!("KV change listener stopped");
    }

    pub async fn on_change(&self, notification: &KvChangeNotification) {
        if notification.store_id == self.static_store_id {
            debug!("Ignoring static store change");
            return;
        }

        let batches = [
            (&notification.inserts, ChangeType::Add),
            (&notification.updates, ChangeType::Update),
            (&notification.deletes, ChangeType::Delete),
        ];
        for (records, change_type) in batches {
            if records.is_empty() {
                continue;
            }
            if records.len() > self.max_db_record_size {
                warn!(
                    count = records.len(),
                    limit = self.max_db_record_size,
                    ?change_type,
                    "Change batch too large, skipped"
                );
                continue;
            }
            let entries = self
                .filter_entries(records, change_type == ChangeType::Delete)
                .await;
            self.deliver(&entries, change_type).await;
        }
    }

    /// Re-reads keys that arrived through a sync and reports them as updates
    pub async fn on_synced_keys(&self, keys: &[String]) {
        match read_entries(self.kv.as_ref(), keys).await {
            Ok(entries) => {
                let records: Vec<KvEntry> = entries
                    .into_iter()
                    .map(|(key, value)| KvEntry { key, value })
                    .collect();
                let entries = self.filter_entries(&records, false).await;
                self.deliver(&entries, ChangeType::Update).await;
            }
            Err(e) => error!(error = %e, count = keys.len(), "Failed to read synced keys"),
        }
    }

    /// Drops everything a subscriber should not see
    ///
    /// - keys that are not profile keys
    /// - characteristic entries for the reserved characteristic-key leaf
    /// - a plain key whose OH-suffixed counterpart is in the same batch
    /// - for non-deletes, a plain key whose suffixed counterpart is stored
    pub async fn filter_entries(
        &self,
        records: &[KvEntry],
        is_delete: bool,
    ) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        let mut suffixed_to_plain = BTreeMap::new();
        let mut plain_to_suffixed = BTreeMap::new();

        for record in records {
            let Some(key) = ProfileKey::parse(&record.key) else {
                warn!(key = %anonymize(&record.key), "Invalid profile key in change batch");
                continue;
            };
            if matches!(&key, ProfileKey::Characteristic { attribute, .. } if attribute == CHARACTERISTIC_KEY)
            {
                continue;
            }
            entries.insert(record.key.clone(), record.value.clone());

            if key.has_oh_suffix() {
                suffixed_to_plain.insert(record.key.clone(), key.without_oh_suffix().to_string());
            } else if self.policy.needs_suffix(&key) {
                plain_to_suffixed.insert(record.key.clone(), key.with_oh_suffix().to_string());
            }
        }

        for plain in suffixed_to_plain.values() {
            entries.remove(plain);
            plain_to_suffixed.remove(plain);
        }
        if is_delete || plain_to_suffixed.is_empty() {
            return entries;
        }

        let suffixed_keys: Vec<String> = plain_to_suffixed.values().cloned().collect();
        let stored = match read_entries(self.kv.as_ref(), &suffixed_keys).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to look up suffixed keys");
                return entries;
            }
        };
        for (plain, suffixed) in &plain_to_suffixed {
            if stored.contains_key(suffixed) {
                entries.remove(plain);
            }
        }
        entries
    }

    async fn deliver(&self, entries: &BTreeMap<String, String>, change_type: ChangeType) {
        for (key, value) in entries {
            let Some(parsed) = ProfileKey::parse(key) else {
                continue;
            };
            if let Err(e) = self
                .registry
                .notify_profile_change(parsed.profile_type(), change_type, key, value)
                .await
            {
                error!(key = %anonymize(key), error = %e, "Profile change notification failed");
            }
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use dprofile_core::config::ConfigBuilder;
    use dprofile_core::domain::{ProfileType, TrustDeviceProfile};
    use dprofile_store::SqliteKvStore;

    use super::*;

    #[derive(Default)]
    struct RecordingRegistry {
        changes: Mutex<Vec<(ProfileType, ChangeType, String, String)>>,
    }

    impl RecordingRegistry {
        fn take(&self) -> Vec<(ProfileType, ChangeType, String, String)> {
            std::mem::take(&mut *self.changes.lock().unwrap())
        }
    }

    #[async_trait::async_trait]
    impl ISubscriptionRegistry for RecordingRegistry {
        async fn notify_trust_device_profile_add(&self, _: &TrustDeviceProfile) -> anyhow::Result<()> {
            Ok(())
        }
        async fn notify_trust_device_profile_update(
            &self,
            _: &TrustDeviceProfile,
            _: &TrustDeviceProfile,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn notify_trust_device_profile_delete(&self, _: &TrustDeviceProfile) -> anyhow::Result<()> {
            Ok(())
        }
        async fn notify_trust_device_profile_active(&self, _: &TrustDeviceProfile) -> anyhow::Result<()> {
            Ok(())
        }
        async fn notify_trust_device_profile_inactive(&self, _: &TrustDeviceProfile) -> anyhow::Result<()> {
            Ok(())
        }
        async fn notify_profile_change(
            &self,
            profile_type: ProfileType,
            change_type: ChangeType,
            key: &str,
            value: &str,
        ) -> anyhow::Result<()> {
            self.changes.lock().unwrap().push((
                profile_type,
                change_type,
                key.to_string(),
                value.to_string(),
            ));
            Ok(())
        }
    }

    async fn setup() -> (Arc<SqliteKvStore>, Arc<RecordingRegistry>, KvDataChangeListener) {
        let config = ConfigBuilder::new()
            .profile_oh_suffix_device_attributes(vec!["osType".to_string()])
            .profile_oh_suffix_services(vec!["camera".to_string()])
            .profile_max_db_record_size(4)
            .build();
        let kv = Arc::new(SqliteKvStore::in_memory(
            config.store.kv_store_id.clone(),
            "uuid-local",
        ));
        kv.init().await.unwrap();
        let registry = Arc::new(RecordingRegistry::default());
        let listener = KvDataChangeListener::new(
            Arc::clone(&kv) as Arc<dyn IKvStore>,
            Arc::clone(&registry) as Arc<dyn ISubscriptionRegistry>,
            &config,
        );
        (kv, registry, listener)
    }

    fn records(pairs: &[(&str, &str)]) -> Vec<KvEntry> {
        pairs.iter().map(|(k, v)| KvEntry::new(*k, *v)).collect()
    }

    #[tokio::test]
    async fn test_filter_drops_invalid_and_reserved_keys() {
        let (_kv, _registry, listener) = setup().await;
        let entries = listener
            .filter_entries(
                &records(&[
                    ("acl#1", "x"),
                    ("char#peer#wifi#switch#characteristicKey", "switch"),
                    ("char#peer#wifi#switch#characteristicValue", "1"),
                ]),
                false,
            )
            .await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("char#peer#wifi#switch#characteristicValue"));
    }

    #[tokio::test]
    async fn test_filter_prefers_suffixed_key_in_batch() {
        let (_kv, _registry, listener) = setup().await;
        let batch = records(&[
            ("dev#peer#osType", "10"),
            ("dev#peer#osType_OH", "10"),
            ("dev#peer#deviceName", "tv"),
        ]);

        for is_delete in [false, true] {
            let entries = listener.filter_entries(&batch, is_delete).await;
            let keys: Vec<&str> = entries.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["dev#peer#deviceName", "dev#peer#osType_OH"]);
        }
    }

    #[tokio::test]
    async fn test_filter_queries_stored_counterpart() {
        let (kv, _registry, listener) = setup().await;
        kv.put("svr#peer#camera_OH#serviceType", "media").await.unwrap();
        let batch = records(&[
            ("svr#peer#camera#serviceType", "media"),
            ("dev#peer#osType", "10"),
        ]);

        let entries = listener.filter_entries(&batch, false).await;
        // camera_OH is stored, osType_OH is not
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("dev#peer#osType"));

        // Deletes never consult the store
        let entries = listener.filter_entries(&batch, true).await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_on_change_maps_batches_to_change_types() {
        let (_kv, registry, listener) = setup().await;
        let notification = KvChangeNotification {
            store_id: "dp_kv_store".into(),
            inserts: records(&[("svr#peer#printer#serviceType", "office")]),
            updates: records(&[("dev#peer#deviceName", "tv")]),
            deletes: records(&[("char#peer#wifi#switch#characteristicValue", "0")]),
        };
        listener.on_change(&notification).await;

        let changes = registry.take();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].0, ProfileType::Service);
        assert_eq!(changes[0].1, ChangeType::Add);
        assert_eq!(changes[1].1, ChangeType::Update);
        assert_eq!(changes[2].0, ProfileType::Characteristic);
        assert_eq!(changes[2].1, ChangeType::Delete);
        assert_eq!(changes[2].3, "0");
    }

    #[tokio::test]
    async fn test_on_change_skips_static_store_and_oversized_batches() {
        let (_kv, registry, listener) = setup().await;
        listener
            .on_change(&KvChangeNotification {
                store_id: "dp_kv_static_store".into(),
                inserts: records(&[("dev#peer#deviceName", "tv")]),
                ..Default::default()
            })
            .await;
        let oversized: Vec<KvEntry> = (0..5)
            .map(|i| KvEntry::new(format!("dev#peer#attr{i}"), "v"))
            .collect();
        listener
            .on_change(&KvChangeNotification {
                store_id: "dp_kv_store".into(),
                inserts: oversized,
                ..Default::default()
            })
            .await;

        assert!(registry.take().is_empty());
    }

    #[tokio::test]
    async fn test_on_synced_keys_reports_updates() {
        let (kv, registry, listener) = setup().await;
        kv.put("dev#peer#deviceName", "tv").await.unwrap();
        listener
            .on_synced_keys(&["dev#peer#deviceName".to_string(), "dev#peer#missing".to_string()])
            .await;

        let changes = registry.take();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].1, ChangeType::Update);
        assert_eq!(changes[0].3, "tv");
    }

    #[tokio::test]
    async fn test_run_forwards_store_changes() {
        let (kv, registry, listener) = setup().await;
        let listener = Arc::new(listener);
        let cancel = CancellationToken::new();
        let task = {
            let listener = Arc::clone(&listener);
            let changes = kv.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(changes, cancel).await })
        };

        kv.put("dev#peer#deviceName", "tv").await.unwrap();
        for _ in 0..200 {
            if !registry.changes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let changes = registry.take();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].1, ChangeType::Add);
    }
}
