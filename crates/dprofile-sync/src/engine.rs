//! Dynamic profile reconciliation engine
//!
//! [`DeviceProfileManager`] owns the local view of the replicated KV store
//! that holds flattened device, service and characteristic profiles.
//!
//! ## Responsibilities
//!
//! 1. **Profile CRUD**: validate, flatten and write profiles; read them back
//!    from the cache or the store
//! 2. **Startup buffering**: writes made before the first collection pass
//!    completes are held by the put-cache actor
//! 3. **Reconciliation**: when a peer comes online or the foreground user
//!    changes, stale or misattributed entries are repaired on the
//!    background queue
//! 4. **Sync**: OH peers replicate through the KV store, non-OH peers
//!    through the optional sync adapter

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dprofile_core::config::Config;
use dprofile_core::domain::key::{
    characteristic_prefix, device_prefix, key_mentions_device, service_prefix, OhSuffixPolicy,
    CHAR_PREFIX, DEV_PREFIX, SEPARATOR, SVR_PREFIX,
};
use dprofile_core::domain::profile::{
    characteristic_profiles_from_entries, device_profiles_from_entries,
    service_profiles_from_entries,
};
use dprofile_core::domain::{
    anonymize, AuthForm, CharacteristicProfile, DeviceProfile, ProfileError, ProfileKey,
    ProfileKind, ServiceProfile, StorageError, StorageOp, SyncMode, SyncStatus, TrustedDeviceInfo,
    DEFAULT_USER_ID,
};
use dprofile_core::ports::{IKvStore, IStaticProfileSync};

use crate::adapter::{SyncAdapterSlot, SyncAdapterSource};
use crate::cache::{user_key, ProfileCache};
use crate::put_cache::{PutCacheHandle, PutOutcome};
use crate::queue::TaskQueue;

/// Reads the given keys, skipping absent ones
pub(crate) async fn read_entries(
    kv: &dyn IKvStore,
    keys: &[String],
) -> Result<BTreeMap<String, String>, ProfileError> {
    let mut entries = BTreeMap::new();
    for key in keys {
        let value = kv
            .get(key)
            .await
            .map_err(|e| ProfileError::storage(StorageOp::GetKv, e))?;
        if let Some(value) = value {
            entries.insert(key.clone(), value);
        }
    }
    Ok(entries)
}

/// Background tasks and actor started by `init`
#[derive(Clone)]
struct Running {
    put_cache: PutCacheHandle,
    queue: TaskQueue,
    cancel: CancellationToken,
}

pub struct DeviceProfileManager {
    kv: Arc<dyn IKvStore>,
    config: Config,
    policy: OhSuffixPolicy,
    running: RwLock<Option<Running>>,
    cache: ProfileCache,
    adapter: SyncAdapterSlot,
    static_sync: Option<Arc<dyn IStaticProfileSync>>,
    foreground_user: AtomicI32,
}

impl DeviceProfileManager {
    /// Creates a stopped engine; call [`init`](Self::init) before use
    ///
    /// # Arguments
    /// * `kv` - The replicated dynamic profile store
    /// * `config` - Device identity, limits, suffix rules and user range
    /// * `adapter` - Sync adapter for non-OH peers, if one is installed
    /// * `static_sync` - Static profile sync triggered alongside e2e sync
    pub fn new(
        kv: Arc<dyn IKvStore>,
        config: &Config,
        adapter: SyncAdapterSource,
        static_sync: Option<Arc<dyn IStaticProfileSync>>,
    ) -> Self {
        Self {
            kv,
            config: config.clone(),
            policy: config.profile.oh_suffix_policy(),
            running: RwLock::new(None),
            cache: ProfileCache::new(),
            adapter: SyncAdapterSlot::new(adapter),
            static_sync,
            foreground_user: AtomicI32::new(config.multi_user.foreground_user_id),
        }
    }

    fn local_udid(&self) -> &str {
        &self.config.device.udid
    }

    pub fn foreground_user_id(&self) -> i32 {
        self.foreground_user.load(Ordering::Acquire)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the KV store, checks for prior local data and starts the
    /// put-cache actor and the task queue
    ///
    /// Writes are buffered when the store holds nothing under the local
    /// device id.
    pub async fn init(&self) -> Result<(), ProfileError> {
        let mut running = self.running.write().await;
        if running.is_some() {
            debug!("Device profile manager already initialized");
            return Ok(());
        }

        self.init_kv_with_retry().await?;
        let is_first = self
            .get_profiles_by_key_prefix(self.local_udid())
            .await?
            .is_empty();

        let cancel = CancellationToken::new();
        *running = Some(Running {
            put_cache: PutCacheHandle::spawn(Arc::clone(&self.kv), is_first, cancel.child_token()),
            queue: TaskQueue::spawn(self.config.sync.queue_capacity, cancel.child_token()),
            cancel,
        });

        info!(
            udid = %anonymize(self.local_udid()),
            is_first,
            "Device profile manager initialized"
        );
        Ok(())
    }

    async fn init_kv_with_retry(&self) -> Result<(), ProfileError> {
        let attempts = self.config.store.init_max_attempts.max(1);
        let interval = Duration::from_millis(self.config.store.init_retry_interval_ms);
        let mut last_error = StorageError::Unavailable("not attempted".to_string());

        for attempt in 1..=attempts {
            match self.kv.init().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "KV store init failed");
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(ProfileError::storage(StorageOp::Init, last_error))
    }

    /// Stops background work, closes the store and releases the adapter
    ///
    /// Queued reconciliation tasks and unflushed buffered writes are dropped.
    pub async fn uninit(&self) -> Result<(), ProfileError> {
        if let Some(running) = self.running.write().await.take() {
            running.cancel.cancel();
        }
        self.adapter.release().await;
        self.cache.clear_profiles();
        self.kv
            .uninit()
            .await
            .map_err(|e| ProfileError::storage(StorageOp::Init, e))?;
        info!("Device profile manager stopped");
        Ok(())
    }

    pub async fn re_init(&self) -> Result<(), ProfileError> {
        self.uninit().await?;
        self.init().await
    }

    async fn running(&self) -> Result<Running, ProfileError> {
        self.running.read().await.clone().ok_or_else(|| {
            ProfileError::StorageUnavailable("device profile manager is not initialized".to_string())
        })
    }

    /// Waits until every queued reconciliation task has finished
    pub async fn wait_idle(&self) -> Result<(), ProfileError> {
        self.running().await?.queue.wait_idle().await
    }

    // ========================================================================
    // Startup buffering
    // ========================================================================

    /// Flushes buffered writes merged with `extra` and ends the first run
    pub async fn save_put_temp_cache(
        &self,
        extra: BTreeMap<String, String>,
    ) -> Result<(), ProfileError> {
        self.running().await?.put_cache.save_put_temp_cache(extra).await
    }

    pub async fn is_first_init_db(&self) -> Result<bool, ProfileError> {
        self.running().await?.put_cache.is_first().await
    }

    pub async fn reset_first(&self) -> Result<(), ProfileError> {
        self.running().await?.put_cache.reset_first().await
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn check_key(&self, field: &str, value: &str) -> Result<(), ProfileError> {
        if value.is_empty()
            || value.len() > self.config.profile.max_string_len
            || value.contains(SEPARATOR)
        {
            return Err(ProfileError::InvalidParams(format!("{field} is invalid")));
        }
        Ok(())
    }

    /// Multi-user profiles belong to the local device and a user in range;
    /// all others must carry the default user id
    fn check_multi_user(
        &self,
        device_id: &str,
        user_id: i32,
        is_multi_user: bool,
    ) -> Result<(), ProfileError> {
        let valid = if is_multi_user {
            device_id == self.local_udid() && self.config.multi_user.contains(user_id)
        } else {
            user_id == DEFAULT_USER_ID
        };
        if !valid {
            return Err(ProfileError::InvalidParams(format!(
                "user id {user_id} is invalid for this profile"
            )));
        }
        Ok(())
    }

    /// Applies the suffix policy and adds the foreground shadow keys
    fn flatten(
        &self,
        entries: Vec<(ProfileKey, String)>,
        is_multi_user: bool,
        user_id: i32,
    ) -> BTreeMap<String, String> {
        let foreground = is_multi_user && user_id == self.foreground_user_id();
        let mut flat = BTreeMap::new();
        for (key, value) in entries {
            let key = self.policy.apply(key);
            if foreground {
                flat.insert(key.clone().with_user_id(None).to_string(), value.clone());
            }
            flat.insert(key.to_string(), value);
        }
        flat
    }

    async fn put_entries(&self, entries: BTreeMap<String, String>) -> Result<(), ProfileError> {
        let count = entries.len();
        let outcome = self.running().await?.put_cache.put(entries).await?;
        if outcome == PutOutcome::Buffered {
            debug!(count, "Profile entries buffered until startup completes");
        }
        Ok(())
    }

    // ========================================================================
    // Puts
    // ========================================================================

    pub async fn put_device_profile(&self, profile: &DeviceProfile) -> Result<(), ProfileError> {
        self.check_key("deviceId", &profile.device_id)?;
        self.check_multi_user(&profile.device_id, profile.user_id, profile.is_multi_user)?;
        if self.cache.contains_device_profile(profile) {
            return Err(ProfileError::CacheExists("device profile".to_string()));
        }

        let entries = self.flatten(profile.to_entries(), profile.is_multi_user, profile.user_id);
        self.put_entries(entries).await?;
        self.cache.add_device_profile(profile.clone());
        info!(device = %anonymize(&profile.device_id), "Device profile saved");
        Ok(())
    }

    pub async fn put_service_profile(&self, profile: &ServiceProfile) -> Result<(), ProfileError> {
        self.check_key("deviceId", &profile.device_id)?;
        self.check_key("serviceName", &profile.service_name)?;
        self.check_multi_user(&profile.device_id, profile.user_id, profile.is_multi_user)?;
        if self.cache.contains_service_profile(profile) {
            return Err(ProfileError::CacheExists("service profile".to_string()));
        }

        let entries = self.flatten(profile.to_entries(), profile.is_multi_user, profile.user_id);
        self.put_entries(entries).await?;
        self.cache.add_service_profile(profile.clone());
        info!(
            device = %anonymize(&profile.device_id),
            service = %profile.service_name,
            "Service profile saved"
        );
        Ok(())
    }

    /// Saves each profile, logging the ones that fail
    pub async fn put_service_profile_batch(
        &self,
        profiles: &[ServiceProfile],
    ) -> Result<(), ProfileError> {
        if profiles.is_empty() {
            return Err(ProfileError::InvalidParams("empty service profile batch".to_string()));
        }
        for profile in profiles {
            match self.put_service_profile(profile).await {
                Ok(()) | Err(ProfileError::CacheExists(_)) => {}
                Err(e) => warn!(service = %profile.service_name, error = %e, "Service profile not saved"),
            }
        }
        Ok(())
    }

    pub async fn put_characteristic_profile(
        &self,
        profile: &CharacteristicProfile,
    ) -> Result<(), ProfileError> {
        self.check_key("deviceId", &profile.device_id)?;
        self.check_key("serviceName", &profile.service_name)?;
        self.check_key("characteristicKey", &profile.characteristic_key)?;
        self.check_multi_user(&profile.device_id, profile.user_id, profile.is_multi_user)?;
        if self.cache.contains_characteristic_profile(profile) {
            return Err(ProfileError::CacheExists("characteristic profile".to_string()));
        }

        let entries = self.flatten(profile.to_entries(), profile.is_multi_user, profile.user_id);
        self.put_entries(entries).await?;
        self.cache.add_characteristic_profile(profile.clone());
        info!(
            device = %anonymize(&profile.device_id),
            service = %profile.service_name,
            characteristic = %profile.characteristic_key,
            "Characteristic profile saved"
        );
        Ok(())
    }

    pub async fn put_characteristic_profile_batch(
        &self,
        profiles: &[CharacteristicProfile],
    ) -> Result<(), ProfileError> {
        if profiles.is_empty() {
            return Err(ProfileError::InvalidParams(
                "empty characteristic profile batch".to_string(),
            ));
        }
        for profile in profiles {
            match self.put_characteristic_profile(profile).await {
                Ok(()) | Err(ProfileError::CacheExists(_)) => {}
                Err(e) => warn!(
                    characteristic = %profile.characteristic_key,
                    error = %e,
                    "Characteristic profile not saved"
                ),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Gets
    // ========================================================================

    async fn get_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, ProfileError> {
        self.kv
            .get_by_prefix(prefix)
            .await
            .map_err(|e| ProfileError::storage(StorageOp::GetKv, e))
    }

    /// Entries under the plain and the stored spelling of a name segment
    async fn get_by_name_prefixes(
        &self,
        kind: ProfileKind,
        name: &str,
        prefix: impl Fn(&str) -> String,
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        let mut entries = self.get_by_prefix(&prefix(name)).await?;
        let stored = self.policy.stored_name(kind, name);
        if stored != name {
            entries.extend(self.get_by_prefix(&prefix(&stored)).await?);
        }
        Ok(entries)
    }

    /// # Arguments
    /// * `user_id` - `Some` for a multi-user profile, `None` for the shared one
    pub async fn get_device_profile(
        &self,
        device_id: &str,
        user_id: Option<i32>,
    ) -> Result<DeviceProfile, ProfileError> {
        self.check_key("deviceId", device_id)?;
        if let Some(profile) = self.cache.get_device_profile(device_id, user_id) {
            return Ok(profile);
        }

        let entries = self.get_by_prefix(&device_prefix(device_id)).await?;
        let profile = device_profiles_from_entries(&entries)
            .into_iter()
            .find(|p| user_key(p.is_multi_user, p.user_id) == user_id)
            .ok_or_else(|| ProfileError::NotFound("device profile".to_string()))?;
        self.cache.add_device_profile(profile.clone());
        Ok(profile)
    }

    pub async fn get_service_profile(
        &self,
        device_id: &str,
        service_name: &str,
        user_id: Option<i32>,
    ) -> Result<ServiceProfile, ProfileError> {
        self.check_key("deviceId", device_id)?;
        self.check_key("serviceName", service_name)?;
        if let Some(profile) = self.cache.get_service_profile(device_id, service_name, user_id) {
            return Ok(profile);
        }

        let entries = self
            .get_by_name_prefixes(ProfileKind::Service, service_name, |name| {
                service_prefix(device_id, name)
            })
            .await?;
        let profile = service_profiles_from_entries(&entries)
            .into_iter()
            .find(|p| user_key(p.is_multi_user, p.user_id) == user_id)
            .ok_or_else(|| ProfileError::NotFound("service profile".to_string()))?;
        self.cache.add_service_profile(profile.clone());
        Ok(profile)
    }

    pub async fn get_characteristic_profile(
        &self,
        device_id: &str,
        service_name: &str,
        characteristic_key: &str,
        user_id: Option<i32>,
    ) -> Result<CharacteristicProfile, ProfileError> {
        self.check_key("deviceId", device_id)?;
        self.check_key("serviceName", service_name)?;
        self.check_key("characteristicKey", characteristic_key)?;
        if let Some(profile) = self.cache.get_characteristic_profile(
            device_id,
            service_name,
            characteristic_key,
            user_id,
        ) {
            return Ok(profile);
        }

        let entries = self
            .get_by_name_prefixes(ProfileKind::Characteristic, service_name, |name| {
                characteristic_prefix(device_id, name, characteristic_key)
            })
            .await?;
        let profile = characteristic_profiles_from_entries(&entries)
            .into_iter()
            .find(|p| user_key(p.is_multi_user, p.user_id) == user_id)
            .ok_or_else(|| ProfileError::NotFound("characteristic profile".to_string()))?;
        self.cache.add_characteristic_profile(profile.clone());
        Ok(profile)
    }

    pub async fn get_all_device_profile(&self) -> Result<Vec<DeviceProfile>, ProfileError> {
        let entries = self.get_by_prefix(&format!("{DEV_PREFIX}{SEPARATOR}")).await?;
        Ok(device_profiles_from_entries(&entries))
    }

    pub async fn get_all_service_profile(&self) -> Result<Vec<ServiceProfile>, ProfileError> {
        let entries = self.get_by_prefix(&format!("{SVR_PREFIX}{SEPARATOR}")).await?;
        Ok(service_profiles_from_entries(&entries))
    }

    pub async fn get_all_characteristic_profile(
        &self,
    ) -> Result<Vec<CharacteristicProfile>, ProfileError> {
        let entries = self.get_by_prefix(&format!("{CHAR_PREFIX}{SEPARATOR}")).await?;
        Ok(characteristic_profiles_from_entries(&entries))
    }

    /// Every device, service and characteristic entry of `udid`
    pub async fn get_profiles_by_key_prefix(
        &self,
        udid: &str,
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        let mut entries = BTreeMap::new();
        for kind in [ProfileKind::Device, ProfileKind::Service, ProfileKind::Characteristic] {
            let prefix = format!("{}{SEPARATOR}{udid}{SEPARATOR}", kind.prefix());
            entries.extend(self.get_by_prefix(&prefix).await?);
        }
        Ok(entries)
    }

    pub async fn get_entries_by_keys(
        &self,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        read_entries(self.kv.as_ref(), keys).await
    }

    // ========================================================================
    // Deletes and raw writes
    // ========================================================================

    async fn delete_keys(&self, keys: Vec<String>) -> Result<usize, ProfileError> {
        let count = keys.len();
        if count > 0 {
            self.running().await?.put_cache.delete(keys).await?;
        }
        Ok(count)
    }

    /// Keys under `entries` belonging to `user_id`; the foreground user's
    /// shadow keys are included
    fn keys_for_user(&self, entries: BTreeMap<String, String>, user_id: Option<i32>) -> Vec<String> {
        let shadow = user_id == Some(self.foreground_user_id());
        entries
            .into_keys()
            .filter(|raw| {
                ProfileKey::parse(raw).is_some_and(|key| {
                    key.user_id() == user_id || (shadow && key.user_id().is_none())
                })
            })
            .collect()
    }

    pub async fn delete_service_profile(
        &self,
        device_id: &str,
        service_name: &str,
        user_id: Option<i32>,
    ) -> Result<(), ProfileError> {
        self.check_key("deviceId", device_id)?;
        self.check_key("serviceName", service_name)?;

        let entries = self
            .get_by_name_prefixes(ProfileKind::Service, service_name, |name| {
                service_prefix(device_id, name)
            })
            .await?;
        let keys = self.keys_for_user(entries, user_id);
        if keys.is_empty() {
            return Err(ProfileError::NotFound("service profile".to_string()));
        }
        self.delete_keys(keys).await?;
        self.cache.delete_service_profile(device_id, service_name, user_id);
        info!(device = %anonymize(device_id), service = %service_name, "Service profile deleted");
        Ok(())
    }

    pub async fn delete_characteristic_profile(
        &self,
        device_id: &str,
        service_name: &str,
        characteristic_key: &str,
        user_id: Option<i32>,
    ) -> Result<(), ProfileError> {
        self.check_key("deviceId", device_id)?;
        self.check_key("serviceName", service_name)?;
        self.check_key("characteristicKey", characteristic_key)?;

        let entries = self
            .get_by_name_prefixes(ProfileKind::Characteristic, service_name, |name| {
                characteristic_prefix(device_id, name, characteristic_key)
            })
            .await?;
        let keys = self.keys_for_user(entries, user_id);
        if keys.is_empty() {
            return Err(ProfileError::NotFound("characteristic profile".to_string()));
        }
        self.delete_keys(keys).await?;
        self.cache
            .delete_characteristic_profile(device_id, service_name, characteristic_key, user_id);
        info!(
            device = %anonymize(device_id),
            characteristic = %characteristic_key,
            "Characteristic profile deleted"
        );
        Ok(())
    }

    /// Writes raw entries immediately, bypassing the startup buffer
    pub async fn save_batch_by_keys(
        &self,
        entries: BTreeMap<String, String>,
    ) -> Result<(), ProfileError> {
        if entries.is_empty() {
            return Err(ProfileError::InvalidParams("empty entry batch".to_string()));
        }
        self.running().await?.put_cache.write(entries).await
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Synchronizes dynamic profiles with the online peers among `network_ids`
    ///
    /// Returns the outcome per network id. Peers that are not online are
    /// left out; non-OH peers fail when no sync adapter can be loaded.
    pub async fn sync_device_profile(
        &self,
        network_ids: &[String],
        mode: SyncMode,
    ) -> Result<HashMap<String, SyncStatus>, ProfileError> {
        let online = self.cache.filter_online_devices(network_ids);
        if online.is_empty() {
            return Err(ProfileError::InvalidParams("no online device to sync".to_string()));
        }
        let (oh, non_oh): (Vec<_>, Vec<_>) = online.into_iter().partition(|d| d.is_oh_based());
        let mut results = HashMap::new();

        if !oh.is_empty() {
            let ids: Vec<String> = oh.into_iter().map(|d| d.network_id).collect();
            let statuses = self
                .kv
                .sync(&ids, mode)
                .await
                .map_err(|e| ProfileError::storage(StorageOp::SyncKv, e))?;
            results.extend(statuses);
        }

        if !non_oh.is_empty() {
            let ids: Vec<String> = non_oh.into_iter().map(|d| d.network_id).collect();
            let statuses = match self.adapter.load().await {
                Ok(adapter) => adapter.sync_profile(&ids).await.unwrap_or_else(|e| {
                    warn!(error = %e, "Non-OH sync failed");
                    HashMap::new()
                }),
                Err(e) => {
                    warn!(error = %e, count = ids.len(), "Skipping non-OH peers");
                    HashMap::new()
                }
            };
            for id in ids {
                let status = statuses.get(&id).copied().unwrap_or(SyncStatus::Failed);
                results.insert(id, status);
            }
        }

        info!(count = results.len(), ?mode, "Device profile sync finished");
        Ok(results)
    }

    // ========================================================================
    // Device events
    // ========================================================================

    /// Records the peer as online and queues its reconciliation
    pub async fn on_device_online(self: &Arc<Self>, info: TrustedDeviceInfo) -> Result<(), ProfileError> {
        info!(
            udid = %anonymize(&info.udid),
            os_type = info.os_type,
            "Device online"
        );
        self.cache.add_online_device(info.clone());
        let queue = self.running().await?.queue;

        let this = Arc::clone(self);
        let peer = info.clone();
        queue
            .post("fix_data_on_device_online", async move {
                Ok(this.fix_data_on_device_online(&peer).await?)
            })
            .await?;

        if !info.is_oh_based() && info.auth_form == AuthForm::PeerToPeer {
            let this = Arc::clone(self);
            let peer = info.clone();
            queue
                .post("notify_not_oh_base_online", async move {
                    Ok(this.notify_not_oh_base_online(&peer).await?)
                })
                .await?;
        }

        if self.config.sync.e2e_sync {
            let this = Arc::clone(self);
            queue
                .post("e2e_sync_dynamic_profile", async move {
                    Ok(this.e2e_sync_dynamic_profile(&info).await?)
                })
                .await?;
        }
        Ok(())
    }

    pub fn on_device_offline(&self, udid: &str) {
        if self.cache.remove_online_device(udid).is_some() {
            info!(udid = %anonymize(udid), "Device offline");
        }
    }

    /// Repairs local data, then the peer's data, for a peer that came online
    pub async fn fix_data_on_device_online(
        &self,
        peer: &TrustedDeviceInfo,
    ) -> Result<(), ProfileError> {
        let owned = self
            .kv
            .get_by_owner(&self.config.device.uuid)
            .await
            .map_err(|e| ProfileError::storage(StorageOp::GetKv, e))?;
        self.fix_local_data(self.local_udid(), &owned).await?;

        if peer.is_oh_based() {
            self.fix_remote_data_when_peer_is_oh_base(&peer.udid, &owned).await
        } else {
            self.fix_remote_data_when_peer_is_non_oh(&peer.udid).await
        }
    }

    /// Deletes entries under `local_udid` that this replica did not write
    pub async fn fix_local_data(
        &self,
        local_udid: &str,
        owned: &BTreeMap<String, String>,
    ) -> Result<(), ProfileError> {
        let stale: Vec<String> = self
            .get_profiles_by_key_prefix(local_udid)
            .await?
            .into_keys()
            .filter(|key| !owned.contains_key(key))
            .collect();
        let count = self.delete_keys(stale).await?;
        if count > 0 {
            info!(count, "Deleted local entries not owned by this replica");
        }
        Ok(())
    }

    /// Deletes OH-only data stored for a non-OH peer
    pub async fn fix_remote_data_when_peer_is_non_oh(&self, udid: &str) -> Result<(), ProfileError> {
        let denylist = &self.config.profile.non_oh_denylist_services;
        let doomed: Vec<String> = self
            .get_profiles_by_key_prefix(udid)
            .await?
            .into_keys()
            .filter(|raw| {
                ProfileKey::parse(raw).is_some_and(|key| {
                    key.has_oh_suffix()
                        || key
                            .service_name()
                            .is_some_and(|name| denylist.iter().any(|d| d == name))
                })
            })
            .collect();
        let count = self.delete_keys(doomed).await?;
        if count > 0 {
            info!(udid = %anonymize(udid), count, "Deleted OH-only entries of non-OH peer");
        }
        Ok(())
    }

    /// Deletes local placeholders for an OH peer, which syncs its own data
    pub async fn fix_remote_data_when_peer_is_oh_base(
        &self,
        udid: &str,
        owned: &BTreeMap<String, String>,
    ) -> Result<(), ProfileError> {
        let doomed: Vec<String> = owned
            .keys()
            .filter(|key| key_mentions_device(key, udid))
            .cloned()
            .collect();
        let count = self.delete_keys(doomed).await?;
        if count > 0 {
            info!(udid = %anonymize(udid), count, "Deleted local entries for OH peer");
        }
        Ok(())
    }

    async fn notify_not_oh_base_online(&self, peer: &TrustedDeviceInfo) -> Result<(), ProfileError> {
        let adapter = match self.adapter.load().await {
            Ok(adapter) => adapter,
            Err(e) => {
                debug!(error = %e, "No sync adapter to notify");
                return Ok(());
            }
        };
        adapter
            .not_oh_base_device_online(&peer.udid, &peer.network_id, true)
            .await
            .map_err(|e| ProfileError::AdapterUnavailable(e.to_string()))
    }

    async fn e2e_sync_dynamic_profile(&self, peer: &TrustedDeviceInfo) -> Result<(), ProfileError> {
        let ids = [peer.network_id.clone()];
        let dynamic = self.kv.sync(&ids, SyncMode::PushPull);
        let static_sync = async {
            if let Some(static_sync) = &self.static_sync {
                if let Err(e) = static_sync.sync_static_profile(&peer.network_id).await {
                    warn!(error = %e, "Static profile sync failed");
                }
            }
        };
        let (dynamic, ()) = tokio::join!(dynamic, static_sync);
        dynamic.map_err(|e| ProfileError::storage(StorageOp::SyncKv, e))?;
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Queues the foreground user switch from `last_user` to `cur_user`
    pub async fn on_user_change(self: &Arc<Self>, last_user: i32, cur_user: i32) -> Result<(), ProfileError> {
        if last_user == cur_user {
            return Ok(());
        }
        let this = Arc::clone(self);
        self.running()
            .await?
            .queue
            .post("switch_foreground_user", async move {
                Ok(this.switch_foreground_user(last_user, cur_user).await?)
            })
            .await
    }

    /// Rewrites `cur_user`'s entries under the suffix-less keys and deletes
    /// the suffix-less keys only `last_user` had
    ///
    /// Per-user keys are never touched. When `cur_user` has no entries of
    /// its own, `last_user`'s foreground keys are dropped rather than kept,
    /// so no stale profile of the previous user shadows the new one.
    pub async fn switch_foreground_user(&self, last_user: i32, cur_user: i32) -> Result<(), ProfileError> {
        if last_user == cur_user {
            return Ok(());
        }
        let local = self.get_profiles_by_key_prefix(self.local_udid()).await?;
        let mut promoted = BTreeMap::new();
        let mut demoted = BTreeSet::new();
        for (raw, value) in local {
            let Some(key) = ProfileKey::parse(&raw) else {
                continue;
            };
            match key.user_id() {
                Some(user) if user == cur_user => {
                    promoted.insert(key.with_user_id(None).to_string(), value);
                }
                Some(user) if user == last_user => {
                    demoted.insert(key.with_user_id(None).to_string());
                }
                _ => {}
            }
        }
        demoted.retain(|key| !promoted.contains_key(key));

        let running = self.running().await?;
        let (written, deleted) = (promoted.len(), demoted.len());
        running.put_cache.write(promoted).await?;
        running.put_cache.delete(demoted.into_iter().collect()).await?;
        self.foreground_user.store(cur_user, Ordering::Release);
        self.cache.clear_profiles();

        info!(last_user, cur_user, written, deleted, "Foreground user switched");
        Ok(())
    }

    /// Deletes every local entry of a removed user
    pub async fn delete_removed_user_data(&self, user_id: i32) -> Result<(), ProfileError> {
        if !self.config.multi_user.contains(user_id) {
            return Err(ProfileError::InvalidParams(format!("user id {user_id} out of range")));
        }
        let keys: Vec<String> = self
            .get_profiles_by_key_prefix(self.local_udid())
            .await?
            .into_keys()
            .filter(|raw| ProfileKey::parse(raw).is_some_and(|key| key.user_id() == Some(user_id)))
            .collect();
        let count = self.delete_keys(keys).await?;
        self.cache.clear_profiles();
        info!(user_id, count, "Removed user data deleted");
        Ok(())
    }

    // ========================================================================
    // Sync adapter
    // ========================================================================

    pub async fn load_dp_sync_adapter(&self) -> Result<(), ProfileError> {
        self.adapter.load().await.map(|_| ())
    }

    /// Asks the sync adapter to repair differences for the local device
    pub async fn fix_diff_profiles(&self) -> Result<(), ProfileError> {
        let adapter = self.adapter.load().await?;
        adapter
            .fix_diff_profiles(self.local_udid())
            .await
            .map_err(|e| ProfileError::AdapterUnavailable(e.to_string()))
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use dprofile_core::config::ConfigBuilder;
    use dprofile_store::SqliteKvStore;

    use super::*;

    fn manager() -> DeviceProfileManager {
        let config = ConfigBuilder::new()
            .device_udid("udid-local")
            .device_uuid("uuid-local")
            .profile_max_string_len(16)
            .multi_user_range(0, 1000)
            .multi_user_foreground(100)
            .build();
        let kv = Arc::new(SqliteKvStore::in_memory("dp_kv_store", "uuid-local"));
        DeviceProfileManager::new(kv, &config, SyncAdapterSource::Unavailable, None)
    }

    #[test]
    fn test_check_key() {
        let manager = manager();
        assert!(manager.check_key("deviceId", "udid-local").is_ok());
        assert!(manager.check_key("deviceId", "").is_err());
        assert!(manager.check_key("deviceId", "a#b").is_err());
        assert!(manager.check_key("deviceId", &"x".repeat(17)).is_err());
    }

    #[test]
    fn test_check_multi_user() {
        let manager = manager();
        assert!(manager.check_multi_user("udid-local", 100, true).is_ok());
        assert!(manager.check_multi_user("udid-peer", 100, true).is_err());
        assert!(manager.check_multi_user("udid-local", 5000, true).is_err());
        assert!(manager.check_multi_user("udid-peer", DEFAULT_USER_ID, false).is_ok());
        assert!(manager.check_multi_user("udid-peer", 100, false).is_err());
    }

    #[test]
    fn test_flatten_adds_foreground_shadow() {
        let manager = manager();
        let profile = ServiceProfile {
            device_id: "udid-local".into(),
            service_name: "camera".into(),
            service_type: "media".into(),
            user_id: 100,
            is_multi_user: true,
        };
        let flat = manager.flatten(profile.to_entries(), true, 100);
        assert!(flat.contains_key("svr#udid-local#camera#serviceType#100"));
        assert!(flat.contains_key("svr#udid-local#camera#serviceType"));

        let flat = manager.flatten(profile.to_entries(), true, 101);
        assert!(!flat.contains_key("svr#udid-local#camera#serviceType"));
    }

    #[tokio::test]
    async fn test_operations_require_init() {
        let manager = manager();
        let result = manager.save_put_temp_cache(BTreeMap::new()).await;
        assert!(matches!(result, Err(ProfileError::StorageUnavailable(_))));
    }
}
