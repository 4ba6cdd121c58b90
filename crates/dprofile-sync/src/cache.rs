//! In-memory profile cache and online device table
//!
//! The cache remembers the last profile written per identity so an
//! identical write can be skipped. It is advisory: reads fall back to the
//! store on a miss, and anything that rewrites keys in bulk clears it.

use dashmap::DashMap;

use dprofile_core::domain::{
    CharacteristicProfile, DeviceProfile, ServiceProfile, TrustedDeviceInfo,
};

/// User component of a cache key; `None` for single-user profiles
type UserKey = Option<i32>;

pub(crate) fn user_key(is_multi_user: bool, user_id: i32) -> UserKey {
    is_multi_user.then_some(user_id)
}

#[derive(Default)]
pub struct ProfileCache {
    devices: DashMap<(String, UserKey), DeviceProfile>,
    services: DashMap<(String, String, UserKey), ServiceProfile>,
    characteristics: DashMap<(String, String, String, UserKey), CharacteristicProfile>,
    /// Online peers by udid
    online: DashMap<String, TrustedDeviceInfo>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Device profiles
    // ------------------------------------------------------------------

    fn device_key(profile: &DeviceProfile) -> (String, UserKey) {
        (
            profile.device_id.clone(),
            user_key(profile.is_multi_user, profile.user_id),
        )
    }

    pub fn contains_device_profile(&self, profile: &DeviceProfile) -> bool {
        self.devices
            .get(&Self::device_key(profile))
            .is_some_and(|cached| *cached == *profile)
    }

    pub fn add_device_profile(&self, profile: DeviceProfile) {
        self.devices.insert(Self::device_key(&profile), profile);
    }

    pub fn get_device_profile(&self, device_id: &str, user: UserKey) -> Option<DeviceProfile> {
        self.devices
            .get(&(device_id.to_string(), user))
            .map(|p| p.clone())
    }

    // ------------------------------------------------------------------
    // Service profiles
    // ------------------------------------------------------------------

    fn service_key(profile: &ServiceProfile) -> (String, String, UserKey) {
        (
            profile.device_id.clone(),
            profile.service_name.clone(),
            user_key(profile.is_multi_user, profile.user_id),
        )
    }

    pub fn contains_service_profile(&self, profile: &ServiceProfile) -> bool {
        self.services
            .get(&Self::service_key(profile))
            .is_some_and(|cached| *cached == *profile)
    }

    pub fn add_service_profile(&self, profile: ServiceProfile) {
        self.services.insert(Self::service_key(&profile), profile);
    }

    pub fn get_service_profile(
        &self,
        device_id: &str,
        service_name: &str,
        user: UserKey,
    ) -> Option<ServiceProfile> {
        self.services
            .get(&(device_id.to_string(), service_name.to_string(), user))
            .map(|p| p.clone())
    }

    pub fn delete_service_profile(&self, device_id: &str, service_name: &str, user: UserKey) {
        self.services
            .remove(&(device_id.to_string(), service_name.to_string(), user));
    }

    // ------------------------------------------------------------------
    // Characteristic profiles
    // ------------------------------------------------------------------

    fn characteristic_key(profile: &CharacteristicProfile) -> (String, String, String, UserKey) {
        (
            profile.device_id.clone(),
            profile.service_name.clone(),
            profile.characteristic_key.clone(),
            user_key(profile.is_multi_user, profile.user_id),
        )
    }

    pub fn contains_characteristic_profile(&self, profile: &CharacteristicProfile) -> bool {
        self.characteristics
            .get(&Self::characteristic_key(profile))
            .is_some_and(|cached| *cached == *profile)
    }

    pub fn add_characteristic_profile(&self, profile: CharacteristicProfile) {
        self.characteristics
            .insert(Self::characteristic_key(&profile), profile);
    }

    pub fn get_characteristic_profile(
        &self,
        device_id: &str,
        service_name: &str,
        characteristic_key: &str,
        user: UserKey,
    ) -> Option<CharacteristicProfile> {
        self.characteristics
            .get(&(
                device_id.to_string(),
                service_name.to_string(),
                characteristic_key.to_string(),
                user,
            ))
            .map(|p| p.clone())
    }

    pub fn delete_characteristic_profile(
        &self,
        device_id: &str,
        service_name: &str,
        characteristic_key: &str,
        user: UserKey,
    ) {
        self.characteristics.remove(&(
            device_id.to_string(),
            service_name.to_string(),
            characteristic_key.to_string(),
            user,
        ));
    }

    /// Forgets every cached profile; the online table is kept
    pub fn clear_profiles(&self) {
        self.devices.clear();
        self.services.clear();
        self.characteristics.clear();
    }

    // ------------------------------------------------------------------
    // Online devices
    // ------------------------------------------------------------------

    pub fn add_online_device(&self, info: TrustedDeviceInfo) {
        self.online.insert(info.udid.clone(), info);
    }

    pub fn remove_online_device(&self, udid: &str) -> Option<TrustedDeviceInfo> {
        self.online.remove(udid).map(|(_, info)| info)
    }

    pub fn online_device_count(&self) -> usize {
        self.online.len()
    }

    /// Online peers whose network id is listed, in the order given
    pub fn filter_online_devices(&self, network_ids: &[String]) -> Vec<TrustedDeviceInfo> {
        network_ids
            .iter()
            .filter_map(|network_id| {
                self.online
                    .iter()
                    .find(|entry| entry.network_id == *network_id)
                    .map(|entry| entry.value().clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use dprofile_core::domain::AuthForm;

    use super::*;

    fn device(user_id: i32, is_multi_user: bool, name: &str) -> DeviceProfile {
        DeviceProfile {
            device_id: "local".into(),
            device_name: name.into(),
            user_id,
            is_multi_user,
            ..Default::default()
        }
    }

    #[test]
    fn test_identical_profile_is_cached() {
        let cache = ProfileCache::new();
        let profile = device(-1, false, "phone");
        assert!(!cache.contains_device_profile(&profile));
        cache.add_device_profile(profile.clone());
        assert!(cache.contains_device_profile(&profile));
        assert!(!cache.contains_device_profile(&device(-1, false, "tablet")));
    }

    #[test]
    fn test_users_are_cached_separately() {
        let cache = ProfileCache::new();
        cache.add_device_profile(device(100, true, "work"));
        assert!(cache.get_device_profile("local", Some(100)).is_some());
        assert!(cache.get_device_profile("local", None).is_none());
    }

    #[test]
    fn test_service_delete_and_clear() {
        let cache = ProfileCache::new();
        let service = ServiceProfile {
            device_id: "local".into(),
            service_name: "camera".into(),
            ..Default::default()
        };
        cache.add_service_profile(service.clone());
        cache.delete_service_profile("local", "camera", None);
        assert!(!cache.contains_service_profile(&service));

        cache.add_service_profile(service.clone());
        cache.clear_profiles();
        assert!(cache.get_service_profile("local", "camera", None).is_none());
    }

    #[test]
    fn test_filter_online_devices_by_network_id() {
        let cache = ProfileCache::new();
        cache.add_online_device(TrustedDeviceInfo {
            udid: "udid-a".into(),
            network_id: "net-a".into(),
            os_type: 10,
            auth_form: AuthForm::IdenticalAccount,
            ..Default::default()
        });
        let online = cache.filter_online_devices(&["net-x".into(), "net-a".into()]);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].udid, "udid-a");

        assert!(cache.remove_online_device("udid-a").is_some());
        assert_eq!(cache.online_device_count(), 0);
    }
}
