//! Dynamic profiles and their KV flattening
//!
//! Each profile is stored as one KV entry per attribute, keyed by a
//! [`ProfileKey`]. Reassembly tolerates the OH suffix on the name segment and
//! ignores attributes it does not know.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::enums::AuthForm;
use super::key::{ProfileKey, CHARACTERISTIC_KEY};
use super::trust::DEFAULT_USER_ID;

pub const DEVICE_NAME: &str = "deviceName";
pub const MANUFACTURE_NAME: &str = "manufactureName";
pub const DEVICE_MODEL: &str = "deviceModel";
pub const STORAGE_CAPABILITY: &str = "storageCapability";
pub const OS_SYS_CAP: &str = "osSysCap";
pub const OS_API_LEVEL: &str = "osApiLevel";
pub const OS_VERSION: &str = "osVersion";
pub const OS_TYPE: &str = "osType";
pub const SERVICE_NAME: &str = "serviceName";
pub const SERVICE_TYPE: &str = "serviceType";
pub const CHARACTERISTIC_VALUE: &str = "characteristicValue";

/// OS type reported by peers running the native distributed stack
pub const OH_OS_TYPE: i32 = 10;

/// Static attributes of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub device_id: String,
    pub device_name: String,
    pub manufacture_name: String,
    pub device_model: String,
    pub storage_capability: i64,
    pub os_sys_cap: String,
    pub os_api_level: i32,
    pub os_version: String,
    pub os_type: i32,
    pub user_id: i32,
    pub is_multi_user: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_name: String::new(),
            manufacture_name: String::new(),
            device_model: String::new(),
            storage_capability: 0,
            os_sys_cap: String::new(),
            os_api_level: 0,
            os_version: String::new(),
            os_type: 0,
            user_id: DEFAULT_USER_ID,
            is_multi_user: false,
        }
    }
}

/// A service exposed by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProfile {
    pub device_id: String,
    pub service_name: String,
    pub service_type: String,
    pub user_id: i32,
    pub is_multi_user: bool,
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            service_name: String::new(),
            service_type: String::new(),
            user_id: DEFAULT_USER_ID,
            is_multi_user: false,
        }
    }
}

/// A key/value characteristic of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicProfile {
    pub device_id: String,
    pub service_name: String,
    pub characteristic_key: String,
    pub characteristic_value: String,
    pub user_id: i32,
    pub is_multi_user: bool,
}

impl Default for CharacteristicProfile {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            service_name: String::new(),
            characteristic_key: String::new(),
            characteristic_value: String::new(),
            user_id: DEFAULT_USER_ID,
            is_multi_user: false,
        }
    }
}

/// An online peer as reported by the device manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDeviceInfo {
    pub udid: String,
    pub uuid: String,
    pub network_id: String,
    pub os_type: i32,
    pub auth_form: AuthForm,
}

impl TrustedDeviceInfo {
    /// Whether the peer runs the native distributed stack
    pub fn is_oh_based(&self) -> bool {
        self.os_type == OH_OS_TYPE
    }
}

/// User id embedded in keys for a multi-user profile
fn key_user(is_multi_user: bool, user_id: i32) -> Option<i32> {
    if is_multi_user {
        Some(user_id)
    } else {
        None
    }
}

impl DeviceProfile {
    pub fn to_entries(&self) -> Vec<(ProfileKey, String)> {
        let user_id = key_user(self.is_multi_user, self.user_id);
        let key = |attribute: &str| ProfileKey::Device {
            device_id: self.device_id.clone(),
            attribute: attribute.to_string(),
            user_id,
        };
        vec![
            (key(DEVICE_NAME), self.device_name.clone()),
            (key(MANUFACTURE_NAME), self.manufacture_name.clone()),
            (key(DEVICE_MODEL), self.device_model.clone()),
            (key(STORAGE_CAPABILITY), self.storage_capability.to_string()),
            (key(OS_SYS_CAP), self.os_sys_cap.clone()),
            (key(OS_API_LEVEL), self.os_api_level.to_string()),
            (key(OS_VERSION), self.os_version.clone()),
            (key(OS_TYPE), self.os_type.to_string()),
        ]
    }

    fn apply(&mut self, attribute: &str, value: &str) {
        match attribute {
            DEVICE_NAME => self.device_name = value.to_string(),
            MANUFACTURE_NAME => self.manufacture_name = value.to_string(),
            DEVICE_MODEL => self.device_model = value.to_string(),
            STORAGE_CAPABILITY => self.storage_capability = value.parse().unwrap_or_default(),
            OS_SYS_CAP => self.os_sys_cap = value.to_string(),
            OS_API_LEVEL => self.os_api_level = value.parse().unwrap_or_default(),
            OS_VERSION => self.os_version = value.to_string(),
            OS_TYPE => self.os_type = value.parse().unwrap_or_default(),
            _ => {}
        }
    }
}

impl ServiceProfile {
    pub fn to_entries(&self) -> Vec<(ProfileKey, String)> {
        let user_id = key_user(self.is_multi_user, self.user_id);
        let key = |attribute: &str| ProfileKey::Service {
            device_id: self.device_id.clone(),
            service_name: self.service_name.clone(),
            attribute: attribute.to_string(),
            user_id,
        };
        vec![
            (key(SERVICE_NAME), self.service_name.clone()),
            (key(SERVICE_TYPE), self.service_type.clone()),
        ]
    }
}

impl CharacteristicProfile {
    pub fn to_entries(&self) -> Vec<(ProfileKey, String)> {
        let user_id = key_user(self.is_multi_user, self.user_id);
        let key = |attribute: &str| ProfileKey::Characteristic {
            device_id: self.device_id.clone(),
            service_name: self.service_name.clone(),
            characteristic_key: self.characteristic_key.clone(),
            attribute: attribute.to_string(),
            user_id,
        };
        vec![
            (key(CHARACTERISTIC_KEY), self.characteristic_key.clone()),
            (key(CHARACTERISTIC_VALUE), self.characteristic_value.clone()),
        ]
    }
}

/// Strips the OH suffix from a service name
fn plain_service(name: &str) -> String {
    name.strip_suffix(super::key::OH_PROFILE_SUFFIX)
        .unwrap_or(name)
        .to_string()
}

/// Reassembles device profiles, one per (device id, user id)
pub fn device_profiles_from_entries(entries: &BTreeMap<String, String>) -> Vec<DeviceProfile> {
    let mut grouped: BTreeMap<(String, Option<i32>), DeviceProfile> = BTreeMap::new();
    for (raw, value) in entries {
        let Some(ProfileKey::Device {
            device_id,
            attribute,
            user_id,
        }) = ProfileKey::parse(raw).map(ProfileKey::without_oh_suffix)
        else {
            continue;
        };
        let profile = grouped
            .entry((device_id.clone(), user_id))
            .or_insert_with(|| DeviceProfile {
                device_id,
                user_id: user_id.unwrap_or(DEFAULT_USER_ID),
                is_multi_user: user_id.is_some(),
                ..Default::default()
            });
        profile.apply(&attribute, value);
    }
    grouped.into_values().collect()
}

/// Reassembles service profiles, one per (device id, service, user id)
pub fn service_profiles_from_entries(entries: &BTreeMap<String, String>) -> Vec<ServiceProfile> {
    let mut grouped: BTreeMap<(String, String, Option<i32>), ServiceProfile> = BTreeMap::new();
    for (raw, value) in entries {
        let Some(ProfileKey::Service {
            device_id,
            service_name,
            attribute,
            user_id,
        }) = ProfileKey::parse(raw)
        else {
            continue;
        };
        let service_name = plain_service(&service_name);
        let profile = grouped
            .entry((device_id.clone(), service_name.clone(), user_id))
            .or_insert_with(|| ServiceProfile {
                device_id,
                service_name,
                user_id: user_id.unwrap_or(DEFAULT_USER_ID),
                is_multi_user: user_id.is_some(),
                ..Default::default()
            });
        if attribute == SERVICE_TYPE {
            profile.service_type = value.clone();
        }
    }
    grouped.into_values().collect()
}

/// Reassembles characteristic profiles, one per (device id, service, key, user id)
pub fn characteristic_profiles_from_entries(
    entries: &BTreeMap<String, String>,
) -> Vec<CharacteristicProfile> {
    let mut grouped: BTreeMap<(String, String, String, Option<i32>), CharacteristicProfile> =
        BTreeMap::new();
    for (raw, value) in entries {
        let Some(ProfileKey::Characteristic {
            device_id,
            service_name,
            characteristic_key,
            attribute,
            user_id,
        }) = ProfileKey::parse(raw)
        else {
            continue;
        };
        let service_name = plain_service(&service_name);
        let profile = grouped
            .entry((
                device_id.clone(),
                service_name.clone(),
                characteristic_key.clone(),
                user_id,
            ))
            .or_insert_with(|| CharacteristicProfile {
                device_id,
                service_name,
                characteristic_key,
                user_id: user_id.unwrap_or(DEFAULT_USER_ID),
                is_multi_user: user_id.is_some(),
                ..Default::default()
            });
        if attribute == CHARACTERISTIC_VALUE {
            profile.characteristic_value = value.clone();
        }
    }
    grouped.into_values().collect()
}
