//! Structured KV profile keys
//!
//! Dynamic profiles are flattened into one KV entry per attribute. The key
//! layout is:
//!
//! ```text
//! dev  # deviceId # attribute                                  [# userId]
//! svr  # deviceId # serviceName # attribute                    [# userId]
//! char # deviceId # serviceName # characteristicKey # attribute [# userId]
//! ```
//!
//! Segment 2 (the attribute of a device key, the service name otherwise) is
//! the *name segment*. It may carry the `_OH` suffix written by peers that run
//! the native distributed stack. [`ProfileKey`] parses and formats this layout
//! so callers never split key strings by hand.

use std::collections::HashSet;
use std::fmt;

use super::enums::ProfileType;

/// Segment separator
pub const SEPARATOR: char = '#';
/// Prefix of device profile keys
pub const DEV_PREFIX: &str = "dev";
/// Prefix of service profile keys
pub const SVR_PREFIX: &str = "svr";
/// Prefix of characteristic profile keys
pub const CHAR_PREFIX: &str = "char";
/// Suffix marking a name segment written by an OH peer
pub const OH_PROFILE_SUFFIX: &str = "_OH";
/// Reserved characteristic leaf holding the characteristic key itself
pub const CHARACTERISTIC_KEY: &str = "characteristicKey";

/// Which kind of profile a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    Device,
    Service,
    Characteristic,
}

impl ProfileKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ProfileKind::Device => DEV_PREFIX,
            ProfileKind::Service => SVR_PREFIX,
            ProfileKind::Characteristic => CHAR_PREFIX,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            DEV_PREFIX => Some(ProfileKind::Device),
            SVR_PREFIX => Some(ProfileKind::Service),
            CHAR_PREFIX => Some(ProfileKind::Characteristic),
            _ => None,
        }
    }

    /// Number of segments without the optional user id
    fn base_len(self) -> usize {
        match self {
            ProfileKind::Device => 3,
            ProfileKind::Service => 4,
            ProfileKind::Characteristic => 5,
        }
    }

    pub fn profile_type(self) -> ProfileType {
        match self {
            ProfileKind::Device => ProfileType::Device,
            ProfileKind::Service => ProfileType::Service,
            ProfileKind::Characteristic => ProfileType::Characteristic,
        }
    }
}

/// A parsed dynamic-profile key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProfileKey {
    Device {
        device_id: String,
        attribute: String,
        user_id: Option<i32>,
    },
    Service {
        device_id: String,
        service_name: String,
        attribute: String,
        user_id: Option<i32>,
    },
    Characteristic {
        device_id: String,
        service_name: String,
        characteristic_key: String,
        attribute: String,
        user_id: Option<i32>,
    },
}

impl ProfileKey {
    /// Parses a raw KV key. Returns `None` for anything that is not a
    /// well-formed profile key.
    pub fn parse(raw: &str) -> Option<Self> {
        let segments: Vec<&str> = raw.split(SEPARATOR).collect();
        let kind = ProfileKind::from_prefix(segments.first()?)?;
        let base = kind.base_len();
        let user_id = match segments.len() {
            n if n == base => None,
            n if n == base + 1 => Some(segments[base].parse::<i32>().ok()?),
            _ => return None,
        };
        if segments[1..base].iter().any(|s| s.is_empty()) {
            return None;
        }
        let owned = |i: usize| segments[i].to_string();
        Some(match kind {
            ProfileKind::Device => ProfileKey::Device {
                device_id: owned(1),
                attribute: owned(2),
                user_id,
            },
            ProfileKind::Service => ProfileKey::Service {
                device_id: owned(1),
                service_name: owned(2),
                attribute: owned(3),
                user_id,
            },
            ProfileKind::Characteristic => ProfileKey::Characteristic {
                device_id: owned(1),
                service_name: owned(2),
                characteristic_key: owned(3),
                attribute: owned(4),
                user_id,
            },
        })
    }

    pub fn kind(&self) -> ProfileKind {
        match self {
            ProfileKey::Device { .. } => ProfileKind::Device,
            ProfileKey::Service { .. } => ProfileKind::Service,
            ProfileKey::Characteristic { .. } => ProfileKind::Characteristic,
        }
    }

    pub fn profile_type(&self) -> ProfileType {
        self.kind().profile_type()
    }

    /// The leaf attribute name
    pub fn attribute(&self) -> &str {
        match self {
            ProfileKey::Device { attribute, .. }
            | ProfileKey::Service { attribute, .. }
            | ProfileKey::Characteristic { attribute, .. } => attribute,
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        match self {
            ProfileKey::Device { .. } => None,
            ProfileKey::Service { service_name, .. }
            | ProfileKey::Characteristic { service_name, .. } => Some(service_name),
        }
    }

    pub fn user_id(&self) -> Option<i32> {
        match self {
            ProfileKey::Device { user_id, .. }
            | ProfileKey::Service { user_id, .. }
            | ProfileKey::Characteristic { user_id, .. } => *user_id,
        }
    }

    /// Same key with the user id replaced (or removed with `None`)
    pub fn with_user_id(mut self, user: Option<i32>) -> Self {
        match &mut self {
            ProfileKey::Device { user_id, .. }
            | ProfileKey::Service { user_id, .. }
            | ProfileKey::Characteristic { user_id, .. } => *user_id = user,
        }
        self
    }

    /// The segment that may carry the OH suffix
    pub fn name_segment(&self) -> &str {
        match self {
            ProfileKey::Device { attribute, .. } => attribute,
            ProfileKey::Service { service_name, .. }
            | ProfileKey::Characteristic { service_name, .. } => service_name,
        }
    }

    fn name_segment_mut(&mut self) -> &mut String {
        match self {
            ProfileKey::Device { attribute, .. } => attribute,
            ProfileKey::Service { service_name, .. }
            | ProfileKey::Characteristic { service_name, .. } => service_name,
        }
    }

    pub fn has_oh_suffix(&self) -> bool {
        self.name_segment().ends_with(OH_PROFILE_SUFFIX)
    }

    /// Same key with the OH suffix appended to the name segment (idempotent)
    pub fn with_oh_suffix(mut self) -> Self {
        if !self.has_oh_suffix() {
            self.name_segment_mut().push_str(OH_PROFILE_SUFFIX);
        }
        self
    }

    /// Same key with the OH suffix stripped from the name segment
    pub fn without_oh_suffix(mut self) -> Self {
        let segment = self.name_segment_mut();
        if let Some(stripped) = segment.strip_suffix(OH_PROFILE_SUFFIX) {
            *segment = stripped.to_string();
        }
        self
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = SEPARATOR;
        match self {
            ProfileKey::Device {
                device_id,
                attribute,
                ..
            } => write!(f, "{DEV_PREFIX}{s}{device_id}{s}{attribute}")?,
            ProfileKey::Service {
                device_id,
                service_name,
                attribute,
                ..
            } => write!(f, "{SVR_PREFIX}{s}{device_id}{s}{service_name}{s}{attribute}")?,
            ProfileKey::Characteristic {
                device_id,
                service_name,
                characteristic_key,
                attribute,
                ..
            } => write!(
                f,
                "{CHAR_PREFIX}{s}{device_id}{s}{service_name}{s}{characteristic_key}{s}{attribute}"
            )?,
        }
        if let Some(user) = self.user_id() {
            write!(f, "{s}{user}")?;
        }
        Ok(())
    }
}

/// Key prefix covering every device-profile entry of `device_id`
pub fn device_prefix(device_id: &str) -> String {
    format!("{DEV_PREFIX}{SEPARATOR}{device_id}{SEPARATOR}")
}

/// Key prefix covering every entry of one service
pub fn service_prefix(device_id: &str, service_name: &str) -> String {
    format!("{SVR_PREFIX}{SEPARATOR}{device_id}{SEPARATOR}{service_name}{SEPARATOR}")
}

/// Key prefix covering every entry of one characteristic
pub fn characteristic_prefix(device_id: &str, service_name: &str, characteristic_key: &str) -> String {
    format!(
        "{CHAR_PREFIX}{SEPARATOR}{device_id}{SEPARATOR}{service_name}{SEPARATOR}{characteristic_key}{SEPARATOR}"
    )
}

/// Whether `raw` contains `udid` as a whole key segment
pub fn key_mentions_device(raw: &str, udid: &str) -> bool {
    !udid.is_empty() && raw.split(SEPARATOR).any(|segment| segment == udid)
}

/// Which name segments are written with the OH suffix
#[derive(Debug, Clone, Default)]
pub struct OhSuffixPolicy {
    device_attributes: HashSet<String>,
    services: HashSet<String>,
}

impl OhSuffixPolicy {
    pub fn new<A, S>(device_attributes: A, services: S) -> Self
    where
        A: IntoIterator<Item = String>,
        S: IntoIterator<Item = String>,
    {
        Self {
            device_attributes: device_attributes.into_iter().collect(),
            services: services.into_iter().collect(),
        }
    }

    /// Whether an unsuffixed key has a suffixed counterpart
    ///
    /// Service keys look up the service set; device and characteristic keys
    /// look up the device-attribute set.
    pub fn needs_suffix(&self, key: &ProfileKey) -> bool {
        !key.has_oh_suffix() && self.listed(key.kind(), key.name_segment())
    }

    fn listed(&self, kind: ProfileKind, name: &str) -> bool {
        match kind {
            ProfileKind::Service => self.services.contains(name),
            ProfileKind::Device | ProfileKind::Characteristic => {
                self.device_attributes.contains(name)
            }
        }
    }

    /// A name segment of `kind` as it is written to the store
    pub fn stored_name(&self, kind: ProfileKind, name: &str) -> String {
        if !name.ends_with(OH_PROFILE_SUFFIX) && self.listed(kind, name) {
            format!("{name}{OH_PROFILE_SUFFIX}")
        } else {
            name.to_string()
        }
    }

    /// Applies the suffix when the policy asks for it
    pub fn apply(&self, key: ProfileKey) -> ProfileKey {
        if self.needs_suffix(&key) {
            key.with_oh_suffix()
        } else {
            key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_kinds() {
        let key = ProfileKey::parse("dev#udid1#deviceName").unwrap();
        assert_eq!(key.kind(), ProfileKind::Device);
        assert_eq!(key.attribute(), "deviceName");
        assert_eq!(key.user_id(), None);

        let key = ProfileKey::parse("svr#udid1#camera#serviceType#100").unwrap();
        assert_eq!(key.service_name(), Some("camera"));
        assert_eq!(key.user_id(), Some(100));

        let key = ProfileKey::parse("char#udid1#camera#switch#characteristicValue").unwrap();
        assert_eq!(key.kind(), ProfileKind::Characteristic);
        assert_eq!(key.name_segment(), "camera");
        assert_eq!(key.profile_type(), ProfileType::Characteristic);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(ProfileKey::parse("").is_none());
        assert!(ProfileKey::parse("acl#x#y").is_none());
        assert!(ProfileKey::parse("dev#udid1").is_none());
        assert!(ProfileKey::parse("dev#udid1#attr#notanumber").is_none());
        assert!(ProfileKey::parse("dev#udid1#attr#1#2").is_none());
        assert!(ProfileKey::parse("dev##attr").is_none());
    }

    #[test]
    fn format_is_inverse_of_parse() {
        for raw in [
            "dev#udid1#osType",
            "dev#udid1#osType#7",
            "svr#udid1#camera#serviceName",
            "char#udid1#camera#switch#characteristicKey#-1",
        ] {
            assert_eq!(ProfileKey::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn suffix_applies_to_name_segment() {
        let key = ProfileKey::parse("svr#udid1#camera#serviceType#5").unwrap();
        let suffixed = key.clone().with_oh_suffix();
        assert_eq!(suffixed.to_string(), "svr#udid1#camera_OH#serviceType#5");
        assert!(suffixed.has_oh_suffix());
        assert_eq!(suffixed.clone().with_oh_suffix(), suffixed);
        assert_eq!(suffixed.without_oh_suffix(), key);
    }

    #[test]
    fn user_id_can_be_stripped() {
        let key = ProfileKey::parse("dev#udid1#osType#7").unwrap();
        assert_eq!(key.with_user_id(None).to_string(), "dev#udid1#osType");
    }

    #[test]
    fn policy_uses_per_kind_sets() {
        let policy = OhSuffixPolicy::new(vec!["osType".to_string()], vec!["camera".to_string()]);
        let dev = ProfileKey::parse("dev#u#osType").unwrap();
        let svr = ProfileKey::parse("svr#u#camera#serviceType").unwrap();
        let other = ProfileKey::parse("svr#u#osType#serviceType").unwrap();
        assert!(policy.needs_suffix(&dev));
        assert!(policy.needs_suffix(&svr));
        assert!(!policy.needs_suffix(&other));
        assert!(!policy.needs_suffix(&dev.clone().with_oh_suffix()));
        assert_eq!(policy.apply(dev).to_string(), "dev#u#osType_OH");
        assert_eq!(policy.stored_name(ProfileKind::Service, "camera"), "camera_OH");
        assert_eq!(policy.stored_name(ProfileKind::Service, "camera_OH"), "camera_OH");
        assert_eq!(policy.stored_name(ProfileKind::Characteristic, "camera"), "camera");
    }

    #[test]
    fn prefixes_and_device_mentions() {
        assert_eq!(device_prefix("u"), "dev#u#");
        assert_eq!(service_prefix("u", "s"), "svr#u#s#");
        assert_eq!(characteristic_prefix("u", "s", "c"), "char#u#s#c#");
        assert!(key_mentions_device("svr#peer#camera#serviceType", "peer"));
        assert!(!key_mentions_device("svr#peer2#camera#serviceType", "peer"));
    }
}
