//! Domain entities and business rules
//!
//! This module contains the core domain types of the profile service:
//! - Persisted enumerations (bind type, status, profile/change types)
//! - The trust model (accesser, accessee, ACL, trust device)
//! - Dynamic device/service/characteristic profiles
//! - The structured profile key used by the KV store
//! - Bidirectional ACL matching predicates
//! - The error taxonomy shared by the ledger and the engine

pub mod enums;
pub mod errors;
pub mod key;
pub mod matching;
pub mod profile;
pub mod trust;

// Re-export commonly used types
pub use enums::{
    AuthForm, AuthenticationType, BindLevel, BindType, ChangeType, DeviceIdType, ProfileType,
    QueryType, Status, SyncMode, SyncStatus,
};
pub use errors::{ProfileError, StorageError, StorageOp};
pub use key::{ProfileKey, ProfileKind};
pub use profile::{CharacteristicProfile, DeviceProfile, ServiceProfile, TrustedDeviceInfo};
pub use trust::{
    AccessControlProfile, Accessee, Accesser, QueryProfile, TrustDeviceProfile,
    DEFAULT_USER_ID, DEFAULT_USER_ID_EXTRA,
};

/// Shortens an identifier for log output, keeping the first and last four characters
///
/// Device ids and account ids are never logged in full.
pub fn anonymize(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}**{tail}")
}
