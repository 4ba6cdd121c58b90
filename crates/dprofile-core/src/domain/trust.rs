//! Trust model entities
//!
//! An [`AccessControlProfile`] (ACL) links an [`Accesser`] identity to an
//! [`Accessee`] identity on a peer device. Accesser and accessee rows are
//! deduplicated by their full attribute tuple and shared between ACLs.
//! [`TrustDeviceProfile`] is the per-peer aggregate derived from the ACLs.

use serde::{Deserialize, Serialize};

use super::enums::{AuthForm, AuthenticationType, BindLevel, BindType, DeviceIdType, Status};

/// Wildcard user id meaning "no specific user"
pub const DEFAULT_USER_ID: i32 = -1;

/// Second wildcard user id, written by older peers for "unset"
pub const DEFAULT_USER_ID_EXTRA: i32 = 0;

/// `extraData` key that flags a topology-only ACL
pub const IS_LNN_ACL: &str = "IsLnnAcl";

/// Value of [`IS_LNN_ACL`] that marks the row as LNN
pub const LNN_ACL_TRUE: &str = "true";

/// The granting identity of an ACL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accesser {
    pub accesser_id: i64,
    pub device_id: String,
    pub user_id: i32,
    pub account_id: String,
    pub token_id: i64,
    pub bundle_name: String,
    pub hap_signature: String,
    pub bind_level: BindLevel,
    pub device_name: String,
    pub service_name: String,
    pub credential_id: i32,
    pub status: Status,
    pub session_key_id: i32,
}

/// The granted identity of an ACL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accessee {
    pub accessee_id: i64,
    pub device_id: String,
    pub user_id: i32,
    pub account_id: String,
    pub token_id: i64,
    pub bundle_name: String,
    pub hap_signature: String,
    pub bind_level: BindLevel,
    pub device_name: String,
    pub service_name: String,
    pub credential_id: i32,
    pub status: Status,
    pub session_key_id: i32,
}

/// A single trust grant between an accesser and an accessee
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlProfile {
    pub access_control_id: i64,
    pub accesser_id: i64,
    pub accessee_id: i64,
    pub trust_device_id: String,
    pub session_key: String,
    pub bind_type: BindType,
    pub authentication_type: AuthenticationType,
    pub device_id_type: DeviceIdType,
    pub device_id_hash: String,
    pub valid_period: i64,
    pub last_auth_time: i64,
    pub bind_level: BindLevel,
    pub status: Status,
    pub extra_data: String,
    pub accesser: Accesser,
    pub accessee: Accessee,
}

/// Peer and local identities of an ACL, resolved against its `trustDeviceId`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPair<'a> {
    pub peer_device_id: &'a str,
    pub peer_user_id: i32,
    pub local_device_id: &'a str,
    pub local_user_id: i32,
}

impl AccessControlProfile {
    /// Whether `extraData` marks this row as a topology-only (LNN) ACL
    ///
    /// Empty, non-JSON or non-object extra data is not LNN.
    pub fn is_lnn_acl(&self) -> bool {
        if self.extra_data.is_empty() {
            return false;
        }
        let json: serde_json::Value = match serde_json::from_str(&self.extra_data) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse ACL extra data");
                return false;
            }
        };
        match json.as_object() {
            Some(map) => map
                .get(IS_LNN_ACL)
                .and_then(|v| v.as_str())
                .map(|v| v == LNN_ACL_TRUE)
                .unwrap_or(false),
            None => {
                tracing::warn!("ACL extra data is not a JSON object");
                false
            }
        }
    }

    /// Splits the two sides into peer and local
    ///
    /// The accesser is the peer unless the accessee's device is the trusted
    /// device, in which case the roles are swapped.
    pub fn peer_pair(&self) -> PeerPair<'_> {
        if self.accessee.device_id == self.trust_device_id {
            PeerPair {
                peer_device_id: &self.trust_device_id,
                peer_user_id: self.accessee.user_id,
                local_device_id: &self.accesser.device_id,
                local_user_id: self.accesser.user_id,
            }
        } else {
            PeerPair {
                peer_device_id: &self.trust_device_id,
                peer_user_id: self.accesser.user_id,
                local_device_id: &self.accessee.device_id,
                local_user_id: self.accessee.user_id,
            }
        }
    }

    /// Whether this ACL links the same peer+user and local+user as `pair`, in either direction
    pub fn links(&self, pair: &PeerPair<'_>) -> bool {
        if self.trust_device_id != pair.peer_device_id {
            return false;
        }
        let forward = self.accesser.device_id == pair.local_device_id
            && self.accesser.user_id == pair.local_user_id
            && self.accessee.device_id == pair.peer_device_id
            && self.accessee.user_id == pair.peer_user_id;
        let reverse = self.accesser.device_id == pair.peer_device_id
            && self.accesser.user_id == pair.peer_user_id
            && self.accessee.device_id == pair.local_device_id
            && self.accessee.user_id == pair.local_user_id;
        forward || reverse
    }

    /// The trust-device view of this ACL, carrying the ACL's own status
    pub fn to_trust_device_profile(&self) -> TrustDeviceProfile {
        let pair = self.peer_pair();
        TrustDeviceProfile {
            device_id: self.trust_device_id.clone(),
            device_id_type: self.device_id_type,
            device_id_hash: self.device_id_hash.clone(),
            os_type: 0,
            auth_form: AuthForm::Invalid,
            bind_type: self.bind_type,
            bind_level: self.bind_level,
            peer_user_id: pair.peer_user_id,
            local_user_id: pair.local_user_id,
            status: self.status,
        }
    }
}

/// Aggregate trust status of a peer device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustDeviceProfile {
    pub device_id: String,
    pub device_id_type: DeviceIdType,
    pub device_id_hash: String,
    pub os_type: i32,
    pub auth_form: AuthForm,
    pub bind_type: BindType,
    pub bind_level: BindLevel,
    pub peer_user_id: i32,
    pub local_user_id: i32,
    pub status: Status,
}

/// Ephemeral matching key for bidirectional ACL queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryProfile {
    pub accesser_device_id: String,
    pub accesser_user_id: i32,
    pub accesser_account_id: String,
    pub accesser_token_id: i64,
    pub accessee_device_id: String,
    pub accessee_user_id: i32,
    pub accessee_account_id: String,
    pub accessee_token_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(trust_device_id: &str, extra: &str) -> AccessControlProfile {
        AccessControlProfile {
            trust_device_id: trust_device_id.to_string(),
            extra_data: extra.to_string(),
            accesser: Accesser {
                device_id: "local".into(),
                user_id: 100,
                ..Default::default()
            },
            accessee: Accessee {
                device_id: "peer".into(),
                user_id: 200,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn lnn_flag_requires_string_true() {
        assert!(acl("peer", r#"{"IsLnnAcl":"true"}"#).is_lnn_acl());
        assert!(!acl("peer", r#"{"IsLnnAcl":"false"}"#).is_lnn_acl());
        assert!(!acl("peer", r#"{"IsLnnAcl":true}"#).is_lnn_acl());
        assert!(!acl("peer", "").is_lnn_acl());
        assert!(!acl("peer", "not json").is_lnn_acl());
        assert!(!acl("peer", r#"["IsLnnAcl"]"#).is_lnn_acl());
    }

    #[test]
    fn peer_pair_follows_trust_device() {
        let profile = acl("peer", "");
        let pair = profile.peer_pair();
        assert_eq!(pair.peer_device_id, "peer");
        assert_eq!(pair.peer_user_id, 200);
        assert_eq!(pair.local_device_id, "local");
        assert_eq!(pair.local_user_id, 100);

        let profile = acl("local", "");
        let pair = profile.peer_pair();
        assert_eq!(pair.peer_user_id, 100);
        assert_eq!(pair.local_device_id, "peer");
    }

    #[test]
    fn links_matches_either_direction() {
        let reference = acl("peer", "");
        let pair = reference.peer_pair();

        let mut swapped = reference.clone();
        std::mem::swap(&mut swapped.accesser.device_id, &mut swapped.accessee.device_id);
        std::mem::swap(&mut swapped.accesser.user_id, &mut swapped.accessee.user_id);

        assert!(reference.links(&pair));
        assert!(swapped.links(&pair));

        let mut other_user = reference.clone();
        other_user.accessee.user_id = 201;
        assert!(!other_user.links(&pair));
    }

    #[test]
    fn trust_device_view_copies_identity() {
        let mut profile = acl("peer", "");
        profile.status = Status::Active;
        profile.bind_type = BindType::SameAccount;
        let trust = profile.to_trust_device_profile();
        assert_eq!(trust.device_id, "peer");
        assert_eq!(trust.status, Status::Active);
        assert_eq!(trust.bind_type, BindType::SameAccount);
        assert_eq!(trust.peer_user_id, 200);
        assert_eq!(trust.local_user_id, 100);
    }
}
