//! Row mapping for the trust tables
//!
//! Converts between domain entities and `ValuesBucket`/`Row` column maps.
//! Column names are the persisted camelCase names.

use dprofile_core::domain::{
    AccessControlProfile, Accessee, Accesser, AuthForm, AuthenticationType, BindLevel, BindType,
    DeviceIdType, Status, TrustDeviceProfile,
};
use dprofile_core::ports::{Row, Value, ValuesBucket};

pub const TRUST_DEVICE_TABLE: &str = "trust_device_table";
pub const ACCESSER_TABLE: &str = "accesser_table";
pub const ACCESSEE_TABLE: &str = "accessee_table";
pub const ACCESS_CONTROL_TABLE: &str = "access_control_table";

/// ACLs joined with both identities, in id order
pub const SELECT_ACL_JOINED: &str = "SELECT a.*, r.*, e.* FROM access_control_table a \
     JOIN accesser_table r ON a.accesserId = r.accesserId \
     JOIN accessee_table e ON a.accesseeId = e.accesseeId";

pub const ACL_ORDER: &str = " ORDER BY a.accessControlId";

/// Accesser lookup by every attribute except the id
pub const SELECT_ACCESSER_BY_ALL: &str = "SELECT accesserId FROM accesser_table WHERE \
     accesserDeviceId = ? AND accesserUserId = ? AND accesserAccountId = ? AND \
     accesserTokenId = ? AND accesserBundleName = ? AND accesserHapSignature = ? AND \
     accesserBindLevel = ? AND accesserDeviceName = ? AND accesserServiceName = ? AND \
     accesserCredentialId = ? AND accesserStatus = ? AND accesserSessionKeyId = ?";

/// Accessee lookup by every attribute except the id
pub const SELECT_ACCESSEE_BY_ALL: &str = "SELECT accesseeId FROM accessee_table WHERE \
     accesseeDeviceId = ? AND accesseeUserId = ? AND accesseeAccountId = ? AND \
     accesseeTokenId = ? AND accesseeBundleName = ? AND accesseeHapSignature = ? AND \
     accesseeBindLevel = ? AND accesseeDeviceName = ? AND accesseeServiceName = ? AND \
     accesseeCredentialId = ? AND accesseeStatus = ? AND accesseeSessionKeyId = ?";

/// ACL lookup by every attribute except the id, status and extra data
pub const SELECT_ACL_BY_ALL_EXCEPT_STATUS: &str = "SELECT accessControlId FROM access_control_table \
     WHERE accesserId = ? AND accesseeId = ? AND trustDeviceId = ? AND sessionKey = ? AND \
     bindType = ? AND authenticationType = ? AND deviceIdType = ? AND deviceIdHash = ? AND \
     validPeriod = ? AND lastAuthTime = ? AND bindLevel = ?";

pub const SELECT_MAX_ACL_ID: &str = "SELECT MAX(accessControlId) AS maxId FROM access_control_table";
pub const SELECT_MAX_ACCESSER_ID: &str = "SELECT MAX(accesserId) AS maxId FROM accesser_table";
pub const SELECT_MAX_ACCESSEE_ID: &str = "SELECT MAX(accesseeId) AS maxId FROM accessee_table";

pub const COUNT_ACL_BY_ACCESSER: &str =
    "SELECT COUNT(*) AS n FROM access_control_table WHERE accesserId = ?";
pub const COUNT_ACL_BY_ACCESSEE: &str =
    "SELECT COUNT(*) AS n FROM access_control_table WHERE accesseeId = ?";
pub const COUNT_ACL_BY_TRUST_DEVICE: &str =
    "SELECT COUNT(*) AS n FROM access_control_table WHERE trustDeviceId = ?";

pub const SELECT_TRUST_DEVICE: &str = "SELECT * FROM trust_device_table WHERE deviceId = ?";
pub const SELECT_ALL_TRUST_DEVICES: &str = "SELECT * FROM trust_device_table ORDER BY id";

pub const WHERE_DEVICE_ID: &str = "deviceId = ?";
pub const WHERE_ACCESSER_ID: &str = "accesserId = ?";
pub const WHERE_ACCESSEE_ID: &str = "accesseeId = ?";
pub const WHERE_ACCESS_CONTROL_ID: &str = "accessControlId = ?";

fn bucket<const N: usize>(pairs: [(&str, Value); N]) -> ValuesBucket {
    pairs
        .into_iter()
        .map(|(column, value)| (column.to_string(), value))
        .collect()
}

pub fn trust_device_to_values(profile: &TrustDeviceProfile) -> ValuesBucket {
    bucket([
        ("deviceId", Value::from(&profile.device_id)),
        ("deviceIdType", Value::from(profile.device_id_type.as_u32())),
        ("deviceIdHash", Value::from(&profile.device_id_hash)),
        ("osType", Value::from(profile.os_type)),
        ("authForm", Value::from(i32::from(profile.auth_form))),
        ("bindType", Value::from(profile.bind_type.as_u32())),
        ("bindLevel", Value::from(profile.bind_level.as_u32())),
        ("peerUserId", Value::from(profile.peer_user_id)),
        ("localUserId", Value::from(profile.local_user_id)),
        ("status", Value::from(profile.status.as_i32())),
    ])
}

pub fn trust_device_from_row(row: &Row) -> TrustDeviceProfile {
    TrustDeviceProfile {
        device_id: row.get_string("deviceId"),
        device_id_type: DeviceIdType::from(row.get_u32("deviceIdType")),
        device_id_hash: row.get_string("deviceIdHash"),
        os_type: row.get_i32("osType"),
        auth_form: AuthForm::from(row.get_i32("authForm")),
        bind_type: BindType::from(row.get_u32("bindType")),
        bind_level: BindLevel::from(row.get_u32("bindLevel")),
        peer_user_id: row.get_i32("peerUserId"),
        local_user_id: row.get_i32("localUserId"),
        status: Status::from(row.get_i32("status")),
    }
}

/// Columns of an accesser row, without the id
pub fn accesser_attributes(accesser: &Accesser) -> Vec<(&'static str, Value)> {
    vec![
        ("accesserDeviceId", Value::from(&accesser.device_id)),
        ("accesserUserId", Value::from(accesser.user_id)),
        ("accesserAccountId", Value::from(&accesser.account_id)),
        ("accesserTokenId", Value::from(accesser.token_id)),
        ("accesserBundleName", Value::from(&accesser.bundle_name)),
        ("accesserHapSignature", Value::from(&accesser.hap_signature)),
        ("accesserBindLevel", Value::from(accesser.bind_level.as_u32())),
        ("accesserDeviceName", Value::from(&accesser.device_name)),
        ("accesserServiceName", Value::from(&accesser.service_name)),
        ("accesserCredentialId", Value::from(accesser.credential_id)),
        ("accesserStatus", Value::from(accesser.status.as_i32())),
        ("accesserSessionKeyId", Value::from(accesser.session_key_id)),
    ]
}

/// Columns of an accessee row, without the id
pub fn accessee_attributes(accessee: &Accessee) -> Vec<(&'static str, Value)> {
    vec![
        ("accesseeDeviceId", Value::from(&accessee.device_id)),
        ("accesseeUserId", Value::from(accessee.user_id)),
        ("accesseeAccountId", Value::from(&accessee.account_id)),
        ("accesseeTokenId", Value::from(accessee.token_id)),
        ("accesseeBundleName", Value::from(&accessee.bundle_name)),
        ("accesseeHapSignature", Value::from(&accessee.hap_signature)),
        ("accesseeBindLevel", Value::from(accessee.bind_level.as_u32())),
        ("accesseeDeviceName", Value::from(&accessee.device_name)),
        ("accesseeServiceName", Value::from(&accessee.service_name)),
        ("accesseeCredentialId", Value::from(accessee.credential_id)),
        ("accesseeStatus", Value::from(accessee.status.as_i32())),
        ("accesseeSessionKeyId", Value::from(accessee.session_key_id)),
    ]
}

pub fn accesser_to_values(accesser: &Accesser) -> ValuesBucket {
    let mut values: ValuesBucket = accesser_attributes(accesser)
        .into_iter()
        .map(|(c, v)| (c.to_string(), v))
        .collect();
    values.insert("accesserId".to_string(), Value::from(accesser.accesser_id));
    values
}

pub fn accessee_to_values(accessee: &Accessee) -> ValuesBucket {
    let mut values: ValuesBucket = accessee_attributes(accessee)
        .into_iter()
        .map(|(c, v)| (c.to_string(), v))
        .collect();
    values.insert("accesseeId".to_string(), Value::from(accessee.accessee_id));
    values
}

pub fn acl_to_values(profile: &AccessControlProfile) -> ValuesBucket {
    bucket([
        ("accessControlId", Value::from(profile.access_control_id)),
        ("accesserId", Value::from(profile.accesser_id)),
        ("accesseeId", Value::from(profile.accessee_id)),
        ("trustDeviceId", Value::from(&profile.trust_device_id)),
        ("sessionKey", Value::from(&profile.session_key)),
        ("bindType", Value::from(profile.bind_type.as_u32())),
        (
            "authenticationType",
            Value::from(profile.authentication_type.as_u32()),
        ),
        ("deviceIdType", Value::from(profile.device_id_type.as_u32())),
        ("deviceIdHash", Value::from(&profile.device_id_hash)),
        ("validPeriod", Value::from(profile.valid_period)),
        ("lastAuthTime", Value::from(profile.last_auth_time)),
        ("bindLevel", Value::from(profile.bind_level.as_u32())),
        ("status", Value::from(profile.status.as_i32())),
        ("extraData", Value::from(&profile.extra_data)),
    ])
}

/// Arguments for [`SELECT_ACL_BY_ALL_EXCEPT_STATUS`]
pub fn acl_identity_args(profile: &AccessControlProfile) -> Vec<Value> {
    vec![
        Value::from(profile.accesser_id),
        Value::from(profile.accessee_id),
        Value::from(&profile.trust_device_id),
        Value::from(&profile.session_key),
        Value::from(profile.bind_type.as_u32()),
        Value::from(profile.authentication_type.as_u32()),
        Value::from(profile.device_id_type.as_u32()),
        Value::from(&profile.device_id_hash),
        Value::from(profile.valid_period),
        Value::from(profile.last_auth_time),
        Value::from(profile.bind_level.as_u32()),
    ]
}

fn accesser_from_row(row: &Row) -> Accesser {
    Accesser {
        accesser_id: row.get_i64("accesserId"),
        device_id: row.get_string("accesserDeviceId"),
        user_id: row.get_i32("accesserUserId"),
        account_id: row.get_string("accesserAccountId"),
        token_id: row.get_i64("accesserTokenId"),
        bundle_name: row.get_string("accesserBundleName"),
        hap_signature: row.get_string("accesserHapSignature"),
        bind_level: BindLevel::from(row.get_u32("accesserBindLevel")),
        device_name: row.get_string("accesserDeviceName"),
        service_name: row.get_string("accesserServiceName"),
        credential_id: row.get_i32("accesserCredentialId"),
        status: Status::from(row.get_i32("accesserStatus")),
        session_key_id: row.get_i32("accesserSessionKeyId"),
    }
}

fn accessee_from_row(row: &Row) -> Accessee {
    Accessee {
        accessee_id: row.get_i64("accesseeId"),
        device_id: row.get_string("accesseeDeviceId"),
        user_id: row.get_i32("accesseeUserId"),
        account_id: row.get_string("accesseeAccountId"),
        token_id: row.get_i64("accesseeTokenId"),
        bundle_name: row.get_string("accesseeBundleName"),
        hap_signature: row.get_string("accesseeHapSignature"),
        bind_level: BindLevel::from(row.get_u32("accesseeBindLevel")),
        device_name: row.get_string("accesseeDeviceName"),
        service_name: row.get_string("accesseeServiceName"),
        credential_id: row.get_i32("accesseeCredentialId"),
        status: Status::from(row.get_i32("accesseeStatus")),
        session_key_id: row.get_i32("accesseeSessionKeyId"),
    }
}

/// Builds an ACL from a row of [`SELECT_ACL_JOINED`]
pub fn acl_from_joined_row(row: &Row) -> AccessControlProfile {
    AccessControlProfile {
        access_control_id: row.get_i64("accessControlId"),
        accesser_id: row.get_i64("accesserId"),
        accessee_id: row.get_i64("accesseeId"),
        trust_device_id: row.get_string("trustDeviceId"),
        session_key: row.get_string("sessionKey"),
        bind_type: BindType::from(row.get_u32("bindType")),
        authentication_type: AuthenticationType::from(row.get_u32("authenticationType")),
        device_id_type: DeviceIdType::from(row.get_u32("deviceIdType")),
        device_id_hash: row.get_string("deviceIdHash"),
        valid_period: row.get_i64("validPeriod"),
        last_auth_time: row.get_i64("lastAuthTime"),
        bind_level: BindLevel::from(row.get_u32("bindLevel")),
        status: Status::from(row.get_i32("status")),
        extra_data: row.get_string("extraData"),
        accesser: accesser_from_row(row),
        accessee: accessee_from_row(row),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn joined_row_round_trips_acl() {
        let acl = AccessControlProfile {
            access_control_id: 3,
            accesser_id: 1,
            accessee_id: 2,
            trust_device_id: "peer".into(),
            bind_type: BindType::PointToPoint,
            bind_level: BindLevel::App,
            status: Status::Active,
            extra_data: "{}".into(),
            accesser: Accesser {
                accesser_id: 1,
                device_id: "local".into(),
                token_id: 42,
                ..Default::default()
            },
            accessee: Accessee {
                accessee_id: 2,
                device_id: "peer".into(),
                bundle_name: "com.example.app".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut columns = BTreeMap::new();
        columns.extend(acl_to_values(&acl));
        columns.extend(accesser_to_values(&acl.accesser));
        columns.extend(accessee_to_values(&acl.accessee));
        assert_eq!(acl_from_joined_row(&Row::new(columns)), acl);
    }

    #[test]
    fn trust_device_keeps_auth_form() {
        let profile = TrustDeviceProfile {
            device_id: "peer".into(),
            auth_form: AuthForm::IdenticalAccount,
            status: Status::Active,
            ..Default::default()
        };
        let row = Row::new(trust_device_to_values(&profile));
        assert_eq!(trust_device_from_row(&row), profile);
    }

    #[test]
    fn identity_args_match_query_placeholders() {
        let placeholders = SELECT_ACL_BY_ALL_EXCEPT_STATUS.matches('?').count();
        assert_eq!(acl_identity_args(&AccessControlProfile::default()).len(), placeholders);
        assert_eq!(
            accesser_attributes(&Accesser::default()).len(),
            SELECT_ACCESSER_BY_ALL.matches('?').count()
        );
    }
}
