//! Persisted enumerations
//!
//! The numeric values are stored in the relational tables and exchanged with
//! peers, so they are fixed. Enums whose value space is open (bind type,
//! bind level, authentication type, device id type) keep unknown values in an
//! `Other` variant instead of rejecting them.

use serde::{Deserialize, Serialize};

/// Generates `From<u32>`/`Into<u32>` for an open numeric enum
macro_rules! open_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                match value {
                    $($value => $name::$variant,)+
                    other => $name::Other(other),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> Self {
                match value {
                    $($name::$variant => $value,)+
                    $name::Other(other) => other,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::Other(0)
            }
        }

        impl $name {
            /// Numeric value as persisted
            pub fn as_u32(self) -> u32 {
                u32::from(self)
            }
        }
    };
}

/// How two identities are associated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum BindType {
    SameAccount,
    Share,
    SameGroup,
    PointToPoint,
    Compatible,
    DiffAccount,
    Other(u32),
}

open_enum!(BindType {
    SameAccount = 1,
    Share = 2,
    SameGroup = 3,
    PointToPoint = 256,
    Compatible = 512,
    DiffAccount = 1282,
});

/// Granularity of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum BindLevel {
    User,
    Service,
    App,
    Other(u32),
}

open_enum!(BindLevel {
    User = 1,
    Service = 2,
    App = 3,
});

/// How the binding was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum AuthenticationType {
    Temporary,
    Permanent,
    Other(u32),
}

open_enum!(AuthenticationType {
    Temporary = 1,
    Permanent = 2,
});

/// Kind of identifier stored in `deviceIdHash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum DeviceIdType {
    Udid,
    Uuid,
    Sn,
    Other(u32),
}

open_enum!(DeviceIdType {
    Udid = 1,
    Uuid = 2,
    Sn = 3,
});

/// Activation status of an ACL, accesser, accessee or trust device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Status {
    #[default]
    Inactive,
    Active,
}

impl From<i32> for Status {
    fn from(value: i32) -> Self {
        if value == 1 {
            Status::Active
        } else {
            Status::Inactive
        }
    }
}

impl From<Status> for i32 {
    fn from(value: Status) -> Self {
        match value {
            Status::Inactive => 0,
            Status::Active => 1,
        }
    }
}

impl Status {
    /// Numeric value as persisted
    pub fn as_i32(self) -> i32 {
        i32::from(self)
    }
}

/// Which predicate family a [`QueryProfile`](super::QueryProfile) drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Both accesser and accessee identities are known
    AcerAndAceeTokenId,
    /// Only the accesser identity is known
    AcerTokenId,
}

/// Direction of a KV synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Pull,
    Push,
    PushPull,
}

impl SyncMode {
    pub fn pushes(self) -> bool {
        matches!(self, SyncMode::Push | SyncMode::PushPull)
    }

    pub fn pulls(self) -> bool {
        matches!(self, SyncMode::Pull | SyncMode::PushPull)
    }
}

impl TryFrom<i32> for SyncMode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncMode::Pull),
            1 => Ok(SyncMode::Push),
            2 => Ok(SyncMode::PushPull),
            other => Err(format!("unknown sync mode {}", other)),
        }
    }
}

/// Per-device outcome of a synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Succeeded,
    Failed,
}

/// Kind of profile a change notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileType {
    TrustDevice,
    Acl,
    Device,
    Service,
    Characteristic,
}

impl ProfileType {
    pub fn as_u32(self) -> u32 {
        match self {
            ProfileType::TrustDevice => 0x10,
            ProfileType::Acl => 0x20,
            ProfileType::Device => 0x30,
            ProfileType::Service => 0x40,
            ProfileType::Characteristic => 0x50,
        }
    }
}

/// Kind of change delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Add,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_u32(self) -> u32 {
        match self {
            ChangeType::Add => 1,
            ChangeType::Update => 2,
            ChangeType::Delete => 3,
        }
    }
}

/// Authentication form of an online peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthForm {
    #[default]
    Invalid,
    PeerToPeer,
    IdenticalAccount,
    AcrossAccount,
}

impl From<i32> for AuthForm {
    fn from(value: i32) -> Self {
        match value {
            0 => AuthForm::PeerToPeer,
            1 => AuthForm::IdenticalAccount,
            2 => AuthForm::AcrossAccount,
            _ => AuthForm::Invalid,
        }
    }
}

impl From<AuthForm> for i32 {
    fn from(value: AuthForm) -> Self {
        match value {
            AuthForm::Invalid => -1,
            AuthForm::PeerToPeer => 0,
            AuthForm::IdenticalAccount => 1,
            AuthForm::AcrossAccount => 2,
        }
    }
}
