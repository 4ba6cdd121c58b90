//! Device Profile Trust - the trust and access-control ledger
//!
//! [`TrustProfileManager`] owns the four trust tables behind the
//! `IRelationalStore` port:
//!
//! - `trust_device_table` - one aggregate row per trusted peer device
//! - `accesser_table` / `accessee_table` - deduplicated identities shared by ACLs
//! - `access_control_table` - one row per trust grant
//!
//! Every mutation keeps the per-peer aggregate status consistent and emits
//! trust notifications through the `ISubscriptionRegistry` port.

pub mod manager;
pub mod mapping;

pub use manager::TrustProfileManager;
