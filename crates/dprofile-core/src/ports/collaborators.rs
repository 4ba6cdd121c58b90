//! Ports for external collaborators
//!
//! - [`IDeviceManager`] learns about new ACLs.
//! - [`INonOhSyncAdapter`] synchronizes with peers that do not run the
//!   native distributed stack. It is optional; without it those peers are
//!   reported as failed syncs.
//! - [`IStaticProfileSync`] synchronizes the static profile store.

use std::collections::HashMap;

use crate::domain::{BindType, SyncStatus};

/// Device manager callbacks
#[async_trait::async_trait]
pub trait IDeviceManager: Send + Sync {
    /// A new ACL was stored
    async fn on_acl_added(&self, access_control_id: i64, trust_device_id: &str, bind_type: BindType);
}

/// Sync adapter for non-OH peers
#[async_trait::async_trait]
pub trait INonOhSyncAdapter: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Profile protocol version spoken by the peer
    async fn detect_remote_version(&self, device_id: &str) -> anyhow::Result<i32>;

    /// Synchronizes with the given peers, returning the outcome per device
    async fn sync_profile(&self, device_ids: &[String]) -> anyhow::Result<HashMap<String, SyncStatus>>;

    async fn not_oh_base_device_online(
        &self,
        udid: &str,
        network_id: &str,
        is_p2p: bool,
    ) -> anyhow::Result<()>;

    /// Asks the adapter to repair profile differences described by `hint`
    async fn fix_diff_profiles(&self, hint: &str) -> anyhow::Result<()>;

    async fn release(&self) -> anyhow::Result<()>;
}

/// Static profile synchronization
#[async_trait::async_trait]
pub trait IStaticProfileSync: Send + Sync {
    async fn sync_static_profile(&self, network_id: &str) -> anyhow::Result<()>;
}
