//! Subscription registry port
//!
//! Receives canonical trust and profile change events and fans them out to
//! interested listeners. Delivery is best effort; the registry reports
//! failures with `anyhow` because they are listener-specific.

use crate::domain::{ChangeType, ProfileType, TrustDeviceProfile};

#[async_trait::async_trait]
pub trait ISubscriptionRegistry: Send + Sync {
    /// A peer gained its first trust relationship
    async fn notify_trust_device_profile_add(&self, profile: &TrustDeviceProfile)
        -> anyhow::Result<()>;

    /// A peer's aggregate trust status changed
    async fn notify_trust_device_profile_update(
        &self,
        old_profile: &TrustDeviceProfile,
        new_profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()>;

    /// A peer lost its last trust relationship
    async fn notify_trust_device_profile_delete(
        &self,
        profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()>;

    /// A peer+user relationship became active
    async fn notify_trust_device_profile_active(
        &self,
        profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()>;

    /// A peer+user relationship lost its last active ACL
    async fn notify_trust_device_profile_inactive(
        &self,
        profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()>;

    /// A dynamic profile entry changed
    async fn notify_profile_change(
        &self,
        profile_type: ProfileType,
        change_type: ChangeType,
        key: &str,
        value: &str,
    ) -> anyhow::Result<()>;
}
