//! In-process subscription registry
//!
//! Listeners subscribe with a key prefix and the change types they care
//! about and receive matching [`ProfileEvent`]s on a bounded channel.
//! Delivery never blocks the notifier: a full channel drops the event for
//! that subscriber, and a closed channel removes the subscriber.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dprofile_core::domain::{anonymize, ChangeType, ProfileError, ProfileType, TrustDeviceProfile};
use dprofile_core::ports::ISubscriptionRegistry;

/// Change types a subscriber can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileChangeType {
    TrustDeviceProfileAdd,
    TrustDeviceProfileUpdate,
    TrustDeviceProfileDelete,
    TrustDeviceProfileActive,
    TrustDeviceProfileInactive,
    DeviceProfileAdd,
    DeviceProfileUpdate,
    DeviceProfileDelete,
    ServiceProfileAdd,
    ServiceProfileUpdate,
    ServiceProfileDelete,
    CharProfileAdd,
    CharProfileUpdate,
    CharProfileDelete,
}

impl ProfileChangeType {
    /// Subscription type of a dynamic profile change; `None` for trust and ACL types
    pub fn for_profile(profile_type: ProfileType, change_type: ChangeType) -> Option<Self> {
        use ProfileChangeType::*;
        Some(match (profile_type, change_type) {
            (ProfileType::Device, ChangeType::Add) => DeviceProfileAdd,
            (ProfileType::Device, ChangeType::Update) => DeviceProfileUpdate,
            (ProfileType::Device, ChangeType::Delete) => DeviceProfileDelete,
            (ProfileType::Service, ChangeType::Add) => ServiceProfileAdd,
            (ProfileType::Service, ChangeType::Update) => ServiceProfileUpdate,
            (ProfileType::Service, ChangeType::Delete) => ServiceProfileDelete,
            (ProfileType::Characteristic, ChangeType::Add) => CharProfileAdd,
            (ProfileType::Characteristic, ChangeType::Update) => CharProfileUpdate,
            (ProfileType::Characteristic, ChangeType::Delete) => CharProfileDelete,
            (ProfileType::TrustDevice | ProfileType::Acl, _) => return None,
        })
    }
}

/// An event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileEvent {
    TrustDeviceAdded(TrustDeviceProfile),
    TrustDeviceUpdated {
        old: TrustDeviceProfile,
        new: TrustDeviceProfile,
    },
    TrustDeviceDeleted(TrustDeviceProfile),
    TrustDeviceActive(TrustDeviceProfile),
    TrustDeviceInactive(TrustDeviceProfile),
    ProfileChanged {
        profile_type: ProfileType,
        change_type: ChangeType,
        key: String,
        value: String,
    },
}

/// What a subscriber listens for
#[derive(Debug, Clone)]
pub struct SubscribeInfo {
    /// Profile keys and trust device ids are matched against this prefix;
    /// an empty prefix matches everything
    pub key_prefix: String,
    pub change_types: HashSet<ProfileChangeType>,
}

struct Subscriber {
    info: SubscribeInfo,
    sender: mpsc::Sender<ProfileEvent>,
}

pub struct SubscribeProfileManager {
    subscribers: DashMap<Uuid, Subscriber>,
    channel_capacity: usize,
}

impl SubscribeProfileManager {
    /// # Arguments
    /// * `channel_capacity` - Events buffered per subscriber before drops
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn subscribe(
        &self,
        info: SubscribeInfo,
    ) -> Result<(Uuid, mpsc::Receiver<ProfileEvent>), ProfileError> {
        if info.change_types.is_empty() {
            return Err(ProfileError::InvalidParams(
                "subscription needs at least one change type".to_string(),
            ));
        }
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        info!(subscriber = %id, prefix = %info.key_prefix, "Subscriber added");
        self.subscribers.insert(id, Subscriber { info, sender });
        Ok((id, receiver))
    }

    pub fn unsubscribe(&self, id: &Uuid) -> Result<(), ProfileError> {
        self.subscribers
            .remove(id)
            .map(|_| info!(subscriber = %id, "Subscriber removed"))
            .ok_or_else(|| ProfileError::NotFound(format!("subscriber {id}")))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn dispatch(&self, change_type: ProfileChangeType, subject: &str, event: ProfileEvent) {
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.info.change_types.contains(&change_type)
                || !subject.starts_with(&subscriber.info.key_prefix)
            {
                continue;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %entry.key(), ?change_type, "Subscriber channel full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removed after iterating; DashMap shards are locked during iter()
        for id in closed {
            debug!(subscriber = %id, "Removing closed subscriber");
            self.subscribers.remove(&id);
        }
    }

    fn dispatch_trust(&self, change_type: ProfileChangeType, profile: &TrustDeviceProfile, event: ProfileEvent) {
        debug!(device = %anonymize(&profile.device_id), ?change_type, "Trust event");
        self.dispatch(change_type, &profile.device_id, event);
    }
}

impl Default for SubscribeProfileManager {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait::async_trait]
impl ISubscriptionRegistry for SubscribeProfileManager {
    async fn notify_trust_device_profile_add(
        &self,
        profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()> {
        self.dispatch_trust(
            ProfileChangeType::TrustDeviceProfileAdd,
            profile,
            ProfileEvent::TrustDeviceAdded(profile.clone()),
        );
        Ok(())
    }

    async fn notify_trust_device_profile_update(
        &self,
        old_profile: &TrustDeviceProfile,
        new_profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()> {
        self.dispatch_trust(
            ProfileChangeType::TrustDeviceProfileUpdate,
            new_profile,
            ProfileEvent::TrustDeviceUpdated {
                old: old_profile.clone(),
                new: new_profile.clone(),
            },
        );
        Ok(())
    }

    async fn notify_trust_device_profile_delete(
        &self,
        profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()> {
        self.dispatch_trust(
            ProfileChangeType::TrustDeviceProfileDelete,
            profile,
            ProfileEvent::TrustDeviceDeleted(profile.clone()),
        );
        Ok(())
    }

    async fn notify_trust_device_profile_active(
        &self,
        profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()> {
        self.dispatch_trust(
            ProfileChangeType::TrustDeviceProfileActive,
            profile,
            ProfileEvent::TrustDeviceActive(profile.clone()),
        );
        Ok(())
    }

    async fn notify_trust_device_profile_inactive(
        &self,
        profile: &TrustDeviceProfile,
    ) -> anyhow::Result<()> {
        self.dispatch_trust(
            ProfileChangeType::TrustDeviceProfileInactive,
            profile,
            ProfileEvent::TrustDeviceInactive(profile.clone()),
        );
        Ok(())
    }

    async fn notify_profile_change(
        &self,
        profile_type: ProfileType,
        change_type: ChangeType,
        key: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let Some(subscription_type) = ProfileChangeType::for_profile(profile_type, change_type)
        else {
            anyhow::bail!("{profile_type:?} is not a dynamic profile type");
        };
        self.dispatch(
            subscription_type,
            key,
            ProfileEvent::ProfileChanged {
                profile_type,
                change_type,
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn info(prefix: &str, types: &[ProfileChangeType]) -> SubscribeInfo {
        SubscribeInfo {
            key_prefix: prefix.to_string(),
            change_types: types.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn test_profile_change_filtered_by_prefix_and_type() {
        let registry = SubscribeProfileManager::new(8);
        let (_, mut matching) = registry
            .subscribe(info("svr#peer#", &[ProfileChangeType::ServiceProfileAdd]))
            .unwrap();
        let (_, mut other_type) = registry
            .subscribe(info("svr#peer#", &[ProfileChangeType::ServiceProfileDelete]))
            .unwrap();

        registry
            .notify_profile_change(ProfileType::Service, ChangeType::Add, "svr#peer#cam#serviceType", "media")
            .await
            .unwrap();
        registry
            .notify_profile_change(ProfileType::Service, ChangeType::Add, "svr#other#cam#serviceType", "media")
            .await
            .unwrap();

        let event = matching.try_recv().unwrap();
        assert_eq!(
            event,
            ProfileEvent::ProfileChanged {
                profile_type: ProfileType::Service,
                change_type: ChangeType::Add,
                key: "svr#peer#cam#serviceType".into(),
                value: "media".into(),
            }
        );
        assert!(matching.try_recv().is_err());
        assert!(other_type.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trust_events_match_device_id() {
        let registry = SubscribeProfileManager::new(8);
        let (_, mut rx) = registry
            .subscribe(info("peer", &[ProfileChangeType::TrustDeviceProfileInactive]))
            .unwrap();
        let profile = TrustDeviceProfile {
            device_id: "peer-udid".into(),
            ..Default::default()
        };

        registry.notify_trust_device_profile_add(&profile).await.unwrap();
        registry.notify_trust_device_profile_inactive(&profile).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), ProfileEvent::TrustDeviceInactive(profile));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let registry = SubscribeProfileManager::new(8);
        let (_, rx) = registry
            .subscribe(info("", &[ProfileChangeType::DeviceProfileUpdate]))
            .unwrap();
        drop(rx);

        registry
            .notify_profile_change(ProfileType::Device, ChangeType::Update, "dev#a#osType", "10")
            .await
            .unwrap();
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_event() {
        let registry = SubscribeProfileManager::new(1);
        let (_, mut rx) = registry
            .subscribe(info("", &[ProfileChangeType::DeviceProfileAdd]))
            .unwrap();
        for value in ["1", "2"] {
            registry
                .notify_profile_change(ProfileType::Device, ChangeType::Add, "dev#a#osType", value)
                .await
                .unwrap();
        }

        assert!(matches!(
            rx.try_recv().unwrap(),
            ProfileEvent::ProfileChanged { value, .. } if value == "1"
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.subscriber_count(), 1);
    }

    #[test]
    fn test_subscribe_validation_and_unsubscribe() {
        let registry = SubscribeProfileManager::default();
        assert!(matches!(
            registry.subscribe(info("", &[])),
            Err(ProfileError::InvalidParams(_))
        ));

        let (id, _rx) = registry
            .subscribe(info("", &[ProfileChangeType::CharProfileAdd]))
            .unwrap();
        registry.unsubscribe(&id).unwrap();
        assert!(registry.unsubscribe(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_change_type_mapping() {
        assert_eq!(
            ProfileChangeType::for_profile(ProfileType::Characteristic, ChangeType::Delete),
            Some(ProfileChangeType::CharProfileDelete)
        );
        assert_eq!(ProfileChangeType::for_profile(ProfileType::Acl, ChangeType::Add), None);
    }
}
