//! Non-OH sync adapter slot
//!
//! The adapter is optional. When one is provided it is initialized on first
//! use and cached; if initialization fails the slot degrades to unavailable
//! and every later caller treats non-OH peers as unreachable.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use dprofile_core::domain::ProfileError;
use dprofile_core::ports::INonOhSyncAdapter;

/// How the engine gets hold of a sync adapter
#[derive(Clone, Default)]
pub enum SyncAdapterSource {
    /// No adapter is installed on this device
    #[default]
    Unavailable,
    /// An adapter that still needs `initialize()`
    Provided(Arc<dyn INonOhSyncAdapter>),
}

enum SlotState {
    Unloaded(Arc<dyn INonOhSyncAdapter>),
    Loaded(Arc<dyn INonOhSyncAdapter>),
    Unavailable,
}

/// Lazily initialized adapter
pub struct SyncAdapterSlot {
    state: Mutex<SlotState>,
}

impl SyncAdapterSlot {
    pub fn new(source: SyncAdapterSource) -> Self {
        let state = match source {
            SyncAdapterSource::Unavailable => SlotState::Unavailable,
            SyncAdapterSource::Provided(adapter) => SlotState::Unloaded(adapter),
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Returns the initialized adapter, initializing it on first use
    pub async fn load(&self) -> Result<Arc<dyn INonOhSyncAdapter>, ProfileError> {
        let mut state = self.state.lock().await;
        let adapter = match &*state {
            SlotState::Loaded(adapter) => return Ok(Arc::clone(adapter)),
            SlotState::Unavailable => {
                return Err(ProfileError::AdapterUnavailable(
                    "no sync adapter installed".to_string(),
                ))
            }
            SlotState::Unloaded(adapter) => Arc::clone(adapter),
        };

        match adapter.initialize().await {
            Ok(()) => {
                info!("Sync adapter loaded");
                *state = SlotState::Loaded(Arc::clone(&adapter));
                Ok(adapter)
            }
            Err(e) => {
                warn!(error = %e, "Sync adapter failed to initialize, non-OH sync disabled");
                *state = SlotState::Unavailable;
                Err(ProfileError::AdapterUnavailable(e.to_string()))
            }
        }
    }

    pub async fn is_loaded(&self) -> bool {
        matches!(&*self.state.lock().await, SlotState::Loaded(_))
    }

    /// Releases a loaded adapter; the next `load` initializes it again
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if let SlotState::Loaded(adapter) = &*state {
            let adapter = Arc::clone(adapter);
            if let Err(e) = adapter.release().await {
                warn!(error = %e, "Sync adapter release failed");
            }
            *state = SlotState::Unloaded(adapter);
            info!("Sync adapter released");
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dprofile_core::domain::SyncStatus;

    use super::*;

    struct CountingAdapter {
        inits: AtomicUsize,
        fail: bool,
    }

    impl CountingAdapter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                inits: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait::async_trait]
    impl INonOhSyncAdapter for CountingAdapter {
        async fn initialize(&self) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("library missing");
            }
            Ok(())
        }

        async fn detect_remote_version(&self, _device_id: &str) -> anyhow::Result<i32> {
            Ok(1)
        }

        async fn sync_profile(
            &self,
            device_ids: &[String],
        ) -> anyhow::Result<HashMap<String, SyncStatus>> {
            Ok(device_ids
                .iter()
                .map(|id| (id.clone(), SyncStatus::Succeeded))
                .collect())
        }

        async fn not_oh_base_device_online(
            &self,
            _udid: &str,
            _network_id: &str,
            _is_p2p: bool,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn fix_diff_profiles(&self, _hint: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn release(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_initializes_once() {
        let adapter = CountingAdapter::new(false);
        let slot = SyncAdapterSlot::new(SyncAdapterSource::Provided(adapter.clone()));

        assert!(!slot.is_loaded().await);
        slot.load().await.unwrap();
        slot.load().await.unwrap();
        assert!(slot.is_loaded().await);
        assert_eq!(adapter.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_init_degrades() {
        let adapter = CountingAdapter::new(true);
        let slot = SyncAdapterSlot::new(SyncAdapterSource::Provided(adapter.clone()));

        assert!(matches!(
            slot.load().await,
            Err(ProfileError::AdapterUnavailable(_))
        ));
        assert!(slot.load().await.is_err());
        // No second attempt after degrading
        assert_eq!(adapter.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_adapter_is_unavailable() {
        let slot = SyncAdapterSlot::new(SyncAdapterSource::Unavailable);
        assert!(matches!(
            slot.load().await,
            Err(ProfileError::AdapterUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_release_allows_reload() {
        let adapter = CountingAdapter::new(false);
        let slot = SyncAdapterSlot::new(SyncAdapterSource::Provided(adapter.clone()));
        slot.load().await.unwrap();
        slot.release().await;
        assert!(!slot.is_loaded().await);
        slot.load().await.unwrap();
        assert_eq!(adapter.inits.load(Ordering::SeqCst), 2);
    }
}
