//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRelationalStore`] - Row-level access to the trust tables
//! - [`IKvStore`] - Replicated key-value store for dynamic profiles
//! - [`ISubscriptionRegistry`] - Fan-out of trust and profile change events
//! - [`IDeviceManager`] - Device manager callbacks
//! - [`INonOhSyncAdapter`] - Optional sync adapter for non-OH peers
//! - [`IStaticProfileSync`] - Static profile synchronization

pub mod collaborators;
pub mod kv_store;
pub mod relational_store;
pub mod subscription;

pub use collaborators::{IDeviceManager, INonOhSyncAdapter, IStaticProfileSync};
pub use kv_store::{IKvStore, KvChangeNotification, KvEntry};
pub use relational_store::{IRelationalStore, Row, Value, ValuesBucket};
pub use subscription::ISubscriptionRegistry;
