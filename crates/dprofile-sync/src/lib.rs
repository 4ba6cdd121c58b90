//! Device profile reconciliation
//!
//! Provides:
//! - The reconciliation engine that writes, reads and repairs the flattened
//!   dynamic profiles held in the replicated KV store
//! - Startup write buffering until the local data collection is complete
//! - A single-worker queue for background reconciliation
//! - The change listener that turns raw KV changes into profile events
//! - An in-process subscription registry
//!
//! ## Modules
//!
//! - [`engine`] - [`DeviceProfileManager`], the reconciliation engine
//! - [`put_cache`] - Actor owning the startup write buffer
//! - [`queue`] - Background task queue
//! - [`adapter`] - Lazily initialized slot for the non-OH sync adapter
//! - [`cache`] - In-memory profile cache and online device table
//! - [`listener`] - [`KvDataChangeListener`]
//! - [`registry`] - [`SubscribeProfileManager`]

pub mod adapter;
pub mod cache;
pub mod engine;
pub mod listener;
pub mod put_cache;
pub mod queue;
pub mod registry;

pub use adapter::SyncAdapterSource;
pub use engine::DeviceProfileManager;
pub use listener::KvDataChangeListener;
pub use registry::SubscribeProfileManager;
