//! Device Profile Core - Domain model and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Trust model** - `Accesser`, `Accessee`, `AccessControlProfile`, `TrustDeviceProfile`, `QueryProfile`
//! - **Dynamic profiles** - `DeviceProfile`, `ServiceProfile`, `CharacteristicProfile`
//! - **Profile keys** - the structured `ProfileKey` used to flatten profiles into KV entries
//! - **Port definitions** - `IRelationalStore`, `IKvStore`, `ISubscriptionRegistry`,
//!   `IDeviceManager`, `INonOhSyncAdapter`, `IStaticProfileSync`
//!
//! # Architecture
//!
//! The domain module is pure data and predicates. Ports define the trait
//! interfaces that the ledger and the reconciliation engine depend on; the
//! SQLite adapters live in `dprofile-store`.

pub mod config;
pub mod domain;
pub mod ports;
