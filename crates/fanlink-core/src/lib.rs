//! Fanlink Core - Device model, capability contract, bus contract and registry
//!
//! This crate provides the foundational types for the Fanlink gateway:
//! - Device and registry record types for owned appliances
//! - Id-set diffing used by every reconciliation pass
//! - The upstream device-management bus contract (topics, messages, client trait)
//! - The per-model capability contract and the compiled-in model catalogue
//! - The SQLite-backed persistent device registry

pub mod bus;
pub mod capability;
pub mod device;
pub mod diff;
pub mod pure_cool_link;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bus::{BusError, CommandEnvelope, Upstream};
pub use capability::{
    DeviceCapabilities, DeviceState, EventService, FrameKind, ModelCatalog, ServiceError,
};
pub use device::{
    ConnectionState, CredentialsError, Device, DeviceId, LocalCredentials, RegistryRecord,
};
pub use diff::IdDiff;
pub use pure_cool_link::PureCoolLink;
pub use registry::{DeviceRegistry, RegistryError};
#[cfg(any(test, feature = "testing"))]
pub use testing::MemoryBus;
