//! Fanlink Discovery - Keeping the device pool in step with the cloud
//!
//! This crate provides:
//! - Cloud-to-registry reconciliation with a grace period for missing devices
//! - Registry-to-pool reconciliation that starts and stops device sessions
//! - LAN presence scanning (ping sweep, reverse DNS, broker port probe)

pub mod engine;
pub mod pool;
pub mod presence;

use fanlink_cloud::CloudError;
use fanlink_core::{BusError, DeviceId, RegistryError};
use fanlink_session::SessionError;
use thiserror::Error;

pub use engine::{DiscoveryEngine, EngineConfig, PassReport};
pub use pool::{DevicePool, PoolEntry};
pub use presence::{PresenceConfig, PresenceError, ProbeHit};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Presence scan failed: {0}")]
    Presence(#[from] PresenceError),
    #[error("Model '{0}' is not supported")]
    UnsupportedModel(String),
    #[error("Device {0} is not in the pool")]
    NotPooled(DeviceId),
}
