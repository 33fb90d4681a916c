//! Fanlink Session - Live connections to individual appliances
//!
//! Each pool-resident device gets one session. The session owns the vendor
//! MQTT link, serialises command execution, caches the last reported device
//! state and translates between vendor frames and upstream events.

pub mod command;
pub mod factory;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

use fanlink_core::{BusError, CredentialsError, Device, ServiceError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub use command::Command;
pub use factory::{MqttSessionFactory, SessionFactory, SessionHandle};
pub use session::{FrameOutcome, Session, SessionConfig, SessionState};
pub use transport::{LinkEvent, LinkEvents, LinkTarget, MqttLink, VendorLink};

/// Device record shared between the pool and its session
pub type SharedDevice = Arc<RwLock<Device>>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected to device")]
    NotConnected,
    #[error("No device state available")]
    NoDeviceState,
    #[error("Service '{0}' not supported")]
    UnsupportedService(String),
    #[error("Service failed: {0}")]
    Service(#[from] ServiceError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid local credentials: {0}")]
    Credentials(#[from] CredentialsError),
    #[error("Vendor link error: {0}")]
    Link(String),
    #[error("Device record is locked")]
    Busy,
    #[error("Session stopped")]
    Stopped,
}
