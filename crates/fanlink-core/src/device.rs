//! Device types for tracking owned appliances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a device, derived from the vendor serial with a fixed prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Build an id from a vendor serial number
    pub fn from_serial(prefix: &str, serial: &str) -> Self {
        Self(format!("{}{}", prefix, serial))
    }

    /// Serial suffix of this id (the id itself when the prefix is absent)
    pub fn serial<'a>(&'a self, prefix: &str) -> &'a str {
        self.0.strip_prefix(prefix).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection state as announced on the upstream bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Offline
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Malformed local credentials: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Username/password pair a device accepts on its local broker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalCredentials {
    pub serial: String,
    #[serde(rename = "apPasswordHash")]
    pub password_hash: String,
}

impl LocalCredentials {
    /// Parse the opaque credential blob handed out by the cloud
    pub fn parse(blob: &str) -> Result<Self, CredentialsError> {
        Ok(serde_json::from_str(blob)?)
    }
}

/// An owned appliance known to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device identifier
    pub id: DeviceId,
    /// Human-readable name (user-assigned in the vendor app)
    pub name: String,
    /// Vendor model id, selects the capability set
    pub model_id: String,
    /// Opaque credential blob for the local session
    #[serde(skip_serializing)]
    pub local_credentials: String,
    /// Current connection state, written only by the owning session
    pub state: ConnectionState,
}

impl Device {
    /// Create a new device; devices always start offline
    pub fn new(id: DeviceId, name: String, model_id: String, local_credentials: String) -> Self {
        Self {
            id,
            name,
            model_id,
            local_credentials,
            state: ConnectionState::Offline,
        }
    }

    pub fn from_record(record: &RegistryRecord) -> Self {
        Self::new(
            record.id.clone(),
            record.name.clone(),
            record.model.clone(),
            record.local_credentials.clone(),
        )
    }

    pub fn is_online(&self) -> bool {
        self.state == ConnectionState::Online
    }
}

/// Durable mirror of a device, minus the volatile connection state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub id: DeviceId,
    pub name: String,
    pub model: String,
    pub local_credentials: String,
    /// When the cloud inventory last listed this device
    pub last_seen: DateTime<Utc>,
}

impl RegistryRecord {
    /// Seconds elapsed since the cloud last listed this device
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen).num_seconds()
    }

    /// Whether the grace period for a device missing from the cloud has run out
    pub fn grace_expired(&self, now: DateTime<Utc>, grace_secs: i64) -> bool {
        self.age_secs(now) > grace_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_device_id_from_serial() {
        let id = DeviceId::from_serial("dyson-", "NN2-EU-KEA1234A");
        assert_eq!(id.as_str(), "dyson-NN2-EU-KEA1234A");
        assert_eq!(id.serial("dyson-"), "NN2-EU-KEA1234A");
    }

    #[test]
    fn test_serial_without_prefix() {
        let id = DeviceId::from("NN2-EU-KEA1234A");
        assert_eq!(id.serial("dyson-"), "NN2-EU-KEA1234A");
    }

    #[test]
    fn test_device_starts_offline() {
        let device = Device::new(
            DeviceId::from("d1"),
            "Living Room".to_string(),
            "475".to_string(),
            "{}".to_string(),
        );
        assert_eq!(device.state, ConnectionState::Offline);
        assert!(!device.is_online());
    }

    #[test]
    fn test_local_credentials() {
        let creds =
            LocalCredentials::parse(r#"{"serial":"NN2-EU-KEA1234A","apPasswordHash":"abc=="}"#)
                .unwrap();
        assert_eq!(creds.serial, "NN2-EU-KEA1234A");
        assert_eq!(creds.password_hash, "abc==");
        assert!(LocalCredentials::parse("not json").is_err());
    }

    #[test]
    fn test_grace_expiry() {
        let now = Utc::now();
        let record = RegistryRecord {
            id: DeviceId::from("d1"),
            name: "fan".to_string(),
            model: "475".to_string(),
            local_credentials: "{}".to_string(),
            last_seen: now - Duration::hours(25),
        };
        assert!(record.grace_expired(now, 24 * 3600));
        assert!(!record.grace_expired(now, 26 * 3600));
    }
}
