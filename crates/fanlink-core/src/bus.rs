//! Upstream device-management bus contract
//!
//! Topics and message shapes follow the device-connector conventions of the
//! gateway host:
//! - `device-manager/device/{client_id}` carries device set/delete announcements
//! - `command/{device_id}/{service}` carries inbound commands
//! - `response/{device_id}/{service}` carries correlated command replies
//! - `event/{device_id}/{service}` carries pushed state and readings

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::device::{Device, DeviceId};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Publish to {0} failed: {1}")]
    Publish(String, String),
    #[error("Subscription change for {0} failed: {1}")]
    Subscription(String, String),
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Client side of the upstream bus
///
/// Every publish is QoS 1; implementations decide how to queue while offline.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
}

pub fn device_topic(client_id: &str) -> String {
    format!("device-manager/device/{}", client_id)
}

/// Wildcard subscription covering every service of one device
pub fn command_topic(device_id: &DeviceId) -> String {
    format!("command/{}/+", device_id)
}

pub fn response_topic(device_id: &DeviceId, service: &str) -> String {
    format!("response/{}/{}", device_id, service)
}

pub fn event_topic(device_id: &DeviceId, service: &str) -> String {
    format!("event/{}/{}", device_id, service)
}

/// Split an inbound `command/{device_id}/{service}` topic
pub fn parse_command_topic(topic: &str) -> Option<(DeviceId, String)> {
    let rest = topic.strip_prefix("command/")?;
    let (device_id, service) = rest.rsplit_once('/')?;
    if device_id.is_empty() || service.is_empty() {
        return None;
    }
    Some((DeviceId::from(device_id), service.to_string()))
}

/// Announcement that a device exists (or changed name/state)
pub fn set_device_message(device: &Device, device_type: &str) -> String {
    json!({
        "method": "set",
        "device_id": device.id,
        "data": {
            "name": device.name,
            "state": device.state,
            "device_type": device_type,
        }
    })
    .to_string()
}

pub fn delete_device_message(device_id: &DeviceId) -> String {
    json!({
        "method": "delete",
        "device_id": device_id,
    })
    .to_string()
}

/// Inbound command envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Correlation id echoed back in the response
    pub command_id: String,
    /// JSON-encoded service arguments
    #[serde(default)]
    pub data: Option<String>,
}

impl CommandEnvelope {
    pub fn parse(payload: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Decoded arguments; an absent or empty payload yields `Value::Null`
    pub fn arguments(&self) -> Result<Value, BusError> {
        match self.data.as_deref() {
            Some(data) if !data.trim().is_empty() => Ok(serde_json::from_str(data)?),
            _ => Ok(Value::Null),
        }
    }
}

/// Correlated reply to a command
pub fn response_message(command_id: &str, data: &str) -> String {
    json!({
        "command_id": command_id,
        "data": data,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionState;
    use crate::testing::MemoryBus;

    #[test]
    fn test_topics() {
        let id = DeviceId::from("dyson-ABC");
        assert_eq!(device_topic("dyson-dc"), "device-manager/device/dyson-dc");
        assert_eq!(command_topic(&id), "command/dyson-ABC/+");
        assert_eq!(response_topic(&id, "getPower"), "response/dyson-ABC/getPower");
        assert_eq!(event_topic(&id, "getDeviceState"), "event/dyson-ABC/getDeviceState");
    }

    #[test]
    fn test_parse_command_topic() {
        let (id, service) = parse_command_topic("command/dyson-ABC/setSpeed").unwrap();
        assert_eq!(id.as_str(), "dyson-ABC");
        assert_eq!(service, "setSpeed");
        assert!(parse_command_topic("event/dyson-ABC/setSpeed").is_none());
        assert!(parse_command_topic("command/setSpeed").is_none());
    }

    #[test]
    fn test_set_device_message() {
        let mut device = Device::new(
            DeviceId::from("dyson-ABC"),
            "Bedroom".to_string(),
            "475".to_string(),
            "{}".to_string(),
        );
        device.state = ConnectionState::Online;
        let msg: Value = serde_json::from_str(&set_device_message(&device, "urn:fan")).unwrap();
        assert_eq!(msg["method"], "set");
        assert_eq!(msg["device_id"], "dyson-ABC");
        assert_eq!(msg["data"]["name"], "Bedroom");
        assert_eq!(msg["data"]["state"], "online");
        assert_eq!(msg["data"]["device_type"], "urn:fan");
    }

    #[test]
    fn test_command_envelope_arguments() {
        let cmd = CommandEnvelope::parse(br#"{"command_id":"c1","data":"{\"speed\": 7}"}"#).unwrap();
        assert_eq!(cmd.command_id, "c1");
        assert_eq!(cmd.arguments().unwrap()["speed"], 7);

        let bare = CommandEnvelope::parse(br#"{"command_id":"c2"}"#).unwrap();
        assert_eq!(bare.arguments().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_memory_bus_failure_mode() {
        let bus = MemoryBus::new();
        bus.publish("a", "1".to_string()).await.unwrap();
        bus.set_fail_publish(true);
        assert!(bus.publish("a", "2".to_string()).await.is_err());
        assert_eq!(bus.published().len(), 1);
    }
}
