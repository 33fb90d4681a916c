//! Model capability contract and the compiled-in model catalogue
//!
//! A capability set describes everything model-specific about a device:
//! - vendor topic layout (command and state topics)
//! - how inbound frames are classified (discriminator field and type sets)
//! - settable and queryable services as pure functions over the cached state
//! - state/telemetry request messages and the events pushed upstream
//!
//! Sessions and the discovery engine only see `dyn DeviceCapabilities`.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::pure_cool_link::PureCoolLink;

/// Flat key/value view of the last device state reported by the vendor
pub type DeviceState = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Field '{0}' missing from device state")]
    MissingField(String),
    #[error("Unexpected value '{value}' for '{field}'")]
    UnexpectedValue { field: String, value: String },
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    /// Telemetry frame carried only sentinel values
    #[error("Sensors not ready")]
    NotReady,
}

/// Builds the vendor wire message for a state change
pub type SetService = fn(&DeviceState, &Value) -> Result<Value, ServiceError>;

/// Builds a reply payload from the cached state
pub type GetService = fn(&DeviceState, &Value) -> Result<Value, ServiceError>;

/// Turns a cached state or a raw telemetry frame into an upstream event payload
pub type EventTransform = fn(&Value) -> Result<Value, ServiceError>;

/// Upstream event name paired with the transform producing its payload
#[derive(Clone, Copy)]
pub struct EventService {
    pub name: &'static str,
    pub transform: EventTransform,
}

impl std::fmt::Debug for EventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventService").field("name", &self.name).finish()
    }
}

/// Classification of an inbound vendor frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    State,
    Telemetry,
    Unknown(String),
}

/// Fixed operation set every supported model implements
pub trait DeviceCapabilities: Send + Sync {
    /// Vendor model id (the cloud's `ProductType`)
    fn model_id(&self) -> &str;

    /// Device type announced upstream unless overridden by configuration
    fn device_type(&self) -> &str;

    fn command_topic(&self, serial: &str) -> String {
        format!("{}/{}/command", self.model_id(), serial)
    }

    fn state_topic(&self, serial: &str) -> String {
        format!("{}/{}/status/current", self.model_id(), serial)
    }

    /// JSON field that carries the frame type
    fn discriminator(&self) -> &str;

    fn state_types(&self) -> &[&'static str];

    fn telemetry_types(&self) -> &[&'static str];

    fn set_service(&self, name: &str) -> Option<SetService>;

    fn get_service(&self, name: &str) -> Option<GetService>;

    fn state_request(&self) -> Value;

    /// Periodic telemetry request; `None` disables the telemetry worker
    fn telemetry_request(&self) -> Option<Value> {
        None
    }

    /// Fold a state frame into the previously cached state
    ///
    /// Models without a parser cache the frame object as-is.
    fn parse_state(&self, _previous: &DeviceState, frame: &Value) -> Result<DeviceState, ServiceError> {
        frame
            .as_object()
            .cloned()
            .ok_or_else(|| ServiceError::MalformedFrame("state frame is not an object".to_string()))
    }

    fn state_event(&self) -> Option<EventService> {
        None
    }

    fn readings_event(&self) -> Option<EventService> {
        None
    }

    fn classify(&self, frame: &Value) -> FrameKind {
        let kind = match frame.get(self.discriminator()).and_then(Value::as_str) {
            Some(kind) => kind,
            None => return FrameKind::Unknown(String::new()),
        };
        if self.state_types().contains(&kind) {
            FrameKind::State
        } else if self.telemetry_types().contains(&kind) {
            FrameKind::Telemetry
        } else {
            FrameKind::Unknown(kind.to_string())
        }
    }
}

/// Registry of supported models keyed by model id
#[derive(Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, Arc<dyn DeviceCapabilities>>,
    device_types: HashMap<String, String>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue with every model compiled into this build
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(PureCoolLink));
        catalog
    }

    pub fn register(&mut self, model: Arc<dyn DeviceCapabilities>) {
        self.models.insert(model.model_id().to_string(), model);
    }

    /// Override upstream device types per model id
    pub fn with_device_types(mut self, device_types: HashMap<String, String>) -> Self {
        self.device_types = device_types;
        self
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<dyn DeviceCapabilities>> {
        self.models.get(model_id).cloned()
    }

    pub fn supports(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn device_type(&self, model_id: &str) -> Option<String> {
        if let Some(device_type) = self.device_types.get(model_id) {
            return Some(device_type.clone());
        }
        self.models.get(model_id).map(|m| m.device_type().to_string())
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCatalog")
            .field("models", &self.model_ids())
            .field("device_types", &self.device_types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_catalog() {
        let catalog = ModelCatalog::builtin();
        assert!(catalog.supports("475"));
        assert!(!catalog.supports("999"));
        assert!(catalog.get("999").is_none());
        assert_eq!(catalog.model_ids(), vec!["475".to_string()]);
    }

    #[test]
    fn test_device_type_override() {
        let mut overrides = HashMap::new();
        overrides.insert("475".to_string(), "urn:infai:ses:device-type:custom".to_string());
        let catalog = ModelCatalog::builtin().with_device_types(overrides);
        assert_eq!(
            catalog.device_type("475").as_deref(),
            Some("urn:infai:ses:device-type:custom")
        );
        assert!(catalog.device_type("999").is_none());
    }

    #[test]
    fn test_topics_and_classification() {
        let model = ModelCatalog::builtin().get("475").unwrap();
        assert_eq!(model.command_topic("NN2-EU-KEA1234A"), "475/NN2-EU-KEA1234A/command");
        assert_eq!(
            model.state_topic("NN2-EU-KEA1234A"),
            "475/NN2-EU-KEA1234A/status/current"
        );

        assert_eq!(model.classify(&json!({"msg": "CURRENT-STATE"})), FrameKind::State);
        assert_eq!(model.classify(&json!({"msg": "STATE-CHANGE"})), FrameKind::State);
        assert_eq!(
            model.classify(&json!({"msg": "ENVIRONMENTAL-CURRENT-SENSOR-DATA"})),
            FrameKind::Telemetry
        );
        assert_eq!(
            model.classify(&json!({"msg": "HELLO"})),
            FrameKind::Unknown("HELLO".to_string())
        );
        assert_eq!(model.classify(&json!({"other": 1})), FrameKind::Unknown(String::new()));
    }
}
