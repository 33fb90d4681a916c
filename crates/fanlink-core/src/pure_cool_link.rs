//! Pure Cool Link (model 475) capability set
//!
//! The cached state is the flattened `product-state` object of the last
//! CURRENT-STATE frame with every later STATE-CHANGE folded in. Vendor
//! values are short upper-case strings (`FAN`, `AUTO`, `ON`, `OFF`, `0004`).

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::capability::{
    DeviceCapabilities, DeviceState, EventService, GetService, ServiceError, SetService,
};

pub const MODEL_ID: &str = "475";

/// Filter lifetime in hours at 100%
const FILTER_HOURS: f64 = 4300.0;

/// Keys the device reports but rejects in a STATE-SET
const READ_ONLY_KEYS: [&str; 4] = ["filf", "fnst", "ercd", "wacd"];

/// Placeholder values sent while a sensor is warming up or disabled
const SENSOR_SENTINELS: [&str; 2] = ["OFF", "INIT"];
const SENSOR_KEYS: [&str; 4] = ["tact", "hact", "pact", "vact"];

#[derive(Debug, Clone, Copy, Default)]
pub struct PureCoolLink;

impl DeviceCapabilities for PureCoolLink {
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    fn device_type(&self) -> &str {
        "pure-cool-link"
    }

    fn discriminator(&self) -> &str {
        "msg"
    }

    fn state_types(&self) -> &[&'static str] {
        &["CURRENT-STATE", "STATE-CHANGE"]
    }

    fn telemetry_types(&self) -> &[&'static str] {
        &["ENVIRONMENTAL-CURRENT-SENSOR-DATA"]
    }

    fn set_service(&self, name: &str) -> Option<SetService> {
        match name {
            "setPower" => Some(set_power),
            "setOscillation" => Some(set_oscillation),
            "setSpeed" => Some(set_speed),
            "setMonitoring" => Some(set_monitoring),
            _ => None,
        }
    }

    fn get_service(&self, name: &str) -> Option<GetService> {
        match name {
            "getPower" => Some(get_power),
            "getOscillation" => Some(get_oscillation),
            "getSpeed" => Some(get_speed),
            "getMonitoring" => Some(get_monitoring),
            "getFilterLife" => Some(get_filter_life),
            _ => None,
        }
    }

    fn state_request(&self) -> Value {
        vendor_message("REQUEST-CURRENT-STATE")
    }

    fn telemetry_request(&self) -> Option<Value> {
        Some(vendor_message("REQUEST-PRODUCT-ENVIRONMENT-CURRENT-SENSOR-DATA"))
    }

    fn parse_state(&self, previous: &DeviceState, frame: &Value) -> Result<DeviceState, ServiceError> {
        let product_state = frame
            .get("product-state")
            .and_then(Value::as_object)
            .ok_or_else(|| ServiceError::MalformedFrame("missing product-state".to_string()))?;

        let mut state = previous.clone();
        for (key, value) in product_state {
            // STATE-CHANGE reports [old, new]
            let current = match value {
                Value::Array(pair) => pair.last().cloned().unwrap_or(Value::Null),
                other => other.clone(),
            };
            state.insert(key.clone(), current);
        }
        Ok(state)
    }

    fn state_event(&self) -> Option<EventService> {
        Some(EventService {
            name: "getDeviceState",
            transform: device_state_event,
        })
    }

    fn readings_event(&self) -> Option<EventService> {
        Some(EventService {
            name: "getSensorReadings",
            transform: sensor_readings_event,
        })
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn vendor_message(msg: &str) -> Value {
    json!({
        "msg": msg,
        "time": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    })
}

fn field<'a>(state: &'a DeviceState, key: &str) -> Result<&'a str, ServiceError> {
    state
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::MissingField(key.to_string()))
}

fn flag(state: &DeviceState, key: &str) -> Result<bool, ServiceError> {
    match field(state, key)? {
        "FAN" | "AUTO" | "ON" => Ok(true),
        "OFF" => Ok(false),
        other => Err(ServiceError::UnexpectedValue {
            field: key.to_string(),
            value: other.to_string(),
        }),
    }
}

fn speed(state: &DeviceState) -> Result<i64, ServiceError> {
    let raw = field(state, "fnsp")?;
    if raw == "AUTO" {
        return Ok(0);
    }
    raw.parse().map_err(|_| ServiceError::UnexpectedValue {
        field: "fnsp".to_string(),
        value: raw.to_string(),
    })
}

fn filter_life(state: &DeviceState) -> Result<f64, ServiceError> {
    let raw = field(state, "filf")?;
    let hours: f64 = raw.parse().map_err(|_| ServiceError::UnexpectedValue {
        field: "filf".to_string(),
        value: raw.to_string(),
    })?;
    Ok((hours / FILTER_HOURS * 100.0 * 100.0).round() / 100.0)
}

fn bool_arg(args: &Value, name: &str) -> Result<bool, ServiceError> {
    args.get(name)
        .and_then(Value::as_bool)
        .ok_or_else(|| ServiceError::InvalidArguments(format!("expected boolean '{}'", name)))
}

/// STATE-SET message carrying a copy of the cached state with one change applied
fn state_set_message(state: &DeviceState, key: &str, value: String) -> Value {
    let mut data = state.clone();
    for read_only in READ_ONLY_KEYS {
        data.remove(read_only);
    }
    data.insert(key.to_string(), Value::String(value));
    data.insert("sltm".to_string(), Value::String("STET".to_string()));
    data.insert("rstf".to_string(), Value::String("STET".to_string()));

    let mut msg = vendor_message("STATE-SET");
    msg["mode-reason"] = Value::String("LAPP".to_string());
    msg["data"] = Value::Object(data);
    msg
}

fn on_off(enabled: bool) -> String {
    let value = if enabled { "ON" } else { "OFF" };
    value.to_string()
}

fn set_power(state: &DeviceState, args: &Value) -> Result<Value, ServiceError> {
    let power = bool_arg(args, "power")?;
    let mode = if power { "FAN" } else { "OFF" };
    Ok(state_set_message(state, "fmod", mode.to_string()))
}

fn set_oscillation(state: &DeviceState, args: &Value) -> Result<Value, ServiceError> {
    let oscillation = bool_arg(args, "oscillation")?;
    Ok(state_set_message(state, "oson", on_off(oscillation)))
}

fn set_speed(state: &DeviceState, args: &Value) -> Result<Value, ServiceError> {
    let speed = args
        .get("speed")
        .and_then(Value::as_i64)
        .ok_or_else(|| ServiceError::InvalidArguments("expected integer 'speed'".to_string()))?;
    if speed < 0 {
        return Err(ServiceError::InvalidArguments(format!("speed {} out of range", speed)));
    }
    Ok(state_set_message(state, "fnsp", format!("{:04}", speed)))
}

fn set_monitoring(state: &DeviceState, args: &Value) -> Result<Value, ServiceError> {
    let monitoring = bool_arg(args, "monitoring")?;
    Ok(state_set_message(state, "rhtm", on_off(monitoring)))
}

fn get_power(state: &DeviceState, _args: &Value) -> Result<Value, ServiceError> {
    Ok(json!({ "power": flag(state, "fmod")?, "time": timestamp() }))
}

fn get_oscillation(state: &DeviceState, _args: &Value) -> Result<Value, ServiceError> {
    Ok(json!({ "oscillation": flag(state, "oson")?, "time": timestamp() }))
}

fn get_speed(state: &DeviceState, _args: &Value) -> Result<Value, ServiceError> {
    Ok(json!({ "speed": speed(state)?, "time": timestamp() }))
}

fn get_monitoring(state: &DeviceState, _args: &Value) -> Result<Value, ServiceError> {
    Ok(json!({ "monitoring": flag(state, "rhtm")?, "time": timestamp() }))
}

fn get_filter_life(state: &DeviceState, _args: &Value) -> Result<Value, ServiceError> {
    Ok(json!({ "filter_life": filter_life(state)?, "time": timestamp() }))
}

fn device_state_event(state: &Value) -> Result<Value, ServiceError> {
    let state = state
        .as_object()
        .ok_or_else(|| ServiceError::MalformedFrame("cached state is not an object".to_string()))?;
    Ok(json!({
        "power": flag(state, "fmod")?,
        "oscillation": flag(state, "oson")?,
        "speed": speed(state)?,
        "monitoring": flag(state, "rhtm")?,
        "filter_life": filter_life(state)?,
        "time": timestamp(),
    }))
}

/// Integer sensor value, `None` for a sentinel
fn reading(data: &DeviceState, key: &str) -> Result<Option<i64>, ServiceError> {
    let raw = match data.get(key).and_then(Value::as_str) {
        Some(raw) => raw,
        None => return Ok(None),
    };
    if SENSOR_SENTINELS.contains(&raw) {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|_| ServiceError::UnexpectedValue {
        field: key.to_string(),
        value: raw.to_string(),
    })
}

fn sensor_readings_event(frame: &Value) -> Result<Value, ServiceError> {
    let data = frame
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| ServiceError::MalformedFrame("missing sensor data".to_string()))?;

    let all_sentinel = SENSOR_KEYS.iter().all(|key| {
        data.get(*key)
            .and_then(Value::as_str)
            .map(|s| SENSOR_SENTINELS.contains(&s))
            .unwrap_or(true)
    });
    if all_sentinel {
        return Err(ServiceError::NotReady);
    }

    Ok(json!({
        "temperature": reading(data, "tact")?.map(|t| t as f64 / 10.0),
        "humidity": reading(data, "hact")?,
        "particles": reading(data, "pact")?,
        "volatile_components": reading(data, "vact")?,
        "time": timestamp(),
    }))
}
