//! Configuration loading and validation

use anyhow::{bail, Result};
use fanlink_cloud::CloudConfig;
use fanlink_discovery::{EngineConfig, PresenceConfig};
use fanlink_session::SessionConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub start_delay: StartDelayConfig,
    /// Upstream device type per vendor model id
    #[serde(default)]
    pub device_types: HashMap<String, String>,
}

/// Upstream device-management broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_broker_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub clean_session: bool,
    /// Upper bound on waiting for room in the client's request queue
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_broker_keep_alive(),
            clean_session: false,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

fn default_broker_host() -> String {
    "message-broker".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "fanlink".to_string()
}

fn default_broker_keep_alive() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_cloud_url")]
    pub cloud_url: String,
    /// Cloud inventory refresh interval in seconds
    #[serde(default = "default_cloud_interval")]
    pub cloud_interval_secs: u64,
    /// How long a device may be missing from the cloud before it is dropped
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Directory holding the device registry
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_device_id_prefix")]
    pub device_id_prefix: String,
    /// Presence scan interval in seconds
    #[serde(default = "default_presence_interval")]
    pub presence_interval_secs: u64,
    #[serde(default = "default_probe_ports")]
    pub probe_ports: Vec<u16>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// File containing the gateway host's LAN address
    #[serde(default = "default_ip_file")]
    pub ip_file: PathBuf,
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
    #[serde(default = "default_probe_batch_size")]
    pub probe_batch_size: usize,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cloud_url: default_cloud_url(),
            cloud_interval_secs: default_cloud_interval(),
            grace_period_secs: default_grace_period(),
            db_path: default_db_path(),
            device_id_prefix: default_device_id_prefix(),
            presence_interval_secs: default_presence_interval(),
            probe_ports: default_probe_ports(),
            probe_timeout_secs: default_probe_timeout(),
            ip_file: default_ip_file(),
            sweep_batch_size: default_sweep_batch_size(),
            probe_batch_size: default_probe_batch_size(),
            accept_invalid_certs: false,
        }
    }
}

fn default_cloud_url() -> String {
    "https://appapi.cp.dyson.com".to_string()
}

fn default_cloud_interval() -> u64 {
    600
}

fn default_grace_period() -> u64 {
    86400
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/opt/storage")
}

fn default_device_id_prefix() -> String {
    "dyson-".to_string()
}

fn default_presence_interval() -> u64 {
    240
}

fn default_probe_ports() -> Vec<u16> {
    vec![1883, 8883]
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_ip_file() -> PathBuf {
    PathBuf::from("/opt/host_ip")
}

fn default_sweep_batch_size() -> usize {
    3
}

fn default_probe_batch_size() -> usize {
    2
}

/// Vendor cloud account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_country")]
    pub country: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            country: default_country(),
        }
    }
}

fn default_country() -> String {
    "DE".to_string()
}

/// Per-device session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Telemetry request interval in seconds
    #[serde(default = "default_sensor_interval")]
    pub sensor_interval_secs: u64,
    #[serde(default = "default_session_keepalive")]
    pub keepalive_secs: u64,
    /// Disconnects tolerated before a session gives up
    #[serde(default = "default_max_disconnects")]
    pub max_disconnects: u32,
    #[serde(default = "default_vendor_port")]
    pub vendor_port: u16,
    /// Log every vendor MQTT packet
    #[serde(default)]
    pub debug_transport: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sensor_interval_secs: default_sensor_interval(),
            keepalive_secs: default_session_keepalive(),
            max_disconnects: default_max_disconnects(),
            vendor_port: default_vendor_port(),
            debug_transport: false,
        }
    }
}

fn default_sensor_interval() -> u64 {
    10
}

fn default_session_keepalive() -> u64 {
    5
}

fn default_max_disconnects() -> u32 {
    10
}

fn default_vendor_port() -> u16 {
    1883
}

/// Random delay before startup, spreading restarts of many gateways
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_delay_min")]
    pub min_secs: u64,
    #[serde(default = "default_delay_max")]
    pub max_secs: u64,
}

impl Default for StartDelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_secs: default_delay_min(),
            max_secs: default_delay_max(),
        }
    }
}

fn default_delay_min() -> u64 {
    5
}

fn default_delay_max() -> u64 {
    20
}

impl StartDelayConfig {
    /// Pick a delay in `[min_secs, max_secs]`, or nothing when disabled
    pub fn pick(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let (low, high) = if self.min_secs <= self.max_secs {
            (self.min_secs, self.max_secs)
        } else {
            (self.max_secs, self.min_secs)
        };
        Some(Duration::from_secs(rand::thread_rng().gen_range(low..=high)))
    }
}

impl Config {
    /// Override the broker address from a `host[:port]` string
    pub fn apply_broker_override(&mut self, broker: &str) -> Result<()> {
        match broker.rsplit_once(':') {
            Some((host, port)) => {
                self.broker.host = host.to_string();
                self.broker.port = port.parse()?;
            }
            None => self.broker.host = broker.to_string(),
        }
        if self.broker.host.is_empty() {
            bail!("Broker host must not be empty");
        }
        Ok(())
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            ip_file: self.discovery.ip_file.clone(),
            probe_ports: self.discovery.probe_ports.clone(),
            probe_timeout: Duration::from_secs(self.discovery.probe_timeout_secs),
            sweep_batch_size: self.discovery.sweep_batch_size,
            probe_batch_size: self.discovery.probe_batch_size,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            client_id: self.broker.client_id.clone(),
            id_prefix: self.discovery.device_id_prefix.clone(),
            cloud_interval: Duration::from_secs(self.discovery.cloud_interval_secs),
            grace_period: Duration::from_secs(self.discovery.grace_period_secs),
            presence_interval: Duration::from_secs(self.discovery.presence_interval_secs),
            presence: self.presence_config(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            client_id: self.broker.client_id.clone(),
            sensor_interval: Duration::from_secs(self.session.sensor_interval_secs),
            keep_alive: Duration::from_secs(self.session.keepalive_secs),
            max_disconnects: self.session.max_disconnects,
            reconnect_pause: Duration::from_secs(1),
            vendor_port: self.session.vendor_port,
            debug_transport: self.session.debug_transport,
        }
    }

    pub fn cloud_config(&self) -> CloudConfig {
        CloudConfig {
            base_url: self.discovery.cloud_url.clone(),
            email: self.account.email.clone(),
            password: self.account.password.clone(),
            country: self.account.country.clone(),
            accept_invalid_certs: self.discovery.accept_invalid_certs,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[broker]
host = "10.0.0.2"

[discovery]
grace_period_secs = 3600
probe_ports = [1883]

[device_types]
"475" = "urn:infai:ses:device-type:1234"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.broker.host, "10.0.0.2");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.client_id, "fanlink");
        assert_eq!(config.broker.request_timeout_ms, 5000);
        assert_eq!(config.discovery.grace_period_secs, 3600);
        assert_eq!(config.discovery.cloud_interval_secs, 600);
        assert_eq!(config.discovery.probe_ports, vec![1883]);
        assert_eq!(config.session.max_disconnects, 10);
        assert_eq!(
            config.device_types.get("475").map(String::as_str),
            Some("urn:infai:ses:device-type:1234")
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/fanlink.toml")).unwrap();
        assert_eq!(config.broker.host, "message-broker");
        assert_eq!(config.discovery.device_id_prefix, "dyson-");
        assert!(!config.start_delay.enabled);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nport = \"not a port\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_broker_override() {
        let mut config = Config::default();
        config.apply_broker_override("broker.local:1884").unwrap();
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 1884);

        config.apply_broker_override("other").unwrap();
        assert_eq!(config.broker.host, "other");
        assert_eq!(config.broker.port, 1884);

        assert!(config.apply_broker_override("host:port").is_err());
    }

    #[test]
    fn test_derived_configs() {
        let mut config = Config::default();
        config.broker.client_id = "gw-1".to_string();
        config.session.keepalive_secs = 7;

        let engine = config.engine_config();
        assert_eq!(engine.client_id, "gw-1");
        assert_eq!(engine.grace_period, Duration::from_secs(86400));
        assert_eq!(engine.presence.probe_ports, vec![1883, 8883]);

        let session = config.session_config();
        assert_eq!(session.client_id, "gw-1");
        assert_eq!(session.keep_alive, Duration::from_secs(7));
    }

    #[test]
    fn test_start_delay_range() {
        let mut delay = StartDelayConfig::default();
        assert_eq!(delay.pick(), None);

        delay.enabled = true;
        delay.min_secs = 3;
        delay.max_secs = 4;
        for _ in 0..20 {
            let picked = delay.pick().unwrap();
            assert!(picked >= Duration::from_secs(3) && picked <= Duration::from_secs(4));
        }

        delay.min_secs = 9;
        delay.max_secs = 9;
        assert_eq!(delay.pick(), Some(Duration::from_secs(9)));
    }
}
