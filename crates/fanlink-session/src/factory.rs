//! Starting sessions and controlling them from the outside

use fanlink_core::{DeviceCapabilities, LocalCredentials, Upstream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::command::Command;
use crate::session::{Session, SessionConfig};
use crate::transport::{LinkTarget, MqttLink};
use crate::{SessionError, SharedDevice};

/// rumqttc refuses keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Owner-side handle on a running session
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    stop: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn new(commands: mpsc::UnboundedSender<Command>, stop: watch::Sender<bool>) -> Self {
        Self {
            commands,
            stop,
            driver: None,
        }
    }

    pub fn with_driver(mut self, driver: JoinHandle<()>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Queue a command; commands run in submission order
    pub fn submit(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow() || self.driver.as_ref().map(|d| d.is_finished()).unwrap_or(false)
    }

    /// Ask the session to close its connection and exit
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

/// Creates sessions for pool-resident devices
pub trait SessionFactory: Send + Sync {
    fn start(
        &self,
        device: SharedDevice,
        capabilities: Arc<dyn DeviceCapabilities>,
        device_type: String,
    ) -> Result<SessionHandle, SessionError>;
}

/// Starts sessions over rumqttc vendor links
pub struct MqttSessionFactory {
    upstream: Arc<dyn Upstream>,
    config: SessionConfig,
    id_prefix: String,
}

impl MqttSessionFactory {
    pub fn new(upstream: Arc<dyn Upstream>, config: SessionConfig, id_prefix: String) -> Self {
        Self {
            upstream,
            config,
            id_prefix,
        }
    }
}

impl SessionFactory for MqttSessionFactory {
    fn start(
        &self,
        device: SharedDevice,
        capabilities: Arc<dyn DeviceCapabilities>,
        device_type: String,
    ) -> Result<SessionHandle, SessionError> {
        let (device_id, credentials) = {
            let snapshot = device.try_read().map_err(|_| SessionError::Busy)?;
            (snapshot.id.clone(), LocalCredentials::parse(&snapshot.local_credentials)?)
        };

        // The appliance announces itself on the LAN under its serial
        let serial = device_id.serial(&self.id_prefix).to_string();
        let target = LinkTarget {
            client_id: format!("fanlink-{}", serial),
            host: serial.clone(),
            port: self.config.vendor_port,
            username: credentials.serial,
            password: credentials.password_hash,
            keep_alive: self.config.keep_alive.max(MIN_KEEP_ALIVE),
        };
        debug!(device = %device_id, host = %target.host, port = target.port, "Creating vendor link");

        let (link, events) = MqttLink::new(&target, self.config.debug_transport);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let session = Arc::new(Session::new(
            device,
            capabilities,
            self.upstream.clone(),
            Arc::new(link),
            self.config.clone(),
            serial,
            device_type,
            commands_rx,
            stop_rx,
        ));
        let driver = tokio::spawn(session.run(events));

        Ok(SessionHandle::new(commands_tx, stop_tx).with_driver(driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanlink_core::{Device, DeviceId, MemoryBus, PureCoolLink};
    use tokio::sync::RwLock;

    fn shared(credentials: &str) -> SharedDevice {
        Arc::new(RwLock::new(Device::new(
            DeviceId::from("dyson-NN2"),
            "Bedroom".to_string(),
            "475".to_string(),
            credentials.to_string(),
        )))
    }

    #[tokio::test]
    async fn test_bad_credentials_refuse_to_start() {
        let factory = MqttSessionFactory::new(
            Arc::new(MemoryBus::new()),
            SessionConfig::default(),
            "dyson-".to_string(),
        );
        let result = factory.start(shared("garbage"), Arc::new(PureCoolLink), "fan".to_string());
        assert!(matches!(result, Err(SessionError::Credentials(_))));
    }

    #[tokio::test]
    async fn test_handle_submit_and_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = SessionHandle::new(tx, stop_tx);

        handle.submit(Command::new("getPower", b"{}".to_vec())).unwrap();
        assert_eq!(rx.recv().await.unwrap().service, "getPower");

        assert!(!handle.is_stopped());
        handle.stop();
        assert!(*stop_rx.borrow());
        assert!(handle.is_stopped());

        drop(rx);
        assert!(matches!(
            handle.submit(Command::new("getPower", Vec::new())),
            Err(SessionError::Stopped)
        ));
    }
}
