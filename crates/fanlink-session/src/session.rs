//! Device session: owner of one live vendor connection
//!
//! A session drives a small state machine:
//! `Disconnected -> Connecting -> Connected -> Disconnected ...`, ending in
//! `Stopped` once the disconnect budget is spent or the pool drops the device.
//!
//! Besides the connection driver a session runs two workers, started on the
//! first successful connect:
//! - the command worker, consuming the per-device FIFO queue
//! - the telemetry worker, requesting sensor data on a fixed interval

use fanlink_core::bus::{self, CommandEnvelope, Upstream};
use fanlink_core::{ConnectionState, DeviceCapabilities, DeviceState, FrameKind, ServiceError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::transport::{LinkEvent, LinkEvents, VendorLink};
use crate::{SessionError, SharedDevice};

/// How long the command worker waits on an empty queue before re-checking for stop
pub const COMMAND_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upstream client id owning the device-manager topic
    pub client_id: String,
    pub sensor_interval: Duration,
    pub keep_alive: Duration,
    pub max_disconnects: u32,
    /// Pause after a failed connection attempt before the transport re-dials
    pub reconnect_pause: Duration,
    pub vendor_port: u16,
    pub debug_transport: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: "fanlink".to_string(),
            sensor_interval: Duration::from_secs(10),
            keep_alive: Duration::from_secs(5),
            max_disconnects: 10,
            reconnect_pause: Duration::from_secs(1),
            vendor_port: 1883,
            debug_transport: false,
        }
    }
}

/// Result of handling one inbound vendor frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    StatePublished,
    ReadingsPublished,
    /// Telemetry frame carried only sentinel values; nothing was published
    NotReady,
    Ignored,
}

pub struct Session {
    device: SharedDevice,
    capabilities: Arc<dyn DeviceCapabilities>,
    upstream: Arc<dyn Upstream>,
    link: Arc<dyn VendorLink>,
    config: SessionConfig,
    serial: String,
    device_type: String,
    state: RwLock<SessionState>,
    device_state: RwLock<Option<DeviceState>>,
    disconnects: AtomicU32,
    workers_started: AtomicBool,
    commands: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    stop_rx: watch::Receiver<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: SharedDevice,
        capabilities: Arc<dyn DeviceCapabilities>,
        upstream: Arc<dyn Upstream>,
        link: Arc<dyn VendorLink>,
        config: SessionConfig,
        serial: String,
        device_type: String,
        commands: mpsc::UnboundedReceiver<Command>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            device,
            capabilities,
            upstream,
            link,
            config,
            serial,
            device_type,
            state: RwLock::new(SessionState::Disconnected),
            device_state: RwLock::new(None),
            disconnects: AtomicU32::new(0),
            workers_started: AtomicBool::new(false),
            commands: Mutex::new(Some(commands)),
            stop_rx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub async fn cached_state(&self) -> Option<DeviceState> {
        self.device_state.read().await.clone()
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn device_label(&self) -> String {
        self.device.read().await.id.to_string()
    }

    /// Announce the device with its current connection state
    async fn publish_device(&self) -> Result<(), SessionError> {
        let snapshot = self.device.read().await.clone();
        self.upstream
            .publish(
                &bus::device_topic(&self.config.client_id),
                bus::set_device_message(&snapshot, &self.device_type),
            )
            .await?;
        Ok(())
    }

    /// Drive the connection until the session stops
    pub async fn run(self: Arc<Self>, mut events: impl LinkEvents) {
        let device = self.device_label().await;
        info!(device = %device, host = %self.serial, port = self.config.vendor_port, "Starting session");
        *self.state.write().await = SessionState::Connecting;

        let mut stop_rx = self.stop_rx.clone();
        loop {
            let event = tokio::select! {
                _ = stop_rx.changed() => break,
                event = events.next() => event,
            };

            match event {
                LinkEvent::Connected => self.handle_connect().await,
                LinkEvent::Message { topic, payload } => {
                    if let Err(e) = self.handle_message(&topic, &payload).await {
                        error!(device = %device, error = %e, "Parsing vendor message failed");
                    }
                }
                LinkEvent::Disconnected { clean } => {
                    if clean {
                        info!(device = %device, "Disconnected");
                    } else {
                        warn!(device = %device, "Disconnected unexpectedly");
                    }
                    self.handle_disconnect().await;
                }
                LinkEvent::ConnectFailed(reason) => {
                    error!(device = %device, host = %self.serial, reason = %reason, "Could not connect");
                    self.handle_disconnect().await;
                    tokio::time::sleep(self.config.reconnect_pause).await;
                }
            }

            if self.state().await == SessionState::Stopped {
                break;
            }
        }

        self.shutdown().await;
        info!(device = %device, "Session exited");
    }

    async fn shutdown(&self) {
        *self.state.write().await = SessionState::Stopped;
        if self.link.is_connected() {
            if let Err(e) = self.link.disconnect().await {
                debug!(error = %e, "Vendor disconnect failed");
            }
        }
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
    }

    /// Connection established: go online and set up the vendor side
    pub async fn handle_connect(self: &Arc<Self>) {
        let device = self.device_label().await;
        info!(device = %device, "Connected");
        *self.state.write().await = SessionState::Connected;

        self.device.write().await.state = ConnectionState::Online;
        if let Err(e) = self.publish_device().await {
            error!(device = %device, error = %e, "Setting state failed");
        }
        let command_topic = bus::command_topic(&self.device.read().await.id);
        if let Err(e) = self.upstream.subscribe(&command_topic).await {
            error!(device = %device, error = %e, "Subscribing command topic failed");
        }

        if let Err(e) = self.setup_vendor().await {
            error!(device = %device, error = %e, "Handling connect failed");
            if let Err(e) = self.link.disconnect().await {
                debug!(device = %device, error = %e, "Vendor disconnect failed");
            }
            return;
        }

        self.start_workers().await;
        self.disconnects.store(0, Ordering::SeqCst);
    }

    async fn setup_vendor(&self) -> Result<(), SessionError> {
        self.link
            .subscribe(&self.capabilities.state_topic(&self.serial))
            .await?;
        self.link
            .publish(
                &self.capabilities.command_topic(&self.serial),
                self.capabilities.state_request().to_string(),
            )
            .await
    }

    /// Connection lost or attempt failed
    pub async fn handle_disconnect(&self) {
        let device = self.device_label().await;
        let count = self.disconnects.fetch_add(1, Ordering::SeqCst);

        if count > self.config.max_disconnects {
            warn!(
                device = %device,
                disconnects = count,
                max = self.config.max_disconnects,
                "Disconnect limit exceeded, closing session"
            );
            *self.state.write().await = SessionState::Stopped;
            return;
        }

        *self.state.write().await = SessionState::Disconnected;

        let was_online = {
            let mut dev = self.device.write().await;
            let was_online = dev.is_online();
            dev.state = ConnectionState::Offline;
            was_online
        };
        if !was_online {
            return;
        }

        if let Err(e) = self.publish_device().await {
            warn!(device = %device, error = %e, "Setting state failed");
        }
        let command_topic = bus::command_topic(&self.device.read().await.id);
        if let Err(e) = self.upstream.unsubscribe(&command_topic).await {
            warn!(device = %device, error = %e, "Unsubscribing command topic failed");
        }
    }

    /// Classify and dispatch one inbound vendor frame
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<FrameOutcome, SessionError> {
        let device_id = self.device.read().await.id.clone();
        let frame: Value = serde_json::from_slice(payload)?;
        debug!(device = %device_id, topic = %topic, "Got vendor message");

        match self.capabilities.classify(&frame) {
            FrameKind::State => {
                let merged = {
                    let mut cached = self.device_state.write().await;
                    let previous = cached.clone().unwrap_or_default();
                    let merged = self.capabilities.parse_state(&previous, &frame)?;
                    *cached = Some(merged.clone());
                    merged
                };

                let Some(service) = self.capabilities.state_event() else {
                    return Ok(FrameOutcome::Ignored);
                };
                let event = (service.transform)(&Value::Object(merged))?;
                if let Err(e) = self
                    .upstream
                    .publish(&bus::event_topic(&device_id, service.name), event.to_string())
                    .await
                {
                    error!(device = %device_id, error = %e, "Can't publish state");
                }
                Ok(FrameOutcome::StatePublished)
            }
            FrameKind::Telemetry => {
                let Some(service) = self.capabilities.readings_event() else {
                    return Ok(FrameOutcome::Ignored);
                };
                let event = match (service.transform)(&frame) {
                    Ok(event) => event,
                    Err(ServiceError::NotReady) => {
                        debug!(device = %device_id, "Sensors not ready");
                        return Ok(FrameOutcome::NotReady);
                    }
                    Err(e) => return Err(e.into()),
                };
                if let Err(e) = self
                    .upstream
                    .publish(&bus::event_topic(&device_id, service.name), event.to_string())
                    .await
                {
                    error!(device = %device_id, error = %e, "Can't publish readings");
                }
                Ok(FrameOutcome::ReadingsPublished)
            }
            FrameKind::Unknown(kind) => {
                warn!(device = %device_id, kind = %kind, "Message type not supported");
                Ok(FrameOutcome::Ignored)
            }
        }
    }

    /// Execute one queued command and reply upstream
    pub async fn execute_command(&self, command: Command) -> Result<(), SessionError> {
        let device_id = self.device.read().await.id.clone();
        debug!(device = %device_id, service = %command.service, "Executing command");

        if !self.link.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let state = self
            .device_state
            .read()
            .await
            .clone()
            .ok_or(SessionError::NoDeviceState)?;

        let envelope = CommandEnvelope::parse(&command.payload)?;
        let args = envelope.arguments()?;

        let reply = if let Some(set) = self.capabilities.set_service(&command.service) {
            let message = set(&state, &args)?;
            self.link
                .publish(&self.capabilities.command_topic(&self.serial), message.to_string())
                .await?;
            String::new()
        } else if let Some(get) = self.capabilities.get_service(&command.service) {
            get(&state, &args)?.to_string()
        } else {
            return Err(SessionError::UnsupportedService(command.service));
        };

        let response = bus::response_message(&envelope.command_id, &reply);
        if let Err(e) = self
            .upstream
            .publish(&bus::response_topic(&device_id, &command.service), response)
            .await
        {
            error!(
                device = %device_id,
                command_id = %envelope.command_id,
                error = %e,
                "Could not send response"
            );
        }
        Ok(())
    }

    async fn start_workers(self: &Arc<Self>) {
        if self.workers_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock().await;
        if let Some(commands) = self.commands.lock().await.take() {
            workers.push(tokio::spawn(self.clone().command_worker(commands)));
        }
        if self.capabilities.telemetry_request().is_some() {
            workers.push(tokio::spawn(self.clone().telemetry_worker()));
        }
    }

    async fn command_worker(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        let device = self.device_label().await;
        debug!(device = %device, "Command worker started");

        while !self.stop_requested() {
            let command = match tokio::time::timeout(COMMAND_POLL_TIMEOUT, commands.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(_) => continue,
            };
            let service = command.service.clone();
            if let Err(e) = self.execute_command(command).await {
                error!(device = %device, service = %service, error = %e, "Handling command failed");
            }
        }

        debug!(device = %device, "Command worker exited");
    }

    async fn telemetry_worker(self: Arc<Self>) {
        let device = self.device_label().await;
        debug!(device = %device, "Telemetry worker started");

        while !self.stop_requested() && self.state().await != SessionState::Stopped {
            if self.link.is_connected() {
                if let Some(request) = self.capabilities.telemetry_request() {
                    debug!(device = %device, "Requesting sensor data");
                    if let Err(e) = self
                        .link
                        .publish(&self.capabilities.command_topic(&self.serial), request.to_string())
                        .await
                    {
                        warn!(device = %device, error = %e, "Sensor data request failed");
                    }
                }
            }
            tokio::time::sleep(self.config.sensor_interval).await;
        }

        debug!(device = %device, "Telemetry worker exited");
    }
}
