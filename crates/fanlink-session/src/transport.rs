//! Vendor MQTT link to a single appliance
//!
//! Each appliance runs its own MQTT broker on the LAN. A link is split in two
//! halves the way rumqttc splits a client: a cloneable command side
//! ([`VendorLink`]) and an event side ([`LinkEvents`]) that must be polled
//! continuously to drive the connection and its reconnects.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::SessionError;

/// How long a request may wait for room in the client's queue
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened on the vendor connection
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    /// A connection attempt was refused or could not be established
    ConnectFailed(String),
    /// An established connection dropped or was closed
    Disconnected { clean: bool },
    Message { topic: String, payload: Vec<u8> },
}

/// Command side of a vendor connection
#[async_trait]
pub trait VendorLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), SessionError>;
    async fn subscribe(&self, topic: &str) -> Result<(), SessionError>;
    async fn disconnect(&self) -> Result<(), SessionError>;
    fn is_connected(&self) -> bool;
}

/// Event side of a vendor connection
#[async_trait]
pub trait LinkEvents: Send {
    async fn next(&mut self) -> LinkEvent;
}

/// Where and how to reach one appliance
#[derive(Debug, Clone)]
pub struct LinkTarget {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
}

/// rumqttc-backed vendor link
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

/// Event loop half of [`MqttLink`]
pub struct MqttLinkEvents {
    eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    target: String,
    debug_transport: bool,
}

impl MqttLink {
    /// Build a link; nothing is dialed until the events half is polled
    pub fn new(target: &LinkTarget, debug_transport: bool) -> (Self, MqttLinkEvents) {
        let mut options = MqttOptions::new(&target.client_id, &target.host, target.port);
        options.set_keep_alive(target.keep_alive);
        options.set_credentials(&target.username, &target.password);

        let (client, eventloop) = AsyncClient::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));

        (
            Self {
                client,
                connected: connected.clone(),
                request_timeout: REQUEST_TIMEOUT,
            },
            MqttLinkEvents {
                eventloop,
                connected,
                target: format!("{}:{}", target.host, target.port),
                debug_transport,
            },
        )
    }

    async fn request<F>(&self, request: F) -> Result<(), SessionError>
    where
        F: Future<Output = Result<(), ClientError>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(|e| SessionError::Link(e.to_string())),
            Err(_) => Err(SessionError::Link(format!(
                "request queue still full after {}ms",
                self.request_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl VendorLink for MqttLink {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), SessionError> {
        self.request(self.client.publish(topic, QoS::AtLeastOnce, false, payload))
            .await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        self.request(self.client.subscribe(topic, QoS::AtLeastOnce))
            .await
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(self.client.disconnect()).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkEvents for MqttLinkEvents {
    async fn next(&mut self) -> LinkEvent {
        loop {
            let event = self.eventloop.poll().await;
            if self.debug_transport {
                debug!(target_addr = %self.target, event = ?event, "Vendor transport event");
            }

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        self.connected.store(true, Ordering::SeqCst);
                        return LinkEvent::Connected;
                    }
                    return LinkEvent::ConnectFailed(format!("{:?}", ack.code));
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return LinkEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                }
                Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        return LinkEvent::Disconnected { clean: true };
                    }
                }
                Ok(other) => {
                    trace!(target_addr = %self.target, event = ?other, "Ignoring vendor event");
                }
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        return LinkEvent::Disconnected { clean: false };
                    }
                    return LinkEvent::ConnectFailed(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> LinkTarget {
        LinkTarget {
            client_id: "fanlink-test".to_string(),
            host: "NN2-EU-KEA1234A".to_string(),
            port: 1883,
            username: "NN2-EU-KEA1234A".to_string(),
            password: "secret".to_string(),
            keep_alive: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_link_starts_disconnected() {
        let (link, events) = MqttLink::new(&target(), false);
        assert!(!link.is_connected());
        assert_eq!(events.target, "NN2-EU-KEA1234A:1883");
    }

    #[tokio::test]
    async fn test_requests_fail_once_queue_stays_full() {
        let (mut link, _events) = MqttLink::new(&target(), false);
        link.request_timeout = Duration::from_millis(50);

        let mut results = Vec::new();
        for _ in 0..12 {
            results.push(link.publish("475/NN2-EU-KEA1234A/command", "{}".to_string()).await);
        }
        assert!(results[..10].iter().all(Result::is_ok));
        assert!(results[10..]
            .iter()
            .all(|r| matches!(r, Err(SessionError::Link(_)))));
        assert!(matches!(link.disconnect().await, Err(SessionError::Link(_))));
    }
}
