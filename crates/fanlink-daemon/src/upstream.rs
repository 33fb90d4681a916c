//! Upstream device-management broker client
//!
//! Publishes device announcements, responses and events for every session
//! and feeds inbound command messages to the router. On each (re)connect
//! the tracked command subscriptions are renewed and every pooled device is
//! announced again.

use async_trait::async_trait;
use fanlink_core::{BusError, Upstream};
use fanlink_discovery::DiscoveryEngine;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::router::CommandRouter;

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// rumqttc-backed upstream bus client
pub struct MqttUpstream {
    client: AsyncClient,
    subscriptions: Mutex<BTreeSet<String>>,
    request_timeout: Duration,
}

impl MqttUpstream {
    /// Build the client; nothing is dialed until the event loop is polled
    pub fn new(config: &BrokerConfig) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(config.clean_session);

        let (client, eventloop) = AsyncClient::new(options, 10);
        (
            Self {
                client,
                subscriptions: Mutex::new(BTreeSet::new()),
                request_timeout: Duration::from_millis(config.request_timeout_ms),
            },
            eventloop,
        )
    }

    /// Topics currently subscribed on behalf of sessions
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Hand a request to the event loop, giving up once the queue stays full
    async fn request<F>(&self, request: F) -> Result<(), String>
    where
        F: Future<Output = Result<(), ClientError>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "request queue still full after {}ms",
                self.request_timeout.as_millis()
            )),
        }
    }

    async fn resubscribe(&self) {
        for topic in self.subscriptions() {
            if let Err(e) = self
                .request(self.client.subscribe(&topic, QoS::AtLeastOnce))
                .await
            {
                error!(topic = %topic, error = %e, "Renewing subscription failed");
            }
        }
    }
}

#[async_trait]
impl Upstream for MqttUpstream {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.request(self.client.publish(topic, QoS::AtLeastOnce, false, payload))
            .await
            .map_err(|e| {
                warn!(topic = %topic, error = %e, "Upstream publish dropped");
                BusError::Publish(topic.to_string(), e)
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.request(self.client.subscribe(topic, QoS::AtLeastOnce))
            .await
            .map_err(|e| BusError::Subscription(topic.to_string(), e))?;
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.insert(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.remove(topic);
        }
        self.request(self.client.unsubscribe(topic))
            .await
            .map_err(|e| BusError::Subscription(topic.to_string(), e))
    }
}

/// Drive the upstream connection until shutdown
pub async fn run(
    mut eventloop: EventLoop,
    upstream: Arc<MqttUpstream>,
    router: Arc<CommandRouter>,
    engine: Arc<DiscoveryEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            _ = shutdown.changed() => break,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(code = ?ack.code, "Broker refused connection");
                    continue;
                }
                info!("Connected to broker");
                // Publishing from this task would stall the event loop it depends on
                let upstream = upstream.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    upstream.resubscribe().await;
                    engine.republish_all().await;
                });
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = router.route(&publish.topic, publish.payload.to_vec()).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the connection");
            }
            Ok(other) => {
                debug!(event = ?other, "Upstream event");
            }
            Err(e) => {
                error!(error = %e, "Broker connection error, retrying");
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }

    if upstream.request(upstream.client.disconnect()).await.is_ok() {
        let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
    info!("Disconnected from broker");
}
