//! Routes upstream commands to device sessions

use fanlink_core::bus;
use fanlink_discovery::{DevicePool, DiscoveryError};
use fanlink_session::Command;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct CommandRouter {
    pool: Arc<DevicePool>,
}

impl CommandRouter {
    pub fn new(pool: Arc<DevicePool>) -> Self {
        Self { pool }
    }

    /// Queue a `command/{device_id}/{service}` message on the device's session
    pub async fn route(&self, topic: &str, payload: Vec<u8>) -> Result<(), DiscoveryError> {
        let Some((device_id, service)) = bus::parse_command_topic(topic) else {
            warn!(topic = %topic, "Ignoring message on unexpected topic");
            return Ok(());
        };

        debug!(device = %device_id, service = %service, "Routing command");
        let result = self
            .pool
            .submit(&device_id, Command::new(service, payload))
            .await;
        if let Err(e) = &result {
            warn!(device = %device_id, error = %e, "Dropping command");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanlink_core::{Device, DeviceId};
    use fanlink_discovery::PoolEntry;
    use fanlink_session::SessionHandle;
    use tokio::sync::{mpsc, watch, RwLock};

    #[tokio::test]
    async fn test_routes_to_pooled_device() {
        let pool = Arc::new(DevicePool::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, _stop_rx) = watch::channel(false);
        let id = DeviceId::from("dyson-NN2");
        pool.insert(
            id.clone(),
            PoolEntry {
                device: Arc::new(RwLock::new(Device::new(
                    id.clone(),
                    "Bedroom".to_string(),
                    "475".to_string(),
                    "{}".to_string(),
                ))),
                session: SessionHandle::new(tx, stop_tx),
            },
        )
        .await;

        let router = CommandRouter::new(pool);
        let payload = br#"{"command_id":"c1"}"#.to_vec();
        router
            .route("command/dyson-NN2/getPower", payload.clone())
            .await
            .unwrap();

        let command = rx.recv().await.unwrap();
        assert_eq!(command.service, "getPower");
        assert_eq!(command.payload, payload);
    }

    #[tokio::test]
    async fn test_unknown_device_and_topic() {
        let router = CommandRouter::new(Arc::new(DevicePool::new()));
        assert!(matches!(
            router.route("command/dyson-X/getPower", Vec::new()).await,
            Err(DiscoveryError::NotPooled(_))
        ));
        assert!(router.route("event/dyson-X/foo", Vec::new()).await.is_ok());
    }
}
