//! In-memory pool of active devices and their sessions
//!
//! The pool lock guards membership only. Callers clone what they need out
//! of the map and release the lock before any network I/O.

use fanlink_core::{Device, DeviceId};
use fanlink_session::{Command, SessionHandle, SharedDevice};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::DiscoveryError;

/// A pooled device together with the session that owns its connection
#[derive(Debug)]
pub struct PoolEntry {
    pub device: SharedDevice,
    pub session: SessionHandle,
}

#[derive(Debug, Default)]
pub struct DevicePool {
    entries: Mutex<HashMap<DeviceId, PoolEntry>>,
}

impl DevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids whose session has given up or exited
    pub async fn stopped_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.session.is_stopped())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, id: &DeviceId) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    /// Insert an entry; an existing entry for the same id is handed back
    pub async fn insert(&self, id: DeviceId, entry: PoolEntry) -> Option<PoolEntry> {
        self.entries.lock().await.insert(id, entry)
    }

    pub async fn remove(&self, id: &DeviceId) -> Option<PoolEntry> {
        self.entries.lock().await.remove(id)
    }

    pub async fn device(&self, id: &DeviceId) -> Option<SharedDevice> {
        self.entries.lock().await.get(id).map(|e| e.device.clone())
    }

    /// Snapshot of every pooled device
    pub async fn snapshots(&self) -> Vec<Device> {
        let shared: Vec<SharedDevice> = self
            .entries
            .lock()
            .await
            .values()
            .map(|e| e.device.clone())
            .collect();

        let mut devices = Vec::with_capacity(shared.len());
        for device in shared {
            devices.push(device.read().await.clone());
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Queue a command on a device's session
    pub async fn submit(&self, id: &DeviceId, command: Command) -> Result<(), DiscoveryError> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| DiscoveryError::NotPooled(id.clone()))?;
        Ok(entry.session.submit(command)?)
    }

    /// Stop every session and empty the pool
    pub async fn stop_all(&self) {
        let drained: Vec<PoolEntry> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch, RwLock};

    fn entry(id: &str) -> (PoolEntry, mpsc::UnboundedReceiver<Command>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let device = Arc::new(RwLock::new(Device::new(
            DeviceId::from(id),
            id.to_string(),
            "475".to_string(),
            "{}".to_string(),
        )));
        (
            PoolEntry {
                device,
                session: SessionHandle::new(tx, stop_tx),
            },
            rx,
            stop_rx,
        )
    }

    #[tokio::test]
    async fn test_membership() {
        let pool = DevicePool::new();
        let (a, _rx_a, _stop_a) = entry("a");
        let (b, _rx_b, _stop_b) = entry("b");
        pool.insert(DeviceId::from("b"), b).await;
        pool.insert(DeviceId::from("a"), a).await;

        assert_eq!(pool.ids().await, vec![DeviceId::from("a"), DeviceId::from("b")]);
        assert_eq!(pool.snapshots().await[0].name, "a");
        assert!(pool.remove(&DeviceId::from("a")).await.is_some());
        assert!(!pool.contains(&DeviceId::from("a")).await);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_submit_routes_to_session() {
        let pool = DevicePool::new();
        let (a, mut rx, _stop) = entry("a");
        pool.insert(DeviceId::from("a"), a).await;

        pool.submit(&DeviceId::from("a"), Command::new("getPower", Vec::new()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().service, "getPower");

        assert!(matches!(
            pool.submit(&DeviceId::from("missing"), Command::new("getPower", Vec::new()))
                .await,
            Err(DiscoveryError::NotPooled(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all() {
        let pool = DevicePool::new();
        let (a, _rx, stop) = entry("a");
        pool.insert(DeviceId::from("a"), a).await;
        assert!(pool.stopped_ids().await.is_empty());
        pool.stop_all().await;
        assert!(*stop.borrow());
        assert!(pool.is_empty().await);
    }
}
