//! In-process doubles for the bus contract

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

use crate::bus::{BusError, Upstream};

/// In-process bus that records all traffic
#[derive(Debug, Default)]
pub struct MemoryBus {
    inner: Mutex<MemoryBusInner>,
}

#[derive(Debug, Default)]
struct MemoryBusInner {
    published: Vec<(String, String)>,
    subscriptions: Vec<String>,
    fail_publish: bool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail until reset
    pub fn set_fail_publish(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_publish = fail;
        }
    }

    /// All `(topic, payload)` pairs published so far
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .map(|inner| inner.published.clone())
            .unwrap_or_default()
    }

    /// Published payloads on one topic, decoded as JSON
    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_str(&payload).ok())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.published.clear();
        }
    }
}

#[async_trait]
impl Upstream for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut inner = self.inner.lock().map_err(|_| BusError::NotConnected)?;
        if inner.fail_publish {
            return Err(BusError::Publish(topic.to_string(), "rejected".to_string()));
        }
        inner.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        let mut inner = self.inner.lock().map_err(|_| BusError::NotConnected)?;
        if !inner.subscriptions.iter().any(|t| t == topic) {
            inner.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        let mut inner = self.inner.lock().map_err(|_| BusError::NotConnected)?;
        inner.subscriptions.retain(|t| t != topic);
        Ok(())
    }
}
