//! In-process vendor link used by session tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::transport::{LinkEvent, LinkEvents, VendorLink};
use crate::SessionError;

#[derive(Default)]
pub struct FakeLink {
    connected: AtomicBool,
    fail_subscribe: AtomicBool,
    disconnects: AtomicUsize,
    published: Mutex<Vec<(String, String)>>,
    subscriptions: Mutex<Vec<String>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl VendorLink for FakeLink {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), SessionError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SessionError::Link("subscribe refused".to_string()));
        }
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Replays a fixed event sequence, then stays silent
pub struct ScriptedEvents {
    events: VecDeque<LinkEvent>,
    consumed: Arc<AtomicUsize>,
}

impl ScriptedEvents {
    /// Returns the source and a counter of events handed out so far
    pub fn new(events: impl IntoIterator<Item = LinkEvent>) -> (Self, Arc<AtomicUsize>) {
        let consumed = Arc::new(AtomicUsize::new(0));
        (
            Self {
                events: events.into_iter().collect(),
                consumed: consumed.clone(),
            },
            consumed,
        )
    }
}

#[async_trait]
impl LinkEvents for ScriptedEvents {
    async fn next(&mut self) -> LinkEvent {
        match self.events.pop_front() {
            Some(event) => {
                self.consumed.fetch_add(1, Ordering::SeqCst);
                event
            }
            None => std::future::pending().await,
        }
    }
}
