//! In-process transport. Nothing leaves the process: published messages are
//! recorded, and inbound traffic is injected with [`MemoryTransport::deliver`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use super::{InboundMessage, SubscriptionTable, Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    subscriptions: SubscriptionTable,
    published: Mutex<Vec<PublishedMessage>>,
    failing_topics: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw inbound message through pattern matching and decoding,
    /// exactly as a broker delivery would be. Returns how many subscribers got it.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }
        self.subscriptions.dispatch(topic, payload).await
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.lock())
    }

    /// Make every publish to `topic` fail until [`MemoryTransport::heal`] is called.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.failing_topics.lock().insert(topic.into());
    }

    pub fn heal(&self) {
        self.failing_topics.lock().clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        pattern: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.subscriptions.add(pattern, sink);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.failing_topics.lock().contains(topic) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
