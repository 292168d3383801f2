//! Publish/subscribe transport adapter
//!
//! Inbound messages are decoded to JSON and pushed into bounded channels
//! registered with [`Transport::subscribe`]; outbound commands go through
//! [`Transport::publish`], which never waits on the broker.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub use memory::MemoryTransport;
pub use mqtt::{MqttSettings, MqttTransport};

use crate::domain::AssetId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {target} failed after {attempts} attempts: {last_error}")]
    ConnectionFailed {
        target: String,
        attempts: u32,
        last_error: String,
    },
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Subscribe to {pattern} failed: {reason}")]
    Subscribe { pattern: String, reason: String },
    #[error("Payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Transport closed")]
    Closed,
}

/// A decoded message delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Route every message matching `pattern` (single-level `+` wildcard) into `sink`.
    async fn subscribe(
        &self,
        pattern: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TransportError>;

    /// Best-effort, non-blocking send.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn close(&self);

    fn is_connected(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Bounded connect-retry policy: `max_attempts` tries, `delay` between them,
/// plus up to `jitter` of random extra wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(2),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(extra_ms)
    }

    /// Run `op` until it succeeds or the attempts are exhausted. Every failure
    /// is logged; exhaustion yields [`TransportError::ConnectionFailed`].
    pub async fn retry<T, E, F, Fut>(&self, endpoint: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(value) => {
                    info!(endpoint, attempt, "connected");
                    return Ok(value);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        endpoint,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.next_delay()).await;
                    }
                }
            }
        }

        error!(endpoint, attempts, "giving up on connection");
        Err(TransportError::ConnectionFailed {
            target: endpoint.to_string(),
            attempts,
            last_error,
        })
    }
}

/// Topic layout for one feeder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeederTopics {
    feeder_id: String,
}

impl FeederTopics {
    pub fn new(feeder_id: impl Into<String>) -> Self {
        Self {
            feeder_id: feeder_id.into(),
        }
    }

    pub fn measurements(&self, asset_id: &AssetId) -> String {
        format!("feeder/{}/measurements/{}", self.feeder_id, asset_id)
    }

    /// Pattern matching every asset's measurement topic
    pub fn all_measurements(&self) -> String {
        format!("feeder/{}/measurements/+", self.feeder_id)
    }

    pub fn commands(&self, asset_id: &AssetId) -> String {
        format!("feeder/{}/commands/{}", self.feeder_id, asset_id)
    }
}

/// MQTT-style match where `+` stands for exactly one path segment.
/// An empty segment still counts as a segment, as in MQTT.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (None, None) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            _ => return false,
        }
    }
}

/// Decode a raw payload. Undecodable payloads are logged and dropped.
pub fn decode_payload(topic: &str, bytes: &[u8]) -> Option<serde_json::Value> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(topic, error = %e, bytes = bytes.len(), "dropping malformed payload");
            None
        }
    }
}

struct Subscription {
    pattern: String,
    sink: mpsc::Sender<InboundMessage>,
}

/// Pattern → sink table shared by the transport implementations
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionTable {
    pub(crate) fn add(&self, pattern: &str, sink: mpsc::Sender<InboundMessage>) {
        self.entries.write().push(Subscription {
            pattern: pattern.to_string(),
            sink,
        });
    }

    pub(crate) fn patterns(&self) -> Vec<String> {
        self.entries.read().iter().map(|s| s.pattern.clone()).collect()
    }

    /// Decode once and hand the message to every matching sink.
    /// Returns the number of sinks that accepted it.
    pub(crate) async fn dispatch(&self, topic: &str, bytes: &[u8]) -> usize {
        let sinks: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| s.sink.clone())
            .collect();
        if sinks.is_empty() {
            return 0;
        }

        let Some(payload) = decode_payload(topic, bytes) else {
            return 0;
        };
        let msg = InboundMessage {
            topic: topic.to_string(),
            payload,
        };

        let mut delivered = 0;
        for sink in sinks {
            if sink.send(msg.clone()).await.is_ok() {
                delivered += 1;
            } else {
                warn!(topic, "subscriber channel closed");
            }
        }
        delivered
    }
}
