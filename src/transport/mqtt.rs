//! MQTT 3.1.1 transport backed by `rumqttc`.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{InboundMessage, RetryPolicy, SubscriptionTable, Transport, TransportError};

/// Queue depth of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(5)));
        if let Some(user) = &self.username {
            options.set_credentials(user, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect to the broker, retrying according to `policy`. Once the first
    /// CONNACK arrives a background task keeps the event loop running and
    /// reconnects (and resubscribes) on its own.
    pub async fn connect(
        settings: &MqttSettings,
        policy: &RetryPolicy,
    ) -> Result<Self, TransportError> {
        let (client, eventloop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
        let eventloop = Arc::new(tokio::sync::Mutex::new(eventloop));

        policy
            .retry(&settings.endpoint(), |_| {
                let eventloop = eventloop.clone();
                async move { await_connack(&mut *eventloop.lock().await).await }
            })
            .await?;

        let subscriptions = Arc::new(SubscriptionTable::default());
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let driver = spawn_event_loop(
            eventloop,
            client.clone(),
            subscriptions.clone(),
            connected.clone(),
            closing.clone(),
            policy.delay,
        );

        info!(
            endpoint = %settings.endpoint(),
            client_id = %settings.client_id,
            "connected to MQTT broker"
        );

        Ok(Self {
            client,
            subscriptions,
            connected,
            closing,
            driver: Mutex::new(Some(driver)),
        })
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

fn spawn_event_loop(
    eventloop: Arc<tokio::sync::Mutex<EventLoop>>,
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    reconnect_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut eventloop = eventloop.lock_owned().await;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let delivered = subscriptions.dispatch(&publish.topic, &publish.payload).await;
                    debug!(topic = %publish.topic, delivered, "message dispatched");
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    info!("reconnected to MQTT broker");
                    for pattern in subscriptions.patterns() {
                        if let Err(e) = client.try_subscribe(pattern.clone(), QoS::AtMostOnce) {
                            warn!(%pattern, error = %e, "resubscribe failed");
                        }
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) if closing.load(Ordering::SeqCst) => {
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    if closing.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "MQTT connection lost, reconnecting");
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        }
        connected.store(false, Ordering::SeqCst);
        info!("MQTT event loop stopped");
    })
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(
        &self,
        pattern: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TransportError> {
        self.client
            .subscribe(pattern, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        self.subscriptions.add(pattern, sink);
        info!(%pattern, "subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request not delivered");
        }
        let driver = self.driver.lock().take();
        if let Some(handle) = driver {
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}
