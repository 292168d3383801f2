pub mod control_loop;

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, TransportKind};
use crate::measurements::MeasurementCache;
use crate::registry::AssetRegistry;
use crate::transport::{MemoryTransport, MqttTransport, Transport};

pub use control_loop::{
    feeder_loading, ControlError, ControlLoop, ControlSettings, Decision, IssuedCommand,
    LoopPhase, StepOutcome, CURTAILMENT_FACTOR, RESTORE_FRACTION,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AssetRegistry>,
    pub cache: Arc<MeasurementCache>,
    pub control: Arc<ControlLoop>,
    ingest: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AppState {
    /// Build the registry and cache, then connect the bus. A failed connection
    /// leaves the controller in degraded mode instead of failing startup.
    pub async fn new(cfg: &Config) -> Result<Self> {
        let registry = Arc::new(AssetRegistry::new());
        let cache = Arc::new(if cfg.controller.reject_stale_measurements {
            MeasurementCache::with_stale_guard()
        } else {
            MeasurementCache::new()
        });

        let transport = connect_transport(cfg).await;
        if let Some(t) = &transport {
            info!(
                transport = t.name(),
                feeder_id = %cfg.controller.feeder_id,
                "message bus ready"
            );
        }
        let control = Arc::new(ControlLoop::new(
            ControlSettings::from(&cfg.controller),
            registry.clone(),
            cache.clone(),
            transport,
        ));

        let ingest = match control.subscribe_measurements(cfg.mqtt.channel_capacity).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "measurement subscription failed, telemetry unavailable");
                None
            }
        };

        Ok(Self {
            registry,
            cache,
            control,
            ingest: Arc::new(Mutex::new(ingest)),
        })
    }

    /// Whether the measurement ingest task is still draining the bus.
    pub fn ingest_running(&self) -> bool {
        self.ingest.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the control loop, release the bus connection and end ingest.
    /// The subscription table keeps its sender alive, so ingest is aborted
    /// rather than waiting for the channel to close.
    pub async fn shutdown(&self) {
        self.control.stop();
        self.control.close_transport().await;
        let ingest = self.ingest.lock().take();
        if let Some(handle) = ingest {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "measurement ingest ended abnormally");
                }
            }
        }
    }
}

async fn connect_transport(cfg: &Config) -> Option<Arc<dyn Transport>> {
    match cfg.mqtt.kind {
        TransportKind::Memory => {
            info!("using in-process message bus");
            Some(Arc::new(MemoryTransport::new()))
        }
        TransportKind::Mqtt => {
            let settings = cfg.mqtt.settings(&cfg.controller.feeder_id);
            match MqttTransport::connect(&settings, &cfg.mqtt.retry_policy()).await {
                Ok(transport) => Some(Arc::new(transport)),
                Err(e) => {
                    error!(
                        error = %e,
                        "continuing without message bus, control actions disabled"
                    );
                    None
                }
            }
        }
    }
}

pub fn spawn_controller_tasks(state: &AppState) -> Result<JoinHandle<()>> {
    Ok(state.control.start()?)
}
