//! Feeder demand-response loop.
//!
//! Every `interval` the loop sums the cached measurements, computes feeder
//! loading and then either curtails (halves) every controllable EV charger or
//! restores chargers that sit below 80% of their maximum. Steps never overlap
//! and a failed step is logged without ending the loop.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::domain::{AssetId, AssetKind, SetPowerCommand};
use crate::measurements::{spawn_ingest, MeasurementCache};
use crate::registry::AssetRegistry;
use crate::transport::{FeederTopics, Transport, TransportError};

/// Multiplier applied to an EV charger's setpoint on every overloaded step
pub const CURTAILMENT_FACTOR: f64 = 0.5;
/// Fraction of `max_power_kw` chargers are brought back to
pub const RESTORE_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct ControlSettings {
    pub feeder_id: String,
    pub interval: Duration,
    pub loading_threshold: f64,
    pub rated_capacity_kw: f64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ControlSettings {
    fn from(cfg: &ControllerConfig) -> Self {
        Self {
            feeder_id: cfg.feeder_id.clone(),
            interval: Duration::from_secs(cfg.interval_secs),
            loading_threshold: cfg.loading_threshold,
            rated_capacity_kw: cfg.rated_capacity_kw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Curtail,
    Restore,
    /// No transport attached; nothing was changed
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedCommand {
    pub asset_id: AssetId,
    pub power_kw: f64,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub loading: f64,
    pub measured_power_kw: f64,
    pub decision: Decision,
    pub commands: Vec<IssuedCommand>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control loop already running")]
    AlreadyStarted,
    #[error("control loop has been stopped")]
    Stopped,
    #[error("command delivery failed for {} asset(s): {reason}", .failed.len())]
    Step { failed: Vec<AssetId>, reason: String },
}

/// `min(1, measured / rated)`, floored at zero. A non-positive rating yields 0.
pub fn feeder_loading(measured_power_kw: f64, rated_capacity_kw: f64) -> f64 {
    if rated_capacity_kw <= 0.0 || measured_power_kw.is_nan() {
        return 0.0;
    }
    (measured_power_kw / rated_capacity_kw).clamp(0.0, 1.0)
}

pub struct ControlLoop {
    settings: ControlSettings,
    topics: FeederTopics,
    registry: Arc<AssetRegistry>,
    cache: Arc<MeasurementCache>,
    transport: Option<Arc<dyn Transport>>,
    phase: Mutex<LoopPhase>,
    running: AtomicBool,
    wake: Notify,
    step_guard: tokio::sync::Mutex<()>,
    last_outcome: RwLock<Option<StepOutcome>>,
}

impl ControlLoop {
    /// `transport = None` runs the loop degraded: loading is still evaluated
    /// but no setpoints are changed and no commands are sent.
    pub fn new(
        settings: ControlSettings,
        registry: Arc<AssetRegistry>,
        cache: Arc<MeasurementCache>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        Self {
            topics: FeederTopics::new(settings.feeder_id.clone()),
            settings,
            registry,
            cache,
            transport,
            phase: Mutex::new(LoopPhase::Idle),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            step_guard: tokio::sync::Mutex::new(()),
            last_outcome: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn topics(&self) -> &FeederTopics {
        &self.topics
    }

    pub fn phase(&self) -> LoopPhase {
        *self.phase.lock()
    }

    pub fn transport_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    pub fn last_outcome(&self) -> Option<StepOutcome> {
        self.last_outcome.read().clone()
    }

    /// Subscribe to `feeder/{id}/measurements/+` and start draining deliveries
    /// into the cache. Returns `None` when running without a transport.
    pub async fn subscribe_measurements(
        &self,
        channel_capacity: usize,
    ) -> Result<Option<JoinHandle<()>>, TransportError> {
        let Some(transport) = &self.transport else {
            warn!(feeder_id = %self.settings.feeder_id, "no transport, telemetry unavailable");
            return Ok(None);
        };
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        transport.subscribe(&self.topics.all_measurements(), tx).await?;
        Ok(Some(spawn_ingest(self.cache.clone(), rx)))
    }

    /// Run one evaluation. Concurrent callers queue behind the step in flight.
    pub async fn step(&self) -> Result<StepOutcome, ControlError> {
        let _in_flight = self.step_guard.lock().await;

        let snapshot = self.cache.snapshot();
        let measured_power_kw: f64 = snapshot.iter().map(|(_, m)| m.power_kw).sum();
        let loading = feeder_loading(measured_power_kw, self.settings.rated_capacity_kw);
        let overloaded = loading > self.settings.loading_threshold;

        let decision = match (&self.transport, overloaded) {
            (None, _) => Decision::Hold,
            (Some(_), true) => Decision::Curtail,
            (Some(_), false) => Decision::Restore,
        };

        info!(
            feeder_id = %self.settings.feeder_id,
            loading,
            threshold = self.settings.loading_threshold,
            measured_power_kw,
            measurements = snapshot.len(),
            %decision,
            "feeder loading evaluated"
        );

        let mut commands = Vec::new();
        let mut failed = Vec::new();
        let mut reason = String::new();

        if let Some(transport) = &self.transport {
            for (asset_id, target_kw) in self.plan(decision) {
                let Some(applied_kw) = self.registry.apply_power(&asset_id, target_kw) else {
                    continue;
                };
                let sent = self
                    .send_setpoint(transport.as_ref(), &asset_id, applied_kw)
                    .await;
                let delivered = match sent {
                    Ok(()) => {
                        info!(%asset_id, power_kw = applied_kw, %decision, "setpoint command sent");
                        true
                    }
                    Err(e) => {
                        warn!(
                            %asset_id,
                            power_kw = applied_kw,
                            error = %e,
                            "setpoint command not delivered"
                        );
                        if reason.is_empty() {
                            reason = e.to_string();
                        }
                        failed.push(asset_id.clone());
                        false
                    }
                };
                commands.push(IssuedCommand {
                    asset_id,
                    power_kw: applied_kw,
                    delivered,
                });
            }
        } else if overloaded {
            warn!(
                feeder_id = %self.settings.feeder_id,
                "feeder overloaded but transport unavailable, no control actions issued"
            );
        }

        let outcome = StepOutcome {
            loading,
            measured_power_kw,
            decision,
            commands,
            evaluated_at: Utc::now(),
        };
        *self.last_outcome.write() = Some(outcome.clone());

        if failed.is_empty() {
            Ok(outcome)
        } else {
            Err(ControlError::Step { failed, reason })
        }
    }

    /// Setpoints to apply this step, in registration order.
    fn plan(&self, decision: Decision) -> Vec<(AssetId, f64)> {
        let chargers = self
            .registry
            .list(Some(AssetKind::EvCharger))
            .into_iter()
            .filter(|a| a.is_controllable_ev());

        match decision {
            Decision::Curtail => chargers
                .map(|a| (a.id, a.current_power_kw * CURTAILMENT_FACTOR))
                .collect(),
            Decision::Restore => chargers
                .filter_map(|a| {
                    let target = a.max_power_kw * RESTORE_FRACTION;
                    (a.current_power_kw < target).then_some((a.id, target))
                })
                .collect(),
            Decision::Hold => Vec::new(),
        }
    }

    async fn send_setpoint(
        &self,
        transport: &dyn Transport,
        asset_id: &AssetId,
        power_kw: f64,
    ) -> Result<(), TransportError> {
        let command = SetPowerCommand::new(asset_id.clone(), power_kw);
        let payload = serde_json::to_vec(&command)?;
        transport.publish(&self.topics.commands(asset_id), payload).await
    }

    /// Idle → Running. Spawns the periodic task; the first step runs immediately.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, ControlError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                LoopPhase::Idle => *phase = LoopPhase::Running,
                LoopPhase::Running => return Err(ControlError::AlreadyStarted),
                LoopPhase::Stopped => return Err(ControlError::Stopped),
            }
        }
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run().await }))
    }

    /// Running → Stopped. Takes effect at the next wake-up; a step in flight
    /// completes first. A no-op unless running.
    pub fn stop(&self) {
        let mut phase = self.phase.lock();
        if *phase != LoopPhase::Running {
            return;
        }
        *phase = LoopPhase::Stopped;
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        info!(feeder_id = %self.settings.feeder_id, "control loop stop requested");
    }

    async fn run(self: Arc<Self>) {
        info!(
            feeder_id = %self.settings.feeder_id,
            interval_secs = self.settings.interval.as_secs(),
            threshold = self.settings.loading_threshold,
            "control loop started"
        );

        while self.running.load(Ordering::SeqCst) {
            // Each step runs in its own task so a panic is contained like an error.
            let this = Arc::clone(&self);
            match tokio::spawn(async move { this.step().await }).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(feeder_id = %self.settings.feeder_id, error = %e, "control step failed")
                }
                Err(e) => {
                    error!(feeder_id = %self.settings.feeder_id, error = %e, "control step aborted")
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        info!(feeder_id = %self.settings.feeder_id, "control loop stopped");
    }

    pub async fn close_transport(&self) {
        if let Some(transport) = &self.transport {
            transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_feeder_loading_examples() {
        assert_eq!(feeder_loading(900.0, 1000.0), 0.9);
        assert_eq!(feeder_loading(0.0, 1000.0), 0.0);
        assert_eq!(feeder_loading(2500.0, 1000.0), 1.0);
        assert_eq!(feeder_loading(-50.0, 1000.0), 0.0);
        assert_eq!(feeder_loading(100.0, 0.0), 0.0);
        assert_eq!(feeder_loading(f64::INFINITY, 1000.0), 1.0);
        assert_eq!(feeder_loading(f64::NAN, 1000.0), 0.0);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = ControlSettings::default();
        assert_eq!(settings.feeder_id, "feeder-001");
        assert_eq!(settings.interval, Duration::from_secs(300));
        assert_eq!(settings.loading_threshold, 0.85);
        assert_eq!(settings.rated_capacity_kw, 1000.0);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(LoopPhase::Running.to_string(), "running");
        assert_eq!(Decision::Curtail.to_string(), "curtail");
    }

    proptest! {
        #[test]
        fn prop_loading_in_unit_interval(measured in 0.0f64..1.0e7, rated in 1.0f64..1.0e5) {
            let loading = feeder_loading(measured, rated);
            prop_assert!((0.0..=1.0).contains(&loading));
            prop_assert_eq!(loading, (measured / rated).min(1.0));
        }
    }
}
