use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::{feeder_loading, AppState, Decision, LoopPhase};
use crate::domain::AssetKind;

/// Feeder status response
#[derive(Debug, Serialize)]
pub struct FeederStatus {
    feeder_id: String,
    phase: LoopPhase,
    loading: f64,
    threshold: f64,
    rated_capacity_kw: f64,
    measured_power_kw: f64,
    measurement_count: usize,
    /// Sum of the setpoints currently held for EV chargers
    ev_setpoint_kw: f64,
    transport: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_step: Option<LastStep>,
}

/// Summary of the most recent control step
#[derive(Debug, Serialize)]
pub struct LastStep {
    evaluated_at: DateTime<Utc>,
    decision: Decision,
    loading: f64,
    commands_issued: usize,
}

/// GET /api/v1/feeder/status
pub async fn get_feeder_status(State(state): State<AppState>) -> Json<FeederStatus> {
    let settings = state.control.settings();
    let measured_power_kw = state.cache.total_power_kw();

    let last_step = state.control.last_outcome().map(|o| LastStep {
        evaluated_at: o.evaluated_at,
        decision: o.decision,
        loading: o.loading,
        commands_issued: o.commands.len(),
    });

    Json(FeederStatus {
        feeder_id: settings.feeder_id.clone(),
        phase: state.control.phase(),
        loading: feeder_loading(measured_power_kw, settings.rated_capacity_kw),
        threshold: settings.loading_threshold,
        rated_capacity_kw: settings.rated_capacity_kw,
        measured_power_kw,
        measurement_count: state.cache.len(),
        ev_setpoint_kw: state.registry.total_power(Some(AssetKind::EvCharger)),
        transport: if state.control.transport_connected() {
            "connected"
        } else {
            "unavailable"
        },
        last_step,
    })
}
