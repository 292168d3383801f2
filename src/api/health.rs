use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::controller::{AppState, LoopPhase};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

/// Individual health checks
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    controller: ComponentHealth,
    message_bus: ComponentHealth,
}

/// Health status of a component
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: "healthy",
            detail: None,
        }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: "degraded",
            detail: Some(detail.into()),
        }
    }
}

/// GET /health - Liveness check
///
/// Always answers `ok` while the process serves requests; the component
/// checks tell whether the controller is running and the bus is reachable.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let controller = match state.control.phase() {
        LoopPhase::Running => ComponentHealth::healthy(),
        phase => ComponentHealth::degraded(format!("control loop {phase}")),
    };
    let message_bus = if state.control.transport_connected() {
        ComponentHealth::healthy()
    } else {
        ComponentHealth::degraded("no broker connection, control actions disabled")
    };

    let response = HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now(),
        checks: HealthChecks {
            controller,
            message_bus,
        },
    };

    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_health_healthy() {
        let health = ComponentHealth::healthy();
        assert_eq!(health.status, "healthy");
        assert!(health.detail.is_none());
    }

    #[test]
    fn test_component_health_degraded() {
        let health = ComponentHealth::degraded("control loop idle");
        assert_eq!(health.status, "degraded");
        assert_eq!(health.detail.as_deref(), Some("control loop idle"));
    }
}
