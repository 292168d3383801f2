use anyhow::Result;
use der_ev_orchestrator::{api, config, controller, telemetry};
use config::Config;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;

    let app_state = controller::AppState::new(&cfg).await?;

    let app = api::router(app_state.clone(), &cfg);

    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!("Server binding to 0.0.0.0 - registration API is reachable from the network");
    }

    info!(%addr, feeder_id = %cfg.controller.feeder_id, "starting DER + EV orchestrator");

    let control_task = controller::spawn_controller_tasks(&app_state)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    app_state.shutdown().await;
    if let Err(e) = control_task.await {
        warn!(error = %e, "control loop task ended abnormally");
    }

    warn!("shutdown complete");
    Ok(())
}
