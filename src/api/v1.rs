use axum::{
    routing::{get, post},
    Router,
};

use crate::{
    api::{assets, status},
    controller::AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/assets", get(assets::list_assets))
        .route("/assets/ev-chargers", post(assets::register_ev_charger))
        .route("/assets/pv-batteries", post(assets::register_pv_battery))
        .route("/assets/:id", get(assets::get_asset))
        .route("/feeder/status", get(status::get_feeder_status))
        .with_state(state)
}
