use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::IntoEnumIterator;
use validator::Validate;

use crate::{
    api::error::ApiError,
    controller::AppState,
    domain::{Asset, AssetId, AssetKind},
};

/// Body of `POST /assets/ev-chargers` and `POST /assets/pv-batteries`
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterAssetRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub rated_power_kw: f64,
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
pub struct RegisteredAsset {
    pub asset_id: AssetId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub rated_power_kw: f64,
    pub registered_at: DateTime<Utc>,
}

impl From<Asset> for RegisteredAsset {
    fn from(a: Asset) -> Self {
        Self {
            asset_id: a.id,
            name: a.name,
            kind: a.kind,
            rated_power_kw: a.rated_power_kw,
            registered_at: a.registered_at,
        }
    }
}

/// Entry of `GET /assets`
#[derive(Debug, Serialize)]
pub struct AssetSummary {
    pub id: AssetId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub rated_power_kw: f64,
    pub current_power_kw: f64,
    pub registered_at: DateTime<Utc>,
}

impl From<Asset> for AssetSummary {
    fn from(a: Asset) -> Self {
        Self {
            id: a.id,
            name: a.name,
            kind: a.kind,
            rated_power_kw: a.rated_power_kw,
            current_power_kw: a.current_power_kw,
            registered_at: a.registered_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AssetListResponse {
    pub assets: Vec<AssetSummary>,
}

/// Full record returned by `GET /assets/:id`
#[derive(Debug, Serialize)]
pub struct AssetDetail {
    pub id: AssetId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub rated_power_kw: f64,
    pub current_power_kw: f64,
    pub max_power_kw: f64,
    pub min_power_kw: f64,
    pub controllable: bool,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
}

impl From<Asset> for AssetDetail {
    fn from(a: Asset) -> Self {
        Self {
            id: a.id,
            name: a.name,
            kind: a.kind,
            rated_power_kw: a.rated_power_kw,
            current_power_kw: a.current_power_kw,
            max_power_kw: a.max_power_kw,
            min_power_kw: a.min_power_kw,
            controllable: a.controllable,
            properties: a.properties,
            registered_at: a.registered_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListAssetsQuery {
    pub asset_type: Option<String>,
}

/// POST /api/v1/assets/ev-chargers
pub async fn register_ev_charger(
    State(state): State<AppState>,
    Json(request): Json<RegisterAssetRequest>,
) -> Result<(StatusCode, Json<RegisteredAsset>), ApiError> {
    register(&state, AssetKind::EvCharger, request)
}

/// POST /api/v1/assets/pv-batteries
pub async fn register_pv_battery(
    State(state): State<AppState>,
    Json(request): Json<RegisterAssetRequest>,
) -> Result<(StatusCode, Json<RegisteredAsset>), ApiError> {
    register(&state, AssetKind::PvBattery, request)
}

fn register(
    state: &AppState,
    kind: AssetKind,
    request: RegisterAssetRequest,
) -> Result<(StatusCode, Json<RegisteredAsset>), ApiError> {
    request.validate()?;
    let asset = state.registry.register(
        kind,
        request.name,
        request.rated_power_kw,
        request.properties.unwrap_or_default(),
    )?;
    Ok((StatusCode::OK, Json(asset.into())))
}

/// GET /api/v1/assets?asset_type=ev_charger
pub async fn list_assets(
    State(state): State<AppState>,
    Query(query): Query<ListAssetsQuery>,
) -> Result<Json<AssetListResponse>, ApiError> {
    let kind = match query.asset_type.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(AssetKind::from_str(raw).map_err(|_| {
            let valid: Vec<String> = AssetKind::iter().map(|k| k.to_string()).collect();
            ApiError::BadRequest(format!(
                "Invalid asset_type: {raw}. Must be one of: {}",
                valid.join(", ")
            ))
        })?),
    };

    let assets = state
        .registry
        .list(kind)
        .into_iter()
        .map(AssetSummary::from)
        .collect();

    Ok(Json(AssetListResponse { assets }))
}

/// GET /api/v1/assets/:id
pub async fn get_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AssetDetail>, ApiError> {
    state
        .registry
        .get(&AssetId::new(id.clone()))
        .map(|a| Json(a.into()))
        .ok_or_else(|| ApiError::NotFound(format!("Asset with ID {id} not found")))
}
