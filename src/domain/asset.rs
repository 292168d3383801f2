use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString};

/// Kind of distributed energy resource attached to the feeder
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AssetKind {
    EvCharger,
    PvBattery,
}

impl AssetKind {
    /// Prefix used when minting asset ids (`ev-1a2b3c4d`, `pv-...`)
    pub fn id_prefix(&self) -> &'static str {
        match self {
            AssetKind::EvCharger => "ev",
            AssetKind::PvBattery => "pv",
        }
    }
}

/// Opaque, registry-minted asset identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A controllable (or observable) power asset on the feeder.
///
/// `min_power_kw <= current_power_kw <= max_power_kw` holds after every
/// mutation made through [`Asset::apply_power`] and [`Asset::apply_limits`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub kind: AssetKind,
    pub name: String,
    pub rated_power_kw: f64,
    pub current_power_kw: f64,
    pub max_power_kw: f64,
    pub min_power_kw: f64,
    pub controllable: bool,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(
        id: AssetId,
        kind: AssetKind,
        name: impl Into<String>,
        rated_power_kw: f64,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            rated_power_kw,
            current_power_kw: 0.0,
            max_power_kw: rated_power_kw,
            min_power_kw: 0.0,
            controllable: true,
            properties,
            registered_at: Utc::now(),
        }
    }

    /// Clamp `requested_kw` into `[min_power_kw, max_power_kw]` and store it.
    /// Returns the value actually applied.
    pub fn apply_power(&mut self, requested_kw: f64) -> f64 {
        let applied = if requested_kw.is_nan() {
            self.min_power_kw
        } else {
            requested_kw.clamp(self.min_power_kw, self.max_power_kw)
        };
        self.current_power_kw = applied;
        applied
    }

    /// Replace the operating window and re-clamp the current setpoint into it.
    pub fn apply_limits(&mut self, min_kw: f64, max_kw: f64) {
        self.min_power_kw = min_kw;
        self.max_power_kw = max_kw;
        let current = self.current_power_kw;
        self.apply_power(current);
    }

    pub fn is_controllable_ev(&self) -> bool {
        self.controllable && self.kind == AssetKind::EvCharger
    }
}
