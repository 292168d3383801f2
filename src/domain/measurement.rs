use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AssetId;

/// Latest telemetry reported by one asset.
///
/// The raw payload is retained verbatim; `power_kw` is lifted out of
/// `data.power_kw` when the message is received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub asset_id: AssetId,
    pub payload: Value,
    pub power_kw: f64,
    pub source_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl Measurement {
    /// Build a measurement from a decoded bus payload.
    ///
    /// Returns `None` when the payload carries no usable `asset_id`.
    pub fn from_payload(payload: Value) -> Option<Self> {
        let asset_id = payload
            .get("asset_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(AssetId::from)?;

        let power_kw = payload
            .get("data")
            .and_then(|d| d.get("power_kw"))
            .and_then(Value::as_f64)
            .filter(|p| p.is_finite())
            .unwrap_or(0.0);

        let source_time = payload.get("timestamp").and_then(parse_timestamp);

        Some(Self {
            asset_id,
            payload,
            power_kw,
            source_time,
            received_at: Utc::now(),
        })
    }
}

/// Accepts epoch seconds (integer or fractional) or an RFC 3339 string.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Outbound setpoint command, published on `feeder/{feeder_id}/commands/{asset_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPowerCommand {
    pub asset_id: AssetId,
    pub command: String,
    pub power_kw: f64,
    /// Unix epoch seconds at which the command was issued
    pub timestamp: f64,
}

impl SetPowerCommand {
    pub const COMMAND: &'static str = "set_power";

    pub fn new(asset_id: AssetId, power_kw: f64) -> Self {
        Self {
            asset_id,
            command: Self::COMMAND.to_string(),
            power_kw,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}
