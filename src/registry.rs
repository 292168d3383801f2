//! Asset registry
//!
//! Owns every [`Asset`] known to the orchestrator. The asset table is guarded by
//! a read/write lock while each record sits behind its own mutex, so power
//! updates for different assets only ever share the read side of the table
//! lock, and updates to the same asset serialize on that asset's mutex.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Asset, AssetId, AssetKind};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Default)]
struct Table {
    order: Vec<AssetId>,
    assets: HashMap<AssetId, Arc<Mutex<Asset>>>,
    // ids of removed assets; never handed out again
    retired: HashSet<AssetId>,
}

#[derive(Default)]
pub struct AssetRegistry {
    table: RwLock<Table>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new asset with `current = 0`, `min = 0`, `max = rated`.
    pub fn register(
        &self,
        kind: AssetKind,
        name: impl Into<String>,
        rated_power_kw: f64,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Asset, RegistryError> {
        if !rated_power_kw.is_finite() || rated_power_kw <= 0.0 {
            return Err(RegistryError::InvalidArgument(format!(
                "rated_power_kw must be a positive number, got {rated_power_kw}"
            )));
        }

        let mut table = self.table.write();
        let id = loop {
            let candidate = mint_id(kind);
            if !table.assets.contains_key(&candidate) && !table.retired.contains(&candidate) {
                break candidate;
            }
            debug!(asset_id = %candidate, "asset id collision, minting another");
        };

        let asset = Asset::new(id.clone(), kind, name, rated_power_kw, properties);
        table.order.push(id.clone());
        table.assets.insert(id, Arc::new(Mutex::new(asset.clone())));

        info!(
            asset_id = %asset.id,
            kind = %asset.kind,
            rated_power_kw = asset.rated_power_kw,
            "asset registered"
        );
        Ok(asset)
    }

    pub fn get(&self, id: &AssetId) -> Option<Asset> {
        self.entry(id).map(|a| a.lock().clone())
    }

    /// Assets in registration order, optionally restricted to one kind.
    pub fn list(&self, kind: Option<AssetKind>) -> Vec<Asset> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|id| table.assets.get(id))
            .map(|a| a.lock().clone())
            .filter(|a| kind.map_or(true, |k| a.kind == k))
            .collect()
    }

    /// Clamp `requested_kw` into the asset's operating window and apply it.
    /// Returns `false` when the asset is unknown.
    pub fn set_power(&self, id: &AssetId, requested_kw: f64) -> bool {
        self.apply_power(id, requested_kw).is_some()
    }

    /// Like [`AssetRegistry::set_power`] but reports the clamped value applied.
    pub fn apply_power(&self, id: &AssetId, requested_kw: f64) -> Option<f64> {
        let asset = self.entry(id)?;
        let applied = asset.lock().apply_power(requested_kw);
        debug!(asset_id = %id, requested_kw, applied_kw = applied, "power setpoint applied");
        Some(applied)
    }

    pub fn total_power(&self, kind: Option<AssetKind>) -> f64 {
        self.list(kind).iter().map(|a| a.current_power_kw).sum()
    }

    /// Exclude or re-include an asset from curtailment and restoration.
    pub fn set_controllable(&self, id: &AssetId, controllable: bool) -> bool {
        match self.entry(id) {
            Some(asset) => {
                asset.lock().controllable = controllable;
                true
            }
            None => false,
        }
    }

    /// Narrow or widen the operating window. Bounds must satisfy
    /// `0 <= min <= max <= rated`; the current setpoint is re-clamped.
    pub fn set_power_limits(
        &self,
        id: &AssetId,
        min_kw: f64,
        max_kw: f64,
    ) -> Result<bool, RegistryError> {
        let Some(asset) = self.entry(id) else {
            return Ok(false);
        };
        let mut asset = asset.lock();
        if !(min_kw.is_finite() && max_kw.is_finite())
            || min_kw < 0.0
            || min_kw > max_kw
            || max_kw > asset.rated_power_kw
        {
            return Err(RegistryError::InvalidArgument(format!(
                "power limits [{min_kw}, {max_kw}] outside [0, {}]",
                asset.rated_power_kw
            )));
        }
        asset.apply_limits(min_kw, max_kw);
        Ok(true)
    }

    pub fn remove(&self, id: &AssetId) -> bool {
        let mut table = self.table.write();
        if table.assets.remove(id).is_none() {
            return false;
        }
        table.order.retain(|existing| existing != id);
        table.retired.insert(id.clone());
        info!(asset_id = %id, "asset removed");
        true
    }

    pub fn len(&self) -> usize {
        self.table.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: &AssetId) -> Option<Arc<Mutex<Asset>>> {
        self.table.read().assets.get(id).cloned()
    }
}

fn mint_id(kind: AssetKind) -> AssetId {
    let hex = Uuid::new_v4().simple().to_string();
    AssetId::new(format!("{}-{}", kind.id_prefix(), &hex[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn registry_with_charger(rated: f64) -> (AssetRegistry, AssetId) {
        let registry = AssetRegistry::new();
        let asset = registry
            .register(AssetKind::EvCharger, "Bay 1", rated, Default::default())
            .unwrap();
        (registry, asset.id)
    }

    #[rstest]
    #[case(AssetKind::EvCharger, "ev-")]
    #[case(AssetKind::PvBattery, "pv-")]
    fn test_register_mints_prefixed_id(#[case] kind: AssetKind, #[case] prefix: &str) {
        let registry = AssetRegistry::new();
        let asset = registry.register(kind, "x", 10.0, Default::default()).unwrap();
        assert!(asset.id.as_str().starts_with(prefix));
        assert_eq!(asset.id.as_str().len(), prefix.len() + 8);
        assert_eq!(asset.current_power_kw, 0.0);
        assert_eq!(asset.max_power_kw, 10.0);
    }

    #[rstest]
    #[case(0.0)]
    #[case(-5.0)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn test_register_rejects_bad_rating(#[case] rated: f64) {
        let registry = AssetRegistry::new();
        let err = registry
            .register(AssetKind::EvCharger, "bad", rated, Default::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_distinct_and_list_keeps_order() {
        let registry = AssetRegistry::new();
        let a = registry.register(AssetKind::EvCharger, "a", 11.0, Default::default()).unwrap();
        let b = registry.register(AssetKind::PvBattery, "b", 5.0, Default::default()).unwrap();
        let c = registry.register(AssetKind::EvCharger, "c", 22.0, Default::default()).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);

        let all: Vec<_> = registry.list(None).into_iter().map(|x| x.id).collect();
        assert_eq!(all, vec![a.id.clone(), b.id.clone(), c.id.clone()]);

        let evs: Vec<_> = registry
            .list(Some(AssetKind::EvCharger))
            .into_iter()
            .map(|x| x.id)
            .collect();
        assert_eq!(evs, vec![a.id, c.id]);
    }

    #[test]
    fn test_set_power_unknown_id() {
        let registry = AssetRegistry::new();
        assert!(!registry.set_power(&AssetId::from("ev-missing"), 5.0));
    }

    #[test]
    fn test_set_power_is_idempotent() {
        let (registry, id) = registry_with_charger(22.0);
        assert!(registry.set_power(&id, 30.0));
        let first = registry.get(&id).unwrap();
        assert!(registry.set_power(&id, 30.0));
        let second = registry.get(&id).unwrap();
        assert_eq!(first.current_power_kw, 22.0);
        assert_eq!(second.current_power_kw, first.current_power_kw);
    }

    #[test]
    fn test_total_power_with_filter() {
        let registry = AssetRegistry::new();
        let ev = registry.register(AssetKind::EvCharger, "ev", 50.0, Default::default()).unwrap();
        let pv = registry.register(AssetKind::PvBattery, "pv", 20.0, Default::default()).unwrap();
        registry.set_power(&ev.id, 40.0);
        registry.set_power(&pv.id, 15.0);
        assert_eq!(registry.total_power(None), 55.0);
        assert_eq!(registry.total_power(Some(AssetKind::EvCharger)), 40.0);
        assert_eq!(registry.total_power(Some(AssetKind::PvBattery)), 15.0);
    }

    #[test]
    fn test_set_power_limits() {
        let (registry, id) = registry_with_charger(22.0);
        registry.set_power(&id, 20.0);
        assert_eq!(registry.set_power_limits(&id, 4.0, 16.0), Ok(true));
        let asset = registry.get(&id).unwrap();
        assert_eq!(asset.current_power_kw, 16.0);
        assert_eq!(asset.min_power_kw, 4.0);

        registry.set_power(&id, 1.0);
        assert_eq!(registry.get(&id).unwrap().current_power_kw, 4.0);

        assert!(registry.set_power_limits(&id, 10.0, 5.0).is_err());
        assert!(registry.set_power_limits(&id, 0.0, 30.0).is_err());
        assert_eq!(
            registry.set_power_limits(&AssetId::from("nope"), 0.0, 1.0),
            Ok(false)
        );
    }

    #[test]
    fn test_remove_and_controllable() {
        let (registry, id) = registry_with_charger(22.0);
        assert!(registry.set_controllable(&id, false));
        assert!(!registry.get(&id).unwrap().controllable);
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(registry.get(&id).is_none());
        assert!(registry.list(None).is_empty());
    }

    #[test]
    fn test_concurrent_updates_to_different_assets() {
        let registry = Arc::new(AssetRegistry::new());
        let ids: Vec<_> = (0..8)
            .map(|i| {
                registry
                    .register(AssetKind::EvCharger, format!("bay {i}"), 100.0, Default::default())
                    .unwrap()
                    .id
            })
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, id)| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for step in 0..1000 {
                        registry.set_power(&id, ((i * 1000 + step) % 100) as f64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for (i, id) in ids.iter().enumerate() {
            let expected = ((i * 1000 + 999) % 100) as f64;
            assert_eq!(registry.get(id).unwrap().current_power_kw, expected);
        }
    }

    #[test]
    fn test_concurrent_updates_to_same_asset_stay_in_window() {
        let registry = Arc::new(AssetRegistry::new());
        let id = registry
            .register(AssetKind::EvCharger, "shared bay", 100.0, Default::default())
            .unwrap()
            .id;
        assert_eq!(registry.set_power_limits(&id, 10.0, 60.0), Ok(true));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for step in 0..2000 {
                        let requested = match (t + step) % 4 {
                            0 => -50.0,
                            1 => 250.0,
                            2 => f64::NAN,
                            _ => ((t * 7 + step) % 100) as f64,
                        };
                        registry.set_power(&id, requested);
                        let asset = registry.get(&id).unwrap();
                        assert!(
                            asset.min_power_kw <= asset.current_power_kw
                                && asset.current_power_kw <= asset.max_power_kw,
                            "setpoint {} escaped [{}, {}]",
                            asset.current_power_kw,
                            asset.min_power_kw,
                            asset.max_power_kw
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let asset = registry.get(&id).unwrap();
        assert!((10.0..=60.0).contains(&asset.current_power_kw));
    }

    proptest! {
        #[test]
        fn prop_set_power_clamps(
            rated in 0.1f64..1000.0,
            min_frac in 0.0f64..1.0,
            max_frac in 0.0f64..1.0,
            requested in -2000.0f64..2000.0,
        ) {
            let (registry, id) = registry_with_charger(rated);
            let (lo, hi) = (min_frac.min(max_frac), min_frac.max(max_frac));
            let (min_kw, max_kw) = (lo * rated, hi * rated);
            prop_assert_eq!(registry.set_power_limits(&id, min_kw, max_kw), Ok(true));
            prop_assert!(registry.set_power(&id, requested));
            let asset = registry.get(&id).unwrap();
            prop_assert_eq!(asset.current_power_kw, requested.clamp(min_kw, max_kw));
        }
    }
}
