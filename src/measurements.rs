//! Telemetry cache and inbound measurement ingest.
//!
//! The cache keeps the latest [`Measurement`] per asset. Writes are
//! last-write-wins unless the stale guard is enabled, in which case a
//! measurement whose source timestamp is older than the cached one is dropped.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{AssetId, Measurement};
use crate::transport::InboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Stored,
    Stale,
}

#[derive(Debug, Default)]
pub struct MeasurementCache {
    entries: RwLock<BTreeMap<AssetId, Measurement>>,
    reject_stale: bool,
}

impl MeasurementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that refuses measurements older than the one already held.
    pub fn with_stale_guard() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            reject_stale: true,
        }
    }

    pub fn record(&self, measurement: Measurement) -> RecordOutcome {
        let mut entries = self.entries.write();
        if self.reject_stale {
            let held = entries.get(&measurement.asset_id).and_then(|m| m.source_time);
            if let (Some(held), Some(incoming)) = (held, measurement.source_time) {
                if incoming < held {
                    return RecordOutcome::Stale;
                }
            }
        }
        entries.insert(measurement.asset_id.clone(), measurement);
        RecordOutcome::Stored
    }

    /// Point-in-time copy ordered by asset id.
    pub fn snapshot(&self) -> Vec<(AssetId, Measurement)> {
        self.entries
            .read()
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect()
    }

    pub fn get(&self, id: &AssetId) -> Option<Measurement> {
        self.entries.read().get(id).cloned()
    }

    /// Sum of `power_kw` across every cached measurement.
    pub fn total_power_kw(&self) -> f64 {
        self.entries.read().values().map(|m| m.power_kw).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Route one inbound bus message into the cache. Payloads without an
/// `asset_id` are ignored.
pub fn handle_measurement(cache: &MeasurementCache, msg: InboundMessage) {
    let Some(measurement) = Measurement::from_payload(msg.payload) else {
        warn!(topic = %msg.topic, "measurement without asset_id ignored");
        return;
    };
    let asset_id = measurement.asset_id.clone();
    let power_kw = measurement.power_kw;
    match cache.record(measurement) {
        RecordOutcome::Stored => debug!(%asset_id, power_kw, "measurement cached"),
        RecordOutcome::Stale => {
            warn!(%asset_id, topic = %msg.topic, "out-of-order measurement dropped")
        }
    }
}

/// Drain the inbound channel into the cache until every sender is gone.
pub fn spawn_ingest(
    cache: Arc<MeasurementCache>,
    mut rx: mpsc::Receiver<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            handle_measurement(&cache, msg);
        }
        info!("measurement ingest stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(asset_id: &str, power_kw: f64) -> InboundMessage {
        InboundMessage {
            topic: format!("feeder/f1/measurements/{asset_id}"),
            payload: json!({ "asset_id": asset_id, "data": { "power_kw": power_kw } }),
        }
    }

    fn timed(asset_id: &str, power_kw: f64, ts: i64) -> Measurement {
        Measurement::from_payload(json!({
            "asset_id": asset_id,
            "timestamp": ts,
            "data": { "power_kw": power_kw }
        }))
        .unwrap()
    }

    #[test]
    fn test_last_write_wins() {
        let cache = MeasurementCache::new();
        handle_measurement(&cache, msg("ev-1", 10.0));
        handle_measurement(&cache, msg("ev-1", 12.0));
        handle_measurement(&cache, msg("ev-2", 3.0));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&AssetId::from("ev-1")).unwrap().power_kw, 12.0);
        assert_eq!(cache.total_power_kw(), 15.0);
    }

    #[test]
    fn test_default_cache_accepts_out_of_order() {
        let cache = MeasurementCache::new();
        cache.record(timed("ev-1", 10.0, 2_000));
        assert_eq!(cache.record(timed("ev-1", 7.0, 1_000)), RecordOutcome::Stored);
        assert_eq!(cache.get(&AssetId::from("ev-1")).unwrap().power_kw, 7.0);
    }

    #[test]
    fn test_stale_guard_drops_older() {
        let cache = MeasurementCache::with_stale_guard();
        cache.record(timed("ev-1", 10.0, 2_000));
        assert_eq!(cache.record(timed("ev-1", 7.0, 1_000)), RecordOutcome::Stale);
        assert_eq!(cache.record(timed("ev-1", 9.0, 3_000)), RecordOutcome::Stored);
        assert_eq!(cache.get(&AssetId::from("ev-1")).unwrap().power_kw, 9.0);
    }

    #[test]
    fn test_id_less_payload_ignored() {
        let cache = MeasurementCache::new();
        handle_measurement(
            &cache,
            InboundMessage {
                topic: "feeder/f1/measurements/ev-9".into(),
                payload: json!({ "data": { "power_kw": 99.0 } }),
            },
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_copy() {
        let cache = MeasurementCache::new();
        handle_measurement(&cache, msg("pv-2", 1.0));
        handle_measurement(&cache, msg("ev-1", 2.0));
        let snap = cache.snapshot();
        handle_measurement(&cache, msg("ev-1", 50.0));
        let ids: Vec<_> = snap.iter().map(|(id, _)| id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["ev-1", "pv-2"]);
        assert_eq!(snap[0].1.power_kw, 2.0);
    }

    #[test]
    fn test_snapshot_never_sees_partial_record() {
        let cache = Arc::new(MeasurementCache::new());
        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..20_000u32 {
                    let id = format!("ev-{}", i % 16);
                    let m = Measurement::from_payload(json!({
                        "asset_id": id,
                        "data": { "power_kw": f64::from(i) }
                    }))
                    .unwrap();
                    cache.record(m);
                }
            })
        };

        for _ in 0..20_000 {
            for (id, m) in cache.snapshot() {
                assert_eq!(id, m.asset_id);
                assert_eq!(Some(m.power_kw), m.payload["data"]["power_kw"].as_f64());
            }
        }
        writer.join().unwrap();

        let snap = cache.snapshot();
        assert_eq!(snap.len(), 16);
        assert!(snap.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn test_ingest_task_drains_channel() {
        let cache = Arc::new(MeasurementCache::new());
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_ingest(cache.clone(), rx);
        for i in 0..10 {
            tx.send(msg(&format!("ev-{i}"), 1.0)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.total_power_kw(), 10.0);
    }
}
