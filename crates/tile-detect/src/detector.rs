//! Fault detector: metric thresholds and heartbeat-gap detection.

use serde_json::json;
use std::collections::HashMap;
use tile_proto::{FaultEvent, FaultKind, FaultSeverity, HalMessage, Heartbeat, TileMetrics, now_ts};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FaultDetectorConfig {
    /// Silence longer than this marks a node as missing its heartbeat.
    pub heartbeat_timeout_ms: u64,
    /// Accumulated error count at or above this emits a major fault.
    pub error_threshold: f64,
}

impl Default for FaultDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 200,
            error_threshold: 3.0,
        }
    }
}

/// Consumes telemetry and emits fault events onto a channel sink.
///
/// Tracks per-node last-seen timestamps and metrics. Heartbeats and snapshot
/// bodies both count as sightings; everything else passes through untouched.
pub struct FaultDetector {
    cfg: FaultDetectorConfig,
    rx: mpsc::UnboundedReceiver<HalMessage>,
    faults: mpsc::UnboundedSender<FaultEvent>,
    last_seen: HashMap<String, f64>,
    last_reported: HashMap<String, f64>,
    last_metrics: HashMap<String, TileMetrics>,
}

impl FaultDetector {
    pub fn new(
        cfg: FaultDetectorConfig,
        rx: mpsc::UnboundedReceiver<HalMessage>,
        faults: mpsc::UnboundedSender<FaultEvent>,
    ) -> Self {
        Self {
            cfg,
            rx,
            faults,
            last_seen: HashMap::new(),
            last_reported: HashMap::new(),
            last_metrics: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let msg = tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            self.process(&msg);
        }
    }

    /// Ingest one message, then sweep all known nodes for heartbeat gaps.
    pub fn process(&mut self, msg: &HalMessage) {
        match msg {
            HalMessage::Heartbeat(hb) => self.ingest(hb),
            HalMessage::StatusSnapshot(snapshot) => {
                for hb in snapshot.nodes.values() {
                    self.ingest(hb);
                }
            }
            _ => {}
        }
        self.sweep_heartbeats();
    }

    fn ingest(&mut self, hb: &Heartbeat) {
        let ts = if hb.timestamp > 0.0 { hb.timestamp } else { now_ts() };
        self.last_seen.insert(hb.node_id.clone(), ts);
        self.last_reported.remove(&hb.node_id);
        self.last_metrics.insert(hb.node_id.clone(), hb.metrics.clone());

        let error_count = hb.metrics.error_count;
        let status_code = hb.metrics.status_code.unwrap_or(0);
        if error_count >= self.cfg.error_threshold {
            self.emit(FaultEvent {
                fault_id: format!("fault_{}_{}", hb.node_id, ts as i64),
                node_id: hb.node_id.clone(),
                fault_type: FaultKind::Other("error_count_exceeded".to_string()),
                severity: FaultSeverity::Major,
                timestamp: ts,
                evidence: evidence(&[
                    ("error_count", json!(error_count)),
                    ("status_code", json!(status_code)),
                    ("load", json!(hb.metrics.load)),
                    ("temp_c", json!(hb.metrics.temp_c)),
                ]),
            });
        } else if status_code != 0 {
            self.emit(FaultEvent {
                fault_id: format!("fault_{}_{}", hb.node_id, ts as i64),
                node_id: hb.node_id.clone(),
                fault_type: FaultKind::Other("status_nonzero".to_string()),
                severity: FaultSeverity::Minor,
                timestamp: ts,
                evidence: evidence(&[
                    ("error_count", json!(error_count)),
                    ("status_code", json!(status_code)),
                ]),
            });
        }
    }

    /// One pass over every known node. A silent node produces exactly one
    /// event per pass; the reported mark rate-limits re-emission to one event
    /// per timeout interval while severity escalates with the true silence
    /// (critical once the gap exceeds five timeouts).
    fn sweep_heartbeats(&mut self) {
        let now = now_ts();
        let timeout_ms = self.cfg.heartbeat_timeout_ms as f64;
        let mut missing = Vec::new();
        for (node, last) in &self.last_seen {
            let delta_ms = (now - last) * 1000.0;
            if delta_ms <= timeout_ms {
                continue;
            }
            let reported = self.last_reported.get(node).copied().unwrap_or(*last);
            if (now - reported) * 1000.0 <= timeout_ms {
                continue;
            }
            let severity = if delta_ms > 5.0 * timeout_ms {
                FaultSeverity::Critical
            } else {
                FaultSeverity::Major
            };
            missing.push(FaultEvent {
                fault_id: format!("hb_miss_{}_{}", node, now as i64),
                node_id: node.clone(),
                fault_type: FaultKind::MissingHeartbeat,
                severity,
                timestamp: now,
                evidence: evidence(&[("last_seen_ms_ago", json!(delta_ms))]),
            });
        }
        for event in missing {
            self.last_reported.insert(event.node_id.clone(), now);
            self.emit(event);
        }
    }

    /// Last metrics reported by a node, if any.
    pub fn node_metrics(&self, node_id: &str) -> Option<&TileMetrics> {
        self.last_metrics.get(node_id)
    }

    pub fn known_nodes(&self) -> usize {
        self.last_seen.len()
    }

    fn emit(&self, event: FaultEvent) {
        debug!(
            node = %event.node_id,
            fault = %event.fault_type,
            severity = %event.severity,
            "fault detected"
        );
        if self.faults.send(event).is_err() {
            // A closed sink must never take the detector loop down with it.
            warn!("fault sink closed; event dropped");
        }
    }
}

fn evidence(entries: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
