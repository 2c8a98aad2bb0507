//! Single-tile physical model and forced-fault state.

use rand::Rng;
use serde_json::Value;
use tile_proto::{FaultKind, Heartbeat, TileMetrics, TileStatus, now_ts};

const BASE_TEMP_C: f64 = 40.0;

#[derive(Debug, Clone)]
struct ForcedFault {
    kind: FaultKind,
    until: Option<f64>,
}

/// A reconfigurable compute region with its own metrics and status.
///
/// All operations are synchronous and atomic per call; the owning board
/// serializes access.
#[derive(Debug, Clone)]
pub struct Tile {
    pub tile_id: String,
    pub function: String,
    pub status: TileStatus,
    pub metrics: TileMetrics,
    pub last_heartbeat: f64,
    pub pr_loaded: Option<String>,
    pub is_spare: bool,
    forced_fault: Option<ForcedFault>,
}

impl Tile {
    pub fn new(tile_id: impl Into<String>) -> Self {
        Self {
            tile_id: tile_id.into(),
            function: "generic".to_string(),
            status: TileStatus::Ok,
            metrics: TileMetrics::default(),
            last_heartbeat: now_ts(),
            pr_loaded: None,
            is_spare: false,
            forced_fault: None,
        }
    }

    /// Serializable heartbeat body for this tile.
    pub fn snapshot(&self) -> Heartbeat {
        Heartbeat {
            node_id: self.tile_id.clone(),
            timestamp: now_ts(),
            metrics: self.metrics.clone(),
            status: self.status,
        }
    }

    /// Force a fault onto the tile with an immediate side effect. A `None`
    /// duration means the fault never expires on its own.
    pub fn apply_fault(
        &mut self,
        kind: FaultKind,
        duration: Option<std::time::Duration>,
        params: &serde_json::Map<String, Value>,
    ) {
        let until = duration.map(|d| now_ts() + d.as_secs_f64());

        match &kind {
            FaultKind::MissingHeartbeat => {
                // Tile stops producing heartbeats entirely.
                self.status = TileStatus::Failed;
                self.metrics.error_count += param_f64(params, "increase", 3.0);
            }
            FaultKind::StuckOutput => {
                self.metrics.error_count += param_f64(params, "increase", 5.0);
                self.status = TileStatus::Degraded;
            }
            FaultKind::Overheat => {
                self.metrics.temp_c += param_f64(params, "delta", 15.0);
                self.status = TileStatus::Degraded;
            }
            FaultKind::CrcMismatch => {
                self.metrics.last_output_crc = random_crc();
                self.metrics.error_count += param_f64(params, "increase", 1.0);
                self.status = TileStatus::Degraded;
            }
            FaultKind::TelemetryNoise => {
                self.metrics.temp_c += rand::thread_rng().gen_range(-5.0..5.0);
                self.metrics.error_count += 0.5;
                self.status = TileStatus::Degraded;
            }
            FaultKind::Other(_) => {
                self.metrics.error_count += 1.0;
                self.status = TileStatus::Degraded;
            }
        }

        self.forced_fault = Some(ForcedFault { kind, until });
    }

    /// Clear the forced fault and let the tile recover. Error count drops by
    /// one notch; non-spare tiles return to `ok`.
    pub fn clear_fault(&mut self) {
        self.forced_fault = None;
        if self.status != TileStatus::Spare {
            self.status = TileStatus::Ok;
        }
        self.metrics.error_count = (self.metrics.error_count - 1.0).max(0.0);
    }

    pub fn has_active_fault(&self) -> bool {
        self.forced_fault.is_some()
    }

    /// Whether the tile is currently producing heartbeats. Expired
    /// `missing_heartbeat` faults are cleared as a side effect.
    pub fn has_heartbeat(&mut self) -> bool {
        if let Some(fault) = &self.forced_fault {
            if fault.kind == FaultKind::MissingHeartbeat {
                if let Some(until) = fault.until {
                    if now_ts() > until {
                        self.clear_fault();
                        return true;
                    }
                }
                return false;
            }
        }
        true
    }

    /// One step of the physical model: fault expiry, thermal drift toward the
    /// base temperature, and slow error decay while no fault is forced.
    pub fn tick(&mut self) {
        if let Some(until) = self.forced_fault.as_ref().and_then(|f| f.until) {
            if now_ts() > until {
                self.clear_fault();
            }
        }

        let load = self.metrics.load;
        let mut temp = self.metrics.temp_c;
        temp += (load * 0.5) * 0.02;
        temp += (BASE_TEMP_C - temp) * 0.01;
        self.metrics.temp_c = (temp * 100.0).round() / 100.0;

        if self.forced_fault.is_none() && self.metrics.error_count > 0.0 {
            self.metrics.error_count = (self.metrics.error_count - 0.05).max(0.0);
        }
    }
}

fn param_f64(params: &serde_json::Map<String, Value>, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn random_crc() -> String {
    format!("{:#x}", rand::thread_rng().gen_range(0u32..=0xffff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn params(entries: &[(&str, f64)]) -> serde_json::Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn new_tile_starts_healthy() {
        let tile = Tile::new("tile_0");
        assert_eq!(tile.status, TileStatus::Ok);
        assert_eq!(tile.metrics.temp_c, 40.0);
        assert_eq!(tile.metrics.error_count, 0.0);
        assert!(!tile.is_spare);
        assert!(tile.pr_loaded.is_none());
    }

    #[test]
    fn missing_heartbeat_fails_tile_and_silences_it() {
        let mut tile = Tile::new("tile_1");
        tile.apply_fault(FaultKind::MissingHeartbeat, None, &Default::default());
        assert_eq!(tile.status, TileStatus::Failed);
        assert_eq!(tile.metrics.error_count, 3.0);
        assert!(!tile.has_heartbeat());
    }

    #[test]
    fn missing_heartbeat_expires_and_clears() {
        let mut tile = Tile::new("tile_1");
        tile.apply_fault(
            FaultKind::MissingHeartbeat,
            Some(Duration::from_millis(1)),
            &Default::default(),
        );
        assert!(!tile.has_heartbeat());
        std::thread::sleep(Duration::from_millis(10));
        assert!(tile.has_heartbeat());
        assert_eq!(tile.status, TileStatus::Ok);
        // error_count dropped by one notch on clear: 3 - 1
        assert_eq!(tile.metrics.error_count, 2.0);
    }

    #[test]
    fn stuck_output_honors_increase_param() {
        let mut tile = Tile::new("tile_2");
        tile.apply_fault(FaultKind::StuckOutput, None, &params(&[("increase", 2.0)]));
        assert_eq!(tile.metrics.error_count, 2.0);
        assert_eq!(tile.status, TileStatus::Degraded);
        assert!(tile.has_heartbeat(), "only missing_heartbeat silences a tile");
    }

    #[test]
    fn overheat_bumps_temperature() {
        let mut tile = Tile::new("tile_3");
        tile.apply_fault(FaultKind::Overheat, None, &Default::default());
        assert_eq!(tile.metrics.temp_c, 55.0);
        assert_eq!(tile.status, TileStatus::Degraded);
    }

    #[test]
    fn crc_mismatch_rewrites_crc() {
        let mut tile = Tile::new("tile_4");
        tile.apply_fault(FaultKind::CrcMismatch, None, &Default::default());
        assert!(tile.metrics.last_output_crc.starts_with("0x"));
        assert!(u32::from_str_radix(&tile.metrics.last_output_crc[2..], 16).is_ok());
        assert_eq!(tile.metrics.error_count, 1.0);
        assert_eq!(tile.status, TileStatus::Degraded);
    }

    #[test]
    fn opaque_fault_degrades_generically() {
        let mut tile = Tile::new("tile_5");
        tile.apply_fault(
            FaultKind::Other("cosmic_ray".to_string()),
            None,
            &Default::default(),
        );
        assert_eq!(tile.metrics.error_count, 1.0);
        assert_eq!(tile.status, TileStatus::Degraded);
    }

    #[test]
    fn tick_pulls_temperature_toward_base() {
        let mut tile = Tile::new("tile_6");
        tile.metrics.temp_c = 60.0;
        for _ in 0..500 {
            tile.tick();
        }
        assert!(tile.metrics.temp_c < 41.0, "temp {}", tile.metrics.temp_c);
        assert!(tile.metrics.temp_c >= 39.0);
    }

    #[test]
    fn temperature_stays_bounded_under_load() {
        let mut tile = Tile::new("tile_7");
        tile.metrics.load = 1.0;
        for _ in 0..2000 {
            tile.tick();
        }
        // Steady state sits near base + load/2; never runs away.
        assert!(tile.metrics.temp_c > 30.0 && tile.metrics.temp_c < 60.0);
    }

    #[test]
    fn error_count_decays_to_floor() {
        let mut tile = Tile::new("tile_8");
        tile.apply_fault(FaultKind::StuckOutput, None, &Default::default());
        tile.clear_fault();
        // 5 on injection, -1 on clear = 4.0; decay 0.05/tick
        assert_eq!(tile.metrics.error_count, 4.0);
        for _ in 0..20 {
            tile.tick();
        }
        assert!((tile.metrics.error_count - 3.0).abs() < 1e-6);
        for _ in 0..200 {
            tile.tick();
        }
        assert_eq!(tile.metrics.error_count, 0.0, "floor at zero");
    }

    #[test]
    fn error_count_frozen_while_fault_active() {
        let mut tile = Tile::new("tile_9");
        tile.apply_fault(FaultKind::StuckOutput, None, &Default::default());
        for _ in 0..10 {
            tile.tick();
        }
        assert_eq!(tile.metrics.error_count, 5.0);
    }

    #[test]
    fn snapshot_carries_current_state() {
        let mut tile = Tile::new("tile_10");
        tile.apply_fault(FaultKind::Overheat, None, &Default::default());
        let hb = tile.snapshot();
        assert_eq!(hb.node_id, "tile_10");
        assert_eq!(hb.status, TileStatus::Degraded);
        assert_eq!(hb.metrics.temp_c, 55.0);
        assert!(hb.timestamp > 0.0);
    }
}
