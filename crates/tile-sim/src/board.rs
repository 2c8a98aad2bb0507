//! Board model — the tile collection, spare pool, and region map.

use crate::tile::Tile;
use crate::{SimError, SimResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tile_proto::{FaultKind, StatusSnapshot, TileStatus, now_ts};
use tracing::warn;

const DEFAULT_BITSTREAM_KB: u64 = 50;

/// Per-region reconfiguration metadata from the board map file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionInfo {
    #[serde(default = "default_bitstream_kb")]
    pub bitstream_kb: u64,
}

fn default_bitstream_kb() -> u64 {
    DEFAULT_BITSTREAM_KB
}

/// Load the optional region map. A missing file is an empty map; a malformed
/// file is logged and also treated as empty (non-fatal).
pub fn load_region_map(path: &Path) -> HashMap<String, RegionInfo> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_str(&data) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed region map");
            HashMap::new()
        }
    }
}

/// An ordered collection of tiles plus the designated spare pool.
///
/// Single-writer: only the simulator event loop mutates the board; callers in
/// a multi-threaded setup guard it with one mutex.
#[derive(Debug)]
pub struct Board {
    tiles: BTreeMap<String, Tile>,
    spares: Vec<String>,
    region_map: HashMap<String, RegionInfo>,
}

impl Board {
    /// Create `tile_0 … tile_{n-1}` and designate the last `spare_count` ids
    /// (in sorted order) as spares.
    pub fn new(
        tiles_count: usize,
        spare_count: usize,
        region_map: HashMap<String, RegionInfo>,
    ) -> Self {
        let mut tiles = BTreeMap::new();
        for i in 0..tiles_count {
            let id = format!("tile_{i}");
            tiles.insert(id.clone(), Tile::new(id));
        }

        let all_ids: Vec<String> = tiles.keys().cloned().collect();
        let mut spares = Vec::new();
        if spare_count > 0 {
            for id in all_ids.iter().rev().take(spare_count).rev() {
                if let Some(tile) = tiles.get_mut(id) {
                    tile.is_spare = true;
                    tile.pr_loaded = Some(format!("spare_{id}"));
                }
                spares.push(id.clone());
            }
        }

        Self {
            tiles,
            spares,
            region_map,
        }
    }

    pub fn tile(&self, tile_id: &str) -> Option<&Tile> {
        self.tiles.get(tile_id)
    }

    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    pub fn tiles_mut(&mut self) -> impl Iterator<Item = &mut Tile> {
        self.tiles.values_mut()
    }

    pub fn spares(&self) -> &[String] {
        &self.spares
    }

    /// Bitstream size for a region, defaulted and floored at 1 kb.
    pub fn bitstream_kb(&self, tile_id: &str) -> u64 {
        self.region_map
            .get(tile_id)
            .map(|r| r.bitstream_kb)
            .unwrap_or(DEFAULT_BITSTREAM_KB)
            .max(1)
    }

    /// Aggregate snapshot in sorted tile-id order. Tiles that are not
    /// currently producing heartbeats are absent, which is what lets the host
    /// observe their silence.
    pub fn get_snapshot(&mut self) -> StatusSnapshot {
        let timestamp = now_ts();
        let mut nodes = BTreeMap::new();
        for tile in self.tiles.values_mut() {
            if tile.has_heartbeat() {
                nodes.insert(tile.tile_id.clone(), tile.snapshot());
            }
        }
        StatusSnapshot { timestamp, nodes }
    }

    /// Advance the physics of every tile by one step.
    pub fn tick_all(&mut self) {
        for tile in self.tiles.values_mut() {
            tile.tick();
        }
    }

    pub fn inject_fault(
        &mut self,
        tile_id: &str,
        kind: FaultKind,
        duration: Option<Duration>,
        params: &serde_json::Map<String, Value>,
    ) -> SimResult<()> {
        let tile = self
            .tiles
            .get_mut(tile_id)
            .ok_or_else(|| SimError::UnknownTile(tile_id.to_string()))?;
        tile.apply_fault(kind, duration, params);
        Ok(())
    }

    pub fn clear_fault(&mut self, tile_id: &str) -> SimResult<()> {
        let tile = self
            .tiles
            .get_mut(tile_id)
            .ok_or_else(|| SimError::UnknownTile(tile_id.to_string()))?;
        tile.clear_fault();
        Ok(())
    }

    pub fn isolate(&mut self, tile_id: &str) -> SimResult<()> {
        let tile = self
            .tiles
            .get_mut(tile_id)
            .ok_or_else(|| SimError::UnknownTile(tile_id.to_string()))?;
        tile.status = TileStatus::Isolated;
        Ok(())
    }

    /// Move the target tile's logical module onto a spare and isolate the
    /// target. All checks run before the first mutation; a failed swap leaves
    /// the board untouched.
    pub fn perform_fast_swap(&mut self, target: &str, spare: &str) -> SimResult<()> {
        if !self.spares.iter().any(|s| s == spare) {
            return Err(SimError::NotASpare(spare.to_string()));
        }
        let (src_loaded, src_metrics) = match self.tiles.get(target) {
            Some(src) => (src.pr_loaded.clone(), src.metrics.clone()),
            None => return Err(SimError::UnknownTile(target.to_string())),
        };

        let dst = self
            .tiles
            .get_mut(spare)
            .ok_or_else(|| SimError::UnknownTile(spare.to_string()))?;
        dst.pr_loaded = Some(src_loaded.unwrap_or_else(|| format!("module_{target}")));
        dst.status = TileStatus::Ok;
        dst.metrics = src_metrics;

        if let Some(src) = self.tiles.get_mut(target) {
            src.status = TileStatus::Isolated;
            src.metrics.load = 0.0;
        }
        Ok(())
    }

    /// First spare whose status is currently `ok`.
    pub fn find_available_spare(&self) -> Option<&str> {
        self.spares
            .iter()
            .find(|s| {
                self.tiles
                    .get(s.as_str())
                    .is_some_and(|t| t.status == TileStatus::Ok)
            })
            .map(String::as_str)
    }
}
