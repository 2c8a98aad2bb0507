//! Pre-built load scenarios applied at simulator start.

use crate::{Board, SimResult};
use rand::Rng;
use std::time::Duration;
use tile_proto::FaultKind;

/// Small uniform load on every working tile.
pub fn light_load(board: &mut Board) {
    for tile in board.tiles_mut() {
        tile.metrics.load = if tile.is_spare { 0.0 } else { 0.05 };
    }
}

/// Randomized heavy load on every working tile.
pub fn stress(board: &mut Board) {
    let mut rng = rand::thread_rng();
    for tile in board.tiles_mut() {
        tile.metrics.load = if tile.is_spare {
            0.0
        } else {
            rng.gen_range(0.2..0.9)
        };
    }
}

/// A single 30-second heartbeat dropout on the given tile.
pub fn one_fault(board: &mut Board, tile_id: &str) -> SimResult<()> {
    board.inject_fault(
        tile_id,
        FaultKind::MissingHeartbeat,
        Some(Duration::from_secs(30)),
        &serde_json::Map::new(),
    )
}
