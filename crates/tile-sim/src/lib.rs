//! Tile board simulator core.
//!
//! Models a board of reconfigurable compute tiles with designated spares, a
//! per-tick physics model (thermal drift, error decay, fault expiry), forced
//! fault injection, and the partial-reconfiguration controller that answers
//! `cmd_reconfigure` requests.

#![forbid(unsafe_code)]

mod board;
mod inject;
mod pr;
pub mod scenarios;
mod tile;

pub use board::{Board, RegionInfo, load_region_map};
pub use inject::inject_from_event;
pub use pr::{PrController, PrTimings};
pub use tile::Tile;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("unknown tile: {0}")]
    UnknownTile(String),

    #[error("{0} is not a spare")]
    NotASpare(String),
}

pub type SimResult<T> = Result<T, SimError>;
