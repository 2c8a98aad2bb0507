//! tilesimd — Tilewarden hardware simulator daemon.
//!
//! Owns the tile board, drives the physics from the heartbeat broadcaster,
//! and serves the HAL endpoint the host agent connects to.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tile_hal::{HalServer, HalServerConfig};
use tile_sim::{Board, PrController, PrTimings, load_region_map, scenarios};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tilesimd")]
#[command(about = "Tilewarden tile-board hardware simulator")]
#[command(version)]
struct Cli {
    /// Listen address for the HAL endpoint
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Number of tiles on the board
    #[arg(long, default_value_t = 16)]
    tiles: usize,

    /// Number of tiles designated as spares
    #[arg(long, default_value_t = 3)]
    spares: usize,

    /// Heartbeat broadcast interval in seconds
    #[arg(long, default_value_t = 0.1)]
    hb: f64,

    /// Physics tick interval in seconds. The tick is driven by the heartbeat
    /// broadcaster (exactly one tick per broadcast), so this is advisory.
    #[arg(long, default_value_t = 0.05)]
    tick: f64,

    /// Path to the region map JSON (tile_id -> {bitstream_kb})
    #[arg(long)]
    region_map: Option<PathBuf>,

    /// Probability that a completed reconfiguration reports failure
    #[arg(long, default_value_t = 0.02)]
    failure_rate: f64,

    /// Initial load scenario applied at startup
    #[arg(long, value_enum, default_value_t = Scenario::Light)]
    scenario: Scenario,

    /// Tile targeted by the one-fault scenario
    #[arg(long, default_value = "tile_3")]
    fault_tile: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Small uniform load on working tiles
    Light,
    /// Randomized heavy load
    Stress,
    /// Light load plus a 30 s heartbeat dropout on one tile
    OneFault,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("tilesimd=info".parse()?)
                .add_directive("tile_sim=info".parse()?)
                .add_directive("tile_hal=info".parse()?),
        )
        .init();

    let region_map = cli
        .region_map
        .as_deref()
        .map(load_region_map)
        .unwrap_or_default();

    let mut board = Board::new(cli.tiles, cli.spares, region_map);
    match cli.scenario {
        Scenario::Light => scenarios::light_load(&mut board),
        Scenario::Stress => scenarios::stress(&mut board),
        Scenario::OneFault => {
            scenarios::light_load(&mut board);
            scenarios::one_fault(&mut board, &cli.fault_tile)?;
        }
    }

    if (cli.tick - cli.hb).abs() > f64::EPSILON {
        warn!(
            tick = cli.tick,
            hb = cli.hb,
            "physics ticks once per heartbeat broadcast; --tick has no separate effect"
        );
    }

    let board = Arc::new(Mutex::new(board));
    let pr = Arc::new(PrController::new(
        board.clone(),
        PrTimings {
            failure_rate: cli.failure_rate,
            ..PrTimings::default()
        },
    ));
    let server = HalServer::new(
        board,
        pr,
        HalServerConfig {
            host: cli.host.clone(),
            port: cli.port,
            hb_interval: Duration::from_secs_f64(cli.hb),
        },
    );

    let addr = server.start().await?;
    info!(
        %addr,
        tiles = cli.tiles,
        spares = cli.spares,
        scenario = ?cli.scenario,
        failure_rate = cli.failure_rate,
        "simulator ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down simulator");
    server.stop().await;
    Ok(())
}
