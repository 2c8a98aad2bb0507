//! tilehostd — Tilewarden self-healing host agent.
//!
//! Connects to the simulator's HAL endpoint and runs the closed loop:
//! telemetry → fault detection → recovery planning → command dispatch →
//! verification → commit. A recorder task owns the in-memory fault log and
//! healing history; there are no process-wide singletons.

use clap::Parser;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tile_detect::{FaultDetector, FaultDetectorConfig, TelemetryCollector};
use tile_hal::{CommandSender, HalAdapter, HalAdapterConfig};
use tile_heal::{HealingConfig, HealingEvent, HealingManager, PathManager, TimedSandbox};
use tile_proto::FaultEvent;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tilehostd")]
#[command(about = "Tilewarden self-healing host agent")]
#[command(version)]
struct Cli {
    /// Simulator HAL host
    #[arg(long, env = "HAL_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Simulator HAL port
    #[arg(long, env = "HAL_PORT", default_value_t = 9000)]
    port: u16,

    /// Reconnect interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    reconnect_interval_ms: u64,

    /// Silence longer than this marks a node as missing its heartbeat (ms)
    #[arg(long, default_value_t = 200)]
    heartbeat_timeout_ms: u64,

    /// Accumulated error count that triggers a metric fault
    #[arg(long, default_value_t = 3.0)]
    error_threshold: f64,

    /// Sandbox verification budget in milliseconds
    #[arg(long, default_value_t = 200)]
    sandbox_timeout_ms: u64,

    /// Optional static path model (JSON: {"mapping": {fault_type: spare_id}})
    #[arg(long, env = "PATH_MODEL")]
    model: Option<PathBuf>,

    /// Spare pool consulted by the planner heuristic
    #[arg(long, value_delimiter = ',', default_value = "tile_7,tile_8,tile_9")]
    spare_pool: Vec<String>,

    /// Capacity of the in-memory fault and healing logs
    #[arg(long, default_value_t = 512)]
    log_capacity: usize,
}

/// The host's owned mutable state, fed exclusively by the recorder task.
struct HostState {
    capacity: usize,
    faults: VecDeque<FaultEvent>,
    healing: VecDeque<HealingEvent>,
}

impl HostState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            faults: VecDeque::new(),
            healing: VecDeque::new(),
        }
    }

    fn record_fault(&mut self, event: FaultEvent) {
        if self.faults.len() >= self.capacity {
            self.faults.pop_front();
        }
        self.faults.push_back(event);
    }

    fn record_healing(&mut self, event: HealingEvent) {
        if self.healing.len() >= self.capacity {
            self.healing.pop_front();
        }
        self.healing.push_back(event);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("tilehostd=info".parse()?)
                .add_directive("tile_hal=info".parse()?)
                .add_directive("tile_detect=info".parse()?)
                .add_directive("tile_heal=info".parse()?),
        )
        .init();

    info!(
        host = %cli.host,
        port = cli.port,
        spare_pool = ?cli.spare_pool,
        "starting tilehostd"
    );

    // Transport and command correlation.
    let adapter = Arc::new(HalAdapter::new(HalAdapterConfig {
        host: cli.host.clone(),
        port: cli.port,
        reconnect_interval: Duration::from_millis(cli.reconnect_interval_ms),
        ..HalAdapterConfig::default()
    }));
    adapter.start();
    let sender = Arc::new(CommandSender::new(adapter.clone()));

    // Planning and healing.
    let paths = Arc::new(match &cli.model {
        Some(path) => PathManager::with_model_file(cli.spare_pool.clone(), path),
        None => PathManager::new(cli.spare_pool.clone()),
    });
    let (healing_tx, mut healing_rx) = mpsc::unbounded_channel();
    let healer = Arc::new(HealingManager::new(
        paths,
        sender.clone(),
        Arc::new(TimedSandbox::new(Duration::from_millis(cli.sandbox_timeout_ms))),
        HealingConfig::default(),
        healing_tx,
    ));

    // Detection pipeline.
    let (detector_tx, detector_rx) = mpsc::unbounded_channel();
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
    let collector = TelemetryCollector::new(adapter.clone(), sender.clone(), detector_tx);
    let detector = FaultDetector::new(
        FaultDetectorConfig {
            heartbeat_timeout_ms: cli.heartbeat_timeout_ms,
            error_threshold: cli.error_threshold,
        },
        detector_rx,
        fault_tx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let collector_task = tokio::spawn(collector.run(shutdown_rx.clone()));
    let detector_task = tokio::spawn(detector.run(shutdown_rx.clone()));

    // Recorder: hands faults to the healer and keeps the attempt logs.
    let recorder_healer = healer.clone();
    let mut recorder_shutdown = shutdown_rx.clone();
    let log_capacity = cli.log_capacity;
    let recorder = tokio::spawn(async move {
        let mut state = HostState::new(log_capacity);
        loop {
            tokio::select! {
                fault = fault_rx.recv() => match fault {
                    Some(fault) => {
                        info!(
                            node = %fault.node_id,
                            fault = %fault.fault_type,
                            severity = %fault.severity,
                            "fault event"
                        );
                        recorder_healer.handle_fault(fault.clone());
                        state.record_fault(fault);
                    }
                    None => break,
                },
                event = healing_rx.recv() => match event {
                    Some(event) => {
                        match &event {
                            HealingEvent::HealingSuccess { node, duration_ms, .. } => {
                                info!(node = %node, duration_ms, "healing succeeded");
                            }
                            HealingEvent::HealingFailed { node, sandbox_passed, .. } => {
                                warn!(node = %node, sandbox_passed, "healing failed");
                            }
                            HealingEvent::HealingStarted { node, plan, .. } => {
                                info!(node = %node, action = %plan.action, source = %plan.source, "healing started");
                            }
                        }
                        state.record_healing(event);
                    }
                    None => break,
                },
                _ = recorder_shutdown.changed() => break,
            }
        }
        info!(
            faults = state.faults.len(),
            healing_events = state.healing.len(),
            "recorder stopped"
        );
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down host agent");

    let _ = shutdown_tx.send(true);
    let _ = recorder.await;
    let _ = detector_task.await;
    let _ = collector_task.await;
    adapter.stop().await;

    info!("shutdown complete");
    Ok(())
}
