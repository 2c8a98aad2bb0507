//! Test support for the Tilewarden integration suite: builders that stand up
//! a live simulator and a full host pipeline on loopback TCP.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tile_detect::{FaultDetector, FaultDetectorConfig, TelemetryCollector};
use tile_hal::{
    CommandSender, HalAdapter, HalAdapterConfig, HalResult, HalServer, HalServerConfig,
};
use tile_heal::{HealingConfig, HealingEvent, HealingManager, PathManager, TimedSandbox};
use tile_proto::FaultEvent;
use tile_sim::{Board, PrController, PrTimings, RegionInfo};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

/// A running simulator endpoint.
pub struct SimStack {
    pub server: HalServer,
    pub board: Arc<Mutex<Board>>,
    pub addr: SocketAddr,
}

impl SimStack {
    pub async fn stop(self) -> Arc<Mutex<Board>> {
        self.server.stop().await;
        self.board
    }
}

#[derive(Clone)]
pub struct SimOptions {
    pub tiles: usize,
    pub spares: usize,
    pub failure_rate: f64,
    pub hb_interval: Duration,
    pub regions: HashMap<String, RegionInfo>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            tiles: 4,
            spares: 1,
            failure_rate: 0.0,
            hb_interval: Duration::from_millis(50),
            regions: HashMap::new(),
        }
    }
}

/// Start a simulator on an ephemeral port.
pub async fn start_sim(opts: SimOptions) -> HalResult<SimStack> {
    start_sim_on(0, opts).await
}

/// Start a simulator on a specific port (0 = ephemeral).
pub async fn start_sim_on(port: u16, opts: SimOptions) -> HalResult<SimStack> {
    let board = Arc::new(Mutex::new(Board::new(
        opts.tiles,
        opts.spares,
        opts.regions.clone(),
    )));
    let pr = Arc::new(PrController::new(
        board.clone(),
        PrTimings {
            failure_rate: opts.failure_rate,
            ..PrTimings::default()
        },
    ));
    let server = HalServer::new(
        board.clone(),
        pr,
        HalServerConfig {
            port,
            hb_interval: opts.hb_interval,
            ..HalServerConfig::default()
        },
    );
    let addr = server.start().await?;
    Ok(SimStack {
        server,
        board,
        addr,
    })
}

/// The full host pipeline with taps on the fault and healing event streams.
pub struct HostRig {
    pub adapter: Arc<HalAdapter>,
    pub sender: Arc<CommandSender>,
    pub healer: Arc<HealingManager>,
    pub fault_events: mpsc::UnboundedReceiver<FaultEvent>,
    pub healing_events: mpsc::UnboundedReceiver<HealingEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl HostRig {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        self.adapter.stop().await;
    }

    /// Block until the adapter reports a live connection.
    pub async fn wait_connected(&self, deadline: Duration) -> bool {
        let steps = (deadline.as_millis() / 10).max(1);
        for _ in 0..steps {
            if self.adapter.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.adapter.is_connected()
    }
}

#[derive(Clone)]
pub struct HostOptions {
    pub heartbeat_timeout_ms: u64,
    pub error_threshold: f64,
    pub spare_pool: Vec<String>,
    pub reconnect_interval: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 200,
            error_threshold: 3.0,
            spare_pool: vec!["tile_3".to_string()],
            reconnect_interval: Duration::from_millis(200),
        }
    }
}

/// Wire up adapter → collector → detector → healer against `port`, with the
/// fault stream teed out for assertions.
pub fn start_host(port: u16, opts: HostOptions) -> HostRig {
    let adapter = Arc::new(HalAdapter::new(HalAdapterConfig {
        port,
        reconnect_interval: opts.reconnect_interval,
        ..HalAdapterConfig::default()
    }));
    adapter.start();
    let sender = Arc::new(CommandSender::new(adapter.clone()));

    let (healing_tx, healing_events) = mpsc::unbounded_channel();
    let healer = Arc::new(HealingManager::new(
        Arc::new(PathManager::new(opts.spare_pool.clone())),
        sender.clone(),
        Arc::new(TimedSandbox::default()),
        HealingConfig::default(),
        healing_tx,
    ));

    let (detector_tx, detector_rx) = mpsc::unbounded_channel();
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
    let (tee_tx, fault_events) = mpsc::unbounded_channel();

    let collector = TelemetryCollector::new(adapter.clone(), sender.clone(), detector_tx);
    let detector = FaultDetector::new(
        FaultDetectorConfig {
            heartbeat_timeout_ms: opts.heartbeat_timeout_ms,
            error_threshold: opts.error_threshold,
        },
        detector_rx,
        fault_tx,
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(collector.run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(detector.run(shutdown_rx.clone())));

    let bridge_healer = healer.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(fault) = fault_rx.recv().await {
            bridge_healer.handle_fault(fault.clone());
            let _ = tee_tx.send(fault);
        }
    }));

    HostRig {
        adapter,
        sender,
        healer,
        fault_events,
        healing_events,
        shutdown,
        tasks,
    }
}
