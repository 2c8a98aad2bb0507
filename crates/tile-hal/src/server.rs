//! Simulator-side HAL server.
//!
//! Accepts any number of clients, broadcasts a board snapshot at the
//! heartbeat interval (ticking the physics exactly once per broadcast), and
//! dispatches inbound fault injections, status requests, and reconfiguration
//! commands. Each client gets its own outbound queue and writer task so one
//! slow peer never stalls the broadcaster.

use crate::error::{HalError, HalResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tile_proto::{CmdAck, HalMessage};
use tile_sim::{Board, PrController, inject_from_event};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-client outbound queue depth. Heartbeats are dropped for a client whose
/// queue is full; command replies wait for space.
const CLIENT_OUTBOX_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct HalServerConfig {
    pub host: String,
    pub port: u16,
    pub hb_interval: Duration,
}

impl Default for HalServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            hb_interval: Duration::from_millis(100),
        }
    }
}

type ClientMap = Arc<parking_lot::Mutex<HashMap<u64, mpsc::Sender<String>>>>;

pub struct HalServer {
    board: Arc<Mutex<Board>>,
    pr: Arc<PrController>,
    cfg: HalServerConfig,
    clients: ClientMap,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl HalServer {
    pub fn new(board: Arc<Mutex<Board>>, pr: Arc<PrController>, cfg: HalServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            board,
            pr,
            cfg,
            clients: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Bind the listener and spawn the accept loop plus the heartbeat
    /// broadcaster. Returns the bound address (useful with port 0).
    pub async fn start(&self) -> HalResult<SocketAddr> {
        let listener = TcpListener::bind((self.cfg.host.as_str(), self.cfg.port))
            .await
            .map_err(HalError::Io)?;
        let addr = listener.local_addr().map_err(HalError::Io)?;
        info!(%addr, "hal server listening");

        let accept = tokio::spawn(accept_loop(
            listener,
            self.board.clone(),
            self.pr.clone(),
            self.clients.clone(),
            Arc::new(AtomicU64::new(0)),
            self.shutdown.subscribe(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.board.clone(),
            self.clients.clone(),
            self.cfg.hb_interval,
            self.shutdown.subscribe(),
        ));

        let mut tasks = self.tasks.lock();
        tasks.push(accept);
        tasks.push(heartbeat);
        Ok(addr)
    }

    /// Stop the heartbeat and accept loops and drop every client connection.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.clients.lock().clear();
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    board: Arc<Mutex<Board>>,
    pr: Arc<PrController>,
    clients: ClientMap,
    next_id: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let client_id = next_id.fetch_add(1, Ordering::Relaxed);
                    info!(client = client_id, %peer, "client connected");
                    tokio::spawn(serve_client(
                        stream,
                        client_id,
                        board.clone(),
                        pr.clone(),
                        clients.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Tick the physics, serialize the snapshot once, and fan it out. A client
/// with a full or closed outbox is skipped; it gets reaped when its reader
/// terminates.
async fn heartbeat_loop(
    board: Arc<Mutex<Board>>,
    clients: ClientMap,
    hb_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(hb_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let line = {
            let mut board = board.lock().await;
            board.tick_all();
            match encode_line(&HalMessage::StatusSnapshot(board.get_snapshot())) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "snapshot serialization failed");
                    continue;
                }
            }
        };
        for (client_id, tx) in clients.lock().iter() {
            if tx.try_send(line.clone()).is_err() {
                debug!(client = client_id, "skipping slow or closed client");
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    client_id: u64,
    board: Arc<Mutex<Board>>,
    pr: Arc<PrController>,
    clients: ClientMap,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<String>(CLIENT_OUTBOX_DEPTH);
    clients.lock().insert(client_id, tx.clone());
    let writer = tokio::spawn(write_loop(write_half, rx));

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            res = lines.next_line() => match res {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(client = client_id, error = %e, "client read error");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg = match serde_json::from_str::<HalMessage>(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client = client_id, error = %e, "dropping malformed line");
                continue;
            }
        };
        if !dispatch(msg, client_id, &board, &pr, &tx).await {
            break;
        }
    }

    clients.lock().remove(&client_id);
    drop(tx);
    let _ = writer.await;
    info!(client = client_id, "client disconnected");
}

/// Handle one inbound message. Returns false when the client's outbox is
/// gone and the connection should wind down.
async fn dispatch(
    msg: HalMessage,
    client_id: u64,
    board: &Arc<Mutex<Board>>,
    pr: &Arc<PrController>,
    tx: &mpsc::Sender<String>,
) -> bool {
    match msg {
        HalMessage::FaultEvent(event) => {
            let mut board = board.lock().await;
            if let Err(e) = inject_from_event(&mut board, &event) {
                // Bad injections are a client problem, not a server one.
                warn!(client = client_id, tile = %event.node_id, error = %e, "fault injection rejected");
            }
            true
        }
        HalMessage::StatusRequest => {
            let snapshot = {
                let mut board = board.lock().await;
                board.get_snapshot()
            };
            match encode_line(&HalMessage::StatusSnapshot(snapshot)) {
                Ok(line) => tx.send(line).await.is_ok(),
                Err(e) => {
                    error!(error = %e, "snapshot serialization failed");
                    true
                }
            }
        }
        HalMessage::CmdReconfigure(cmd) => {
            // Ack first, synchronously: the ack always precedes the result
            // for the same cmd_id because both travel the same queue.
            let ack = match encode_line(&HalMessage::CmdAck(CmdAck::accepted(cmd.cmd_id.clone()))) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "ack serialization failed");
                    return true;
                }
            };
            if tx.send(ack).await.is_err() {
                return false;
            }
            let pr = pr.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = pr.handle_reconfigure(&cmd).await;
                match encode_line(&HalMessage::CmdResult(result)) {
                    Ok(line) => {
                        let _ = tx.send(line).await;
                    }
                    Err(e) => error!(error = %e, "cmd_result serialization failed"),
                }
            });
            true
        }
        other => {
            debug!(client = client_id, msg = discriminant_name(&other), "ignoring message");
            true
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            debug!(error = %e, "client write failed");
            break;
        }
    }
}

fn encode_line(msg: &HalMessage) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

fn discriminant_name(msg: &HalMessage) -> &'static str {
    match msg {
        HalMessage::Heartbeat(_) => "heartbeat",
        HalMessage::StatusSnapshot(_) => "status_snapshot",
        HalMessage::CmdAck(_) => "cmd_ack",
        HalMessage::CmdResult(_) => "cmd_result",
        HalMessage::FaultEvent(_) => "fault_event",
        HalMessage::StatusRequest => "status_request",
        HalMessage::CmdReconfigure(_) => "cmd_reconfigure",
    }
}
