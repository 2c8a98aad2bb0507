//! Host-side HAL adapter: a supervised, reconnecting TCP client.
//!
//! One supervisor task owns the connection lifecycle. On each successful
//! connect it installs the write half and runs a single reader that fills the
//! bounded inbound queue; on EOF or read error the reader exits and the
//! supervisor retries after the reconnect interval. There is never more than
//! one reader alive.

use crate::error::{HalError, HalResult};
use crate::queue::InboundQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tile_proto::HalMessage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HalAdapterConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for HalAdapterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            reconnect_interval: Duration::from_secs(1),
            queue_capacity: 1024,
        }
    }
}

pub struct HalAdapter {
    cfg: HalAdapterConfig,
    queue: Arc<InboundQueue>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HalAdapter {
    pub fn new(cfg: HalAdapterConfig) -> Self {
        let queue = Arc::new(InboundQueue::new(cfg.queue_capacity));
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            queue,
            writer: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown,
            supervisor: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the connection supervisor. Idempotent.
    pub fn start(&self) {
        let mut guard = self.supervisor.lock();
        if guard.is_some() {
            return;
        }
        let handle = tokio::spawn(supervise(
            self.cfg.clone(),
            self.queue.clone(),
            self.writer.clone(),
            self.connected.clone(),
            self.shutdown.subscribe(),
        ));
        *guard = Some(handle);
    }

    /// Signal the supervisor, close the socket, and drain the queue.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.writer.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
        self.queue.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Serialize one message as a line and write it under the writer lock.
    /// A write failure surfaces to the caller; reconnection is driven solely
    /// by the reader side.
    pub async fn send(&self, msg: &HalMessage) -> HalResult<()> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(HalError::NotConnected)?;
        writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Next inbound message; waits until one arrives.
    pub async fn recv(&self) -> HalMessage {
        self.queue.pop().await
    }

    /// Next inbound message, or `None` after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<HalMessage> {
        tokio::time::timeout(timeout, self.queue.pop()).await.ok()
    }

    /// Messages lost to the drop-oldest overflow policy.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

async fn supervise(
    cfg: HalAdapterConfig,
    queue: Arc<InboundQueue>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match TcpStream::connect((cfg.host.as_str(), cfg.port)).await {
            Ok(stream) => {
                info!(host = %cfg.host, port = cfg.port, "hal link established");
                let (read_half, write_half) = stream.into_split();
                *writer.lock().await = Some(write_half);
                connected.store(true, Ordering::SeqCst);

                read_until_closed(read_half, &queue, &mut shutdown).await;

                connected.store(false, Ordering::SeqCst);
                *writer.lock().await = None;
                info!("hal link lost");
            }
            Err(e) => {
                debug!(host = %cfg.host, port = cfg.port, error = %e, "hal connect failed");
            }
        }
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(cfg.reconnect_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// The single reader: parse lines into the queue until the peer goes away.
/// Malformed lines are dropped without terminating the reader.
async fn read_until_closed(
    read_half: OwnedReadHalf,
    queue: &InboundQueue,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            res = lines.next_line() => match res {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HalMessage>(line) {
                        Ok(msg) => queue.push(msg),
                        Err(e) => warn!(error = %e, "dropping malformed hal line"),
                    }
                }
                Ok(None) => {
                    info!("hal peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "hal read error");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tile_proto::{CmdAck, StatusSnapshot};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn bind_local() -> (TcpListener, HalAdapterConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let cfg = HalAdapterConfig {
            port,
            reconnect_interval: Duration::from_millis(50),
            ..HalAdapterConfig::default()
        };
        (listener, cfg)
    }

    #[tokio::test]
    async fn send_without_connection_errors() {
        let adapter = HalAdapter::new(HalAdapterConfig {
            port: 1, // nothing listens here
            ..HalAdapterConfig::default()
        });
        let err = adapter
            .send(&HalMessage::StatusRequest)
            .await
            .expect_err("must fail while disconnected");
        assert!(matches!(err, HalError::NotConnected));
    }

    #[tokio::test]
    async fn reader_parses_lines_and_skips_garbage() {
        let (listener, cfg) = bind_local().await;
        let adapter = HalAdapter::new(cfg);
        adapter.start();

        let (mut peer, _) = listener.accept().await.expect("accept");
        let snap = HalMessage::StatusSnapshot(StatusSnapshot {
            timestamp: 1.0,
            nodes: Default::default(),
        });
        let payload = format!(
            "{}\nnot json\n{}\n",
            serde_json::to_string(&snap).unwrap(),
            serde_json::to_string(&HalMessage::CmdAck(CmdAck::accepted("cmd_9"))).unwrap(),
        );
        peer.write_all(payload.as_bytes()).await.expect("write");

        let first = adapter
            .recv_timeout(Duration::from_secs(2))
            .await
            .expect("snapshot");
        assert!(matches!(first, HalMessage::StatusSnapshot(_)));
        let second = adapter
            .recv_timeout(Duration::from_secs(2))
            .await
            .expect("ack after skipping garbage");
        assert!(matches!(second, HalMessage::CmdAck(_)));

        adapter.stop().await;
    }

    #[tokio::test]
    async fn adapter_reconnects_after_peer_drop() {
        let (listener, cfg) = bind_local().await;
        let adapter = HalAdapter::new(cfg);
        adapter.start();

        let (peer, _) = listener.accept().await.expect("first accept");
        drop(peer);

        // Supervisor should come back for a second connection.
        let second = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("reconnect within deadline")
            .expect("second accept");

        // And the new link carries writes once the supervisor installs it.
        for _ in 0..50 {
            if adapter.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        adapter
            .send(&HalMessage::StatusRequest)
            .await
            .expect("send after reconnect");
        let mut buf = vec![0u8; 256];
        let mut peer = second.0;
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("read deadline")
            .expect("read");
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("status_request"), "got: {text}");

        adapter.stop().await;
    }
}
