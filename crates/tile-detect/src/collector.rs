//! Telemetry collector: the single consumer of the adapter's inbound queue.

use std::sync::Arc;
use tile_hal::{CommandSender, HalAdapter};
use tile_proto::HalMessage;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Forwards every well-formed inbound message to the detector queue without
/// filtering by type, and lets the command correlator observe each one first
/// so pending `cmd_reconfigure` waiters resolve.
pub struct TelemetryCollector {
    adapter: Arc<HalAdapter>,
    correlator: Arc<CommandSender>,
    detector_tx: mpsc::UnboundedSender<HalMessage>,
}

impl TelemetryCollector {
    pub fn new(
        adapter: Arc<HalAdapter>,
        correlator: Arc<CommandSender>,
        detector_tx: mpsc::UnboundedSender<HalMessage>,
    ) -> Self {
        Self {
            adapter,
            correlator,
            detector_tx,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let msg = tokio::select! {
                msg = self.adapter.recv() => msg,
                _ = shutdown.changed() => break,
            };
            self.correlator.observe(&msg);
            if self.detector_tx.send(msg).is_err() {
                debug!("detector queue closed; collector exiting");
                break;
            }
        }
    }
}
