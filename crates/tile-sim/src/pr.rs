//! Partial-reconfiguration controller.
//!
//! Answers `cmd_reconfigure` requests against the board, emulating the time
//! cost of each action. Sleeps happen without the board lock held.

use crate::{Board, SimError};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tile_proto::{CmdResult, CmdStatus, ReconfigureAction, ReconfigureCommand};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Action timing and reliability knobs.
#[derive(Debug, Clone, Copy)]
pub struct PrTimings {
    /// Base duration of a warm fast-swap, in milliseconds.
    pub warm_swap_ms: f64,
    /// Cold partial-reconfiguration cost per kilobyte of bitstream.
    pub cold_pr_ms_per_kb: f64,
    /// Probability that a completed action is reported failed anyway.
    pub failure_rate: f64,
}

impl Default for PrTimings {
    fn default() -> Self {
        Self {
            warm_swap_ms: 5.0,
            cold_pr_ms_per_kb: 2.0,
            failure_rate: 0.02,
        }
    }
}

pub struct PrController {
    board: Arc<Mutex<Board>>,
    timings: PrTimings,
}

impl PrController {
    pub fn new(board: Arc<Mutex<Board>>, timings: PrTimings) -> Self {
        Self { board, timings }
    }

    /// Execute one reconfiguration command and produce its `cmd_result`.
    /// Invalid commands (unknown tile, not-a-spare) come back as `failed`
    /// with a reason; valid ones are subject to randomized failure injection.
    pub async fn handle_reconfigure(&self, cmd: &ReconfigureCommand) -> CmdResult {
        let started = Instant::now();

        let outcome = match (&cmd.action, cmd.spare_id.as_deref()) {
            (ReconfigureAction::FastSwap, Some(spare)) => {
                let jitter_ms = rand::thread_rng().gen_range(1.0..10.0);
                sleep(Duration::from_secs_f64(
                    (self.timings.warm_swap_ms + jitter_ms) / 1000.0,
                ))
                .await;
                let mut board = self.board.lock().await;
                board.perform_fast_swap(&cmd.target_node, spare)
            }
            (ReconfigureAction::PartialReconfig, _) => {
                let kb = self.board.lock().await.bitstream_kb(&cmd.target_node);
                let jitter_ms = rand::thread_rng().gen_range(10.0..50.0);
                sleep(Duration::from_secs_f64(
                    (kb as f64 * self.timings.cold_pr_ms_per_kb + jitter_ms) / 1000.0,
                ))
                .await;
                // Reloading the bitstream clears whatever fault was forced on
                // the region, matching the hardware emulation contract.
                let mut board = self.board.lock().await;
                board.clear_fault(&cmd.target_node)
            }
            (ReconfigureAction::Isolate, _) => {
                sleep(Duration::from_millis(10)).await;
                let mut board = self.board.lock().await;
                board.isolate(&cmd.target_node)
            }
            (action, _) => {
                debug!(cmd_id = %cmd.cmd_id, action = %action, "no-op for unsupported action");
                sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(e) => {
                warn!(cmd_id = %cmd.cmd_id, target = %cmd.target_node, error = %e, "reconfigure rejected");
                failure(cmd, duration_ms, Some(e))
            }
            Ok(()) => {
                let failed =
                    rand::thread_rng().gen_range(0.0..1.0) < self.timings.failure_rate;
                if failed {
                    warn!(cmd_id = %cmd.cmd_id, "randomized action failure");
                    failure(cmd, duration_ms, None)
                } else {
                    CmdResult {
                        cmd_id: cmd.cmd_id.clone(),
                        status: CmdStatus::Success,
                        duration_ms,
                        sandbox_passed: true,
                        reason: None,
                    }
                }
            }
        }
    }
}

fn failure(cmd: &ReconfigureCommand, duration_ms: u64, cause: Option<SimError>) -> CmdResult {
    CmdResult {
        cmd_id: cmd.cmd_id.clone(),
        status: CmdStatus::Failed,
        duration_ms,
        sandbox_passed: false,
        reason: cause.map(|e| e.to_string()),
    }
}
