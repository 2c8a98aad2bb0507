//! Command correlation: pair each `cmd_reconfigure` with its completion.

use crate::adapter::HalAdapter;
use crate::error::{HalError, HalResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tile_proto::{CmdAck, CmdResult, HalMessage, ReconfigureCommand, now_ts};
use tokio::sync::oneshot;
use tracing::debug;

/// What completion the caller wants to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Fire and forget: return as soon as the command is written.
    None,
    /// Resolve on the `cmd_ack` (acceptance only).
    Ack,
    /// Resolve on the `cmd_result` (the terminal outcome). Acks are
    /// informational and do not complete the wait.
    Result,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Sent,
    Ack(CmdAck),
    Result(CmdResult),
}

struct PendingSlot {
    tx: oneshot::Sender<CommandReply>,
    expect: Expect,
}

/// Sends reconfiguration commands and resolves waiters as correlated replies
/// arrive. The host pipeline feeds every inbound message to [`observe`].
///
/// [`observe`]: CommandSender::observe
pub struct CommandSender {
    adapter: Arc<HalAdapter>,
    pending: Mutex<HashMap<String, PendingSlot>>,
    seq: AtomicU64,
}

impl CommandSender {
    pub fn new(adapter: Arc<HalAdapter>) -> Self {
        Self {
            adapter,
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Time-monotonic default command id, unique for the host's lifetime.
    pub fn next_cmd_id(&self) -> String {
        let millis = (now_ts() * 1000.0) as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("cmd_{millis}_{seq}")
    }

    /// Write a command and wait per `expect`. On timeout the correlation slot
    /// is removed, so a late completion is discarded rather than delivered.
    pub async fn send(
        &self,
        mut cmd: ReconfigureCommand,
        expect: Expect,
        timeout: Duration,
    ) -> HalResult<CommandReply> {
        if cmd.cmd_id.is_empty() {
            cmd.cmd_id = self.next_cmd_id();
        }
        let cmd_id = cmd.cmd_id.clone();

        if expect == Expect::None {
            self.adapter.send(&HalMessage::CmdReconfigure(cmd)).await?;
            return Ok(CommandReply::Sent);
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(cmd_id.clone(), PendingSlot { tx, expect });

        if let Err(e) = self.adapter.send(&HalMessage::CmdReconfigure(cmd)).await {
            self.pending.lock().remove(&cmd_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().remove(&cmd_id);
                Err(HalError::Closed)
            }
            Err(_) => {
                self.pending.lock().remove(&cmd_id);
                Err(HalError::Timeout(cmd_id))
            }
        }
    }

    /// Inspect one inbound message and complete a matching waiter, if any.
    /// At most one completion is ever delivered per cmd_id.
    pub fn observe(&self, msg: &HalMessage) {
        match msg {
            HalMessage::CmdResult(res) => {
                let slot = self.pending.lock().remove(&res.cmd_id);
                match slot {
                    Some(slot) => {
                        let _ = slot.tx.send(CommandReply::Result(res.clone()));
                    }
                    None => {
                        debug!(cmd_id = %res.cmd_id, "late or unsolicited cmd_result discarded");
                    }
                }
            }
            HalMessage::CmdAck(ack) => {
                let slot = {
                    let mut pending = self.pending.lock();
                    let ack_only = pending
                        .get(&ack.cmd_id)
                        .is_some_and(|s| s.expect == Expect::Ack);
                    if ack_only {
                        pending.remove(&ack.cmd_id)
                    } else {
                        None
                    }
                };
                if let Some(slot) = slot {
                    let _ = slot.tx.send(CommandReply::Ack(ack.clone()));
                }
            }
            _ => {}
        }
    }

    /// Number of commands still awaiting completion.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::HalAdapterConfig;
    use tile_proto::{CmdStatus, ReconfigureAction};

    fn unreachable_adapter() -> Arc<HalAdapter> {
        Arc::new(HalAdapter::new(HalAdapterConfig {
            port: 1,
            ..HalAdapterConfig::default()
        }))
    }

    fn cmd(id: &str) -> ReconfigureCommand {
        ReconfigureCommand {
            cmd_id: id.to_string(),
            target_node: "tile_1".to_string(),
            action: ReconfigureAction::Isolate,
            spare_id: None,
            delta_state: None,
        }
    }

    fn result_for(id: &str) -> HalMessage {
        HalMessage::CmdResult(CmdResult {
            cmd_id: id.to_string(),
            status: CmdStatus::Success,
            duration_ms: 5,
            sandbox_passed: true,
            reason: None,
        })
    }

    #[test]
    fn cmd_ids_are_unique_and_monotonic_in_sequence() {
        let sender = CommandSender::new(unreachable_adapter());
        let a = sender.next_cmd_id();
        let b = sender.next_cmd_id();
        assert_ne!(a, b);
        assert!(a.starts_with("cmd_"));
    }

    #[tokio::test]
    async fn send_failure_cleans_pending_slot() {
        let sender = CommandSender::new(unreachable_adapter());
        let err = sender
            .send(cmd("cmd_x"), Expect::Result, Duration::from_millis(100))
            .await
            .expect_err("disconnected adapter must fail");
        assert!(matches!(err, HalError::NotConnected));
        assert_eq!(sender.pending_len(), 0);
    }

    #[tokio::test]
    async fn observe_result_without_waiter_is_discarded() {
        let sender = CommandSender::new(unreachable_adapter());
        sender.observe(&result_for("cmd_nobody"));
        assert_eq!(sender.pending_len(), 0);
    }

    #[tokio::test]
    async fn ack_does_not_complete_result_waiters() {
        // Insert a pending slot by hand to test observe() without a socket.
        let sender = CommandSender::new(unreachable_adapter());
        let (tx, mut rx) = oneshot::channel();
        sender.pending.lock().insert(
            "cmd_7".to_string(),
            PendingSlot {
                tx,
                expect: Expect::Result,
            },
        );

        sender.observe(&HalMessage::CmdAck(CmdAck::accepted("cmd_7")));
        assert_eq!(sender.pending_len(), 1, "ack must not consume the slot");
        assert!(rx.try_recv().is_err());

        sender.observe(&result_for("cmd_7"));
        assert_eq!(sender.pending_len(), 0);
        match rx.try_recv().expect("completed") {
            CommandReply::Result(res) => assert_eq!(res.cmd_id, "cmd_7"),
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_completes_ack_waiters() {
        let sender = CommandSender::new(unreachable_adapter());
        let (tx, mut rx) = oneshot::channel();
        sender.pending.lock().insert(
            "cmd_8".to_string(),
            PendingSlot {
                tx,
                expect: Expect::Ack,
            },
        );
        sender.observe(&HalMessage::CmdAck(CmdAck::accepted("cmd_8")));
        assert!(matches!(
            rx.try_recv().expect("completed"),
            CommandReply::Ack(_)
        ));
    }

    #[tokio::test]
    async fn second_result_for_same_id_is_dropped() {
        let sender = CommandSender::new(unreachable_adapter());
        let (tx, mut rx) = oneshot::channel();
        sender.pending.lock().insert(
            "cmd_9".to_string(),
            PendingSlot {
                tx,
                expect: Expect::Result,
            },
        );
        sender.observe(&result_for("cmd_9"));
        sender.observe(&result_for("cmd_9"));
        assert!(rx.try_recv().is_ok());
        assert_eq!(sender.pending_len(), 0);
    }
}
