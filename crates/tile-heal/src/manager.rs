//! Healing orchestration: plan, dispatch, verify, commit or fall back.

use crate::history::{AttemptHistory, AttemptOutcome, AttemptRecord};
use crate::paths::PathManager;
use crate::sandbox::SandboxVerifier;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tile_hal::{CommandReply, CommandSender, Expect};
use tile_proto::{
    CmdResult, CmdStatus, FaultEvent, ReconfigureAction, ReconfigureCommand, RecoveryContext,
    RecoveryPlan, now_ts,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HealingConfig {
    /// How long to wait for the correlated `cmd_result`.
    pub cmd_timeout: Duration,
    /// Budget for the best-effort fallback isolate.
    pub fallback_timeout: Duration,
    /// Attempt ring size.
    pub history_capacity: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            cmd_timeout: Duration::from_secs(2),
            fallback_timeout: Duration::from_secs(1),
            history_capacity: 256,
        }
    }
}

/// Structured announcement sent to the event sink. Every healing attempt
/// produces exactly one terminal event (`healing_success` or
/// `healing_failed`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealingEvent {
    HealingStarted {
        node: String,
        plan: RecoveryPlan,
        ts: f64,
    },
    HealingSuccess {
        node: String,
        plan: RecoveryPlan,
        duration_ms: u64,
        ts: f64,
    },
    HealingFailed {
        node: String,
        plan: RecoveryPlan,
        cmd_result: Option<CmdResult>,
        sandbox_passed: bool,
        ts: f64,
    },
}

/// Coordinates one healing attempt per fault event.
///
/// `handle_fault` never blocks the caller: each attempt runs in its own
/// spawned task. Announcements go to an unbounded channel so the
/// orchestrator never stalls on the sink.
pub struct HealingManager {
    paths: Arc<PathManager>,
    sender: Arc<CommandSender>,
    sandbox: Arc<dyn SandboxVerifier>,
    cfg: HealingConfig,
    history: AttemptHistory,
    events: tokio::sync::mpsc::UnboundedSender<HealingEvent>,
}

impl HealingManager {
    pub fn new(
        paths: Arc<PathManager>,
        sender: Arc<CommandSender>,
        sandbox: Arc<dyn SandboxVerifier>,
        cfg: HealingConfig,
        events: tokio::sync::mpsc::UnboundedSender<HealingEvent>,
    ) -> Self {
        let history = AttemptHistory::new(cfg.history_capacity);
        Self {
            paths,
            sender,
            sandbox,
            cfg,
            history,
            events,
        }
    }

    /// Kick off an orchestration task for this fault and return immediately.
    pub fn handle_fault(self: &Arc<Self>, event: FaultEvent) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_heal(event).await;
        });
    }

    /// The full fault-to-recovery sequence for one event.
    pub async fn run_heal(&self, event: FaultEvent) {
        let started = Instant::now();
        let node = event.node_id.clone();
        let ctx = RecoveryContext::from_fault(&event);
        let plan = self.paths.recommend(&ctx);
        info!(
            node = %node,
            fault = %event.fault_type,
            action = %plan.action,
            source = %plan.source,
            confidence = plan.confidence,
            "healing started"
        );
        self.announce(HealingEvent::HealingStarted {
            node: node.clone(),
            plan: plan.clone(),
            ts: now_ts(),
        });

        let cmd = ReconfigureCommand {
            cmd_id: self.sender.next_cmd_id(),
            target_node: node.clone(),
            action: plan.action.clone(),
            spare_id: plan.spare_id.clone(),
            delta_state: None,
        };
        let cmd_result = match self
            .sender
            .send(cmd, Expect::Result, self.cfg.cmd_timeout)
            .await
        {
            Ok(CommandReply::Result(result)) => Some(result),
            Ok(other) => {
                debug!(node = %node, reply = ?other, "unexpected command reply");
                None
            }
            Err(e) => {
                warn!(node = %node, error = %e, "reconfigure dispatch failed");
                None
            }
        };

        let sandbox_passed = self.sandbox.verify(&node, &plan).await;
        let committed = sandbox_passed
            && cmd_result
                .as_ref()
                .is_some_and(|r| r.status == CmdStatus::Success);

        if committed {
            self.paths.register_success(&ctx, &plan);
            let duration_ms = started.elapsed().as_millis() as u64;
            info!(node = %node, duration_ms, "healing succeeded");
            self.announce(HealingEvent::HealingSuccess {
                node: node.clone(),
                plan: plan.clone(),
                duration_ms,
                ts: now_ts(),
            });
        } else {
            warn!(
                node = %node,
                sandbox_passed,
                cmd_status = ?cmd_result.as_ref().map(|r| r.status),
                "healing failed; issuing isolate fallback"
            );
            self.announce(HealingEvent::HealingFailed {
                node: node.clone(),
                plan: plan.clone(),
                cmd_result: cmd_result.clone(),
                sandbox_passed,
                ts: now_ts(),
            });
            self.issue_fallback(&node).await;
        }

        self.history.push(AttemptRecord {
            attempt_id: Uuid::new_v4(),
            fault: event,
            plan,
            cmd_result,
            outcome: if committed {
                AttemptOutcome::Committed
            } else {
                AttemptOutcome::FallbackIssued
            },
            ts: now_ts(),
        });
    }

    /// Best-effort isolate on the target; failures are logged, not retried.
    async fn issue_fallback(&self, node: &str) {
        let cmd = ReconfigureCommand {
            cmd_id: self.sender.next_cmd_id(),
            target_node: node.to_string(),
            action: ReconfigureAction::Isolate,
            spare_id: None,
            delta_state: None,
        };
        if let Err(e) = self
            .sender
            .send(cmd, Expect::None, self.cfg.fallback_timeout)
            .await
        {
            warn!(node = %node, error = %e, "fallback isolate not delivered");
        }
    }

    /// Recent attempts, oldest first.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.history.snapshot()
    }

    pub fn paths(&self) -> &PathManager {
        &self.paths
    }

    fn announce(&self, event: HealingEvent) {
        // The sink must never block or fail the orchestrator.
        let _ = self.events.send(event);
    }
}
