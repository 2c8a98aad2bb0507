//! Sandbox verification gate.

use async_trait::async_trait;
use std::time::Duration;
use tile_proto::RecoveryPlan;
use tokio::time::sleep;

/// Bounded functional check run after a reconfiguration, before committing
/// the recovery. Its verdict is independent of the command result; the two
/// combine into the commit decision.
#[async_trait]
pub trait SandboxVerifier: Send + Sync {
    async fn verify(&self, node_id: &str, plan: &RecoveryPlan) -> bool;
}

/// Default verifier: waits a bounded interval (shorter for high-confidence
/// plans) and passes. Whether real test vectors must gate commits is the
/// embedder's policy; this keeps the timing contract without the vectors.
pub struct TimedSandbox {
    pub timeout: Duration,
}

impl TimedSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TimedSandbox {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl SandboxVerifier for TimedSandbox {
    async fn verify(&self, _node_id: &str, plan: &RecoveryPlan) -> bool {
        let budget = if plan.confidence > 0.9 {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(100)
        };
        sleep(budget.min(self.timeout)).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tile_proto::{PlanSource, ReconfigureAction};

    fn plan(confidence: f64) -> RecoveryPlan {
        RecoveryPlan {
            action: ReconfigureAction::FastSwap,
            spare_id: Some("tile_3".to_string()),
            playbook: None,
            confidence,
            source: PlanSource::Heuristic,
        }
    }

    #[tokio::test]
    async fn high_confidence_plans_verify_faster() {
        let sandbox = TimedSandbox::default();
        let start = Instant::now();
        assert!(sandbox.verify("tile_1", &plan(0.99)).await);
        let fast = start.elapsed();

        let start = Instant::now();
        assert!(sandbox.verify("tile_1", &plan(0.5)).await);
        let slow = start.elapsed();

        assert!(fast >= Duration::from_millis(40));
        assert!(slow >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn verification_is_bounded_by_timeout() {
        let sandbox = TimedSandbox::new(Duration::from_millis(10));
        let start = Instant::now();
        assert!(sandbox.verify("tile_1", &plan(0.5)).await);
        assert!(start.elapsed() < Duration::from_millis(90));
    }
}
