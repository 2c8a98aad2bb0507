//! Bounded in-memory record of healing attempts.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tile_proto::{CmdResult, FaultEvent, RecoveryPlan};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Committed,
    FallbackIssued,
}

/// One completed healing attempt, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt_id: Uuid,
    pub fault: FaultEvent,
    pub plan: RecoveryPlan,
    pub cmd_result: Option<CmdResult>,
    pub outcome: AttemptOutcome,
    pub ts: f64,
}

/// Ring buffer of recent attempts; the oldest entry is evicted at capacity.
/// Nothing here persists across restarts.
pub struct AttemptHistory {
    capacity: usize,
    ring: Mutex<VecDeque<AttemptRecord>>,
}

impl AttemptHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: AttemptRecord) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<AttemptRecord> {
        self.ring.lock().iter().cloned().collect()
    }
}
