//! Recovery planning and healing orchestration.
//!
//! The path manager answers "what do we do about this fault" from a
//! fingerprint-indexed success cache, an optional static model, and spare
//! heuristics. The healing manager drives one fault through plan → dispatch
//! → sandbox verification → commit-or-fallback, learning from every success.

#![forbid(unsafe_code)]

mod history;
mod manager;
mod paths;
mod sandbox;

pub use history::{AttemptHistory, AttemptOutcome, AttemptRecord};
pub use manager::{HealingConfig, HealingEvent, HealingManager};
pub use paths::{PathManager, PathModel};
pub use sandbox::{SandboxVerifier, TimedSandbox};
