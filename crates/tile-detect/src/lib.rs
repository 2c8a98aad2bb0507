//! Telemetry ingest and fault detection.
//!
//! The collector drains the HAL adapter's inbound queue, keeps the command
//! correlator fed, and forwards telemetry to the detector, which turns
//! metric thresholds and heartbeat gaps into fault events.

#![forbid(unsafe_code)]

mod collector;
mod detector;

pub use collector::TelemetryCollector;
pub use detector::{FaultDetector, FaultDetectorConfig};
