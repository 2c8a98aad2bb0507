//! Protocol types for the Tilewarden HAL link.
//!
//! Defines the newline-delimited JSON messages exchanged between the host
//! agent and the tile-board simulator, plus the recovery plan/context types
//! shared by the detection and healing pipelines.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Current wall-clock time as fractional epoch seconds (the wire timestamp
/// representation).
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ─── Tile status & metrics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TileStatus {
    #[default]
    Ok,
    Degraded,
    Failed,
    Isolated,
    Spare,
}

impl std::fmt::Display for TileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Isolated => write!(f, "isolated"),
            Self::Spare => write!(f, "spare"),
        }
    }
}

/// Per-tile telemetry readings carried in every heartbeat body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileMetrics {
    #[serde(default = "default_temp_c")]
    pub temp_c: f64,
    #[serde(default = "default_voltage_v")]
    pub voltage_v: f64,
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub error_count: f64,
    #[serde(default = "default_crc")]
    pub last_output_crc: String,
    /// Firmware-reported status word; absent on healthy hardware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,
}

fn default_temp_c() -> f64 {
    40.0
}

fn default_voltage_v() -> f64 {
    1.0
}

fn default_crc() -> String {
    "0x0".to_string()
}

impl Default for TileMetrics {
    fn default() -> Self {
        Self {
            temp_c: default_temp_c(),
            voltage_v: default_voltage_v(),
            load: 0.0,
            error_count: 0.0,
            last_output_crc: default_crc(),
            status_code: None,
        }
    }
}

// ─── Telemetry messages ───────────────────────────────────────────────────────

/// A single tile's heartbeat body. Also embedded per-node in
/// [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp: f64,
    pub metrics: TileMetrics,
    pub status: TileStatus,
}

/// Aggregate board snapshot. `nodes` is a `BTreeMap` so iteration (and the
/// serialized form) is in sorted tile-id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp: f64,
    pub nodes: BTreeMap<String, Heartbeat>,
}

// ─── Fault events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultSeverity {
    Minor,
    Major,
    Critical,
}

impl FaultSeverity {
    /// Forced-fault duration implied by severity when an injection carries no
    /// explicit duration. Critical faults never expire on their own.
    pub fn implied_duration(self) -> Option<Duration> {
        match self {
            Self::Critical => None,
            Self::Major => Some(Duration::from_secs(60)),
            Self::Minor => Some(Duration::from_secs(10)),
        }
    }
}

impl std::fmt::Display for FaultSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Fault classification. Opaque kinds survive the round trip so foreign
/// injectors can carry their own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FaultKind {
    MissingHeartbeat,
    StuckOutput,
    Overheat,
    CrcMismatch,
    TelemetryNoise,
    Other(String),
}

impl FaultKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::MissingHeartbeat => "missing_heartbeat",
            Self::StuckOutput => "stuck_output",
            Self::Overheat => "overheat",
            Self::CrcMismatch => "crc_mismatch",
            Self::TelemetryNoise => "telemetry_noise",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for FaultKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "missing_heartbeat" => Self::MissingHeartbeat,
            "stuck_output" => Self::StuckOutput,
            "overheat" => Self::Overheat,
            "crc_mismatch" => Self::CrcMismatch,
            "telemetry_noise" => Self::TelemetryNoise,
            _ => Self::Other(s),
        }
    }
}

impl From<FaultKind> for String {
    fn from(k: FaultKind) -> Self {
        k.as_str().to_string()
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A detected or injected fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultEvent {
    pub fault_id: String,
    pub node_id: String,
    pub fault_type: FaultKind,
    #[serde(default = "default_severity")]
    pub severity: FaultSeverity,
    pub timestamp: f64,
    #[serde(default)]
    pub evidence: serde_json::Map<String, Value>,
}

fn default_severity() -> FaultSeverity {
    FaultSeverity::Major
}

// ─── Reconfiguration commands ─────────────────────────────────────────────────

/// Recovery action carried by a `cmd_reconfigure`. Unknown actions must reach
/// the simulator (which answers them with a no-op result), so this keeps the
/// same opaque-string bridge as [`FaultKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReconfigureAction {
    FastSwap,
    PartialReconfig,
    Isolate,
    Other(String),
}

impl ReconfigureAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FastSwap => "fast_swap",
            Self::PartialReconfig => "partial_reconfig",
            Self::Isolate => "isolate",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for ReconfigureAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "fast_swap" => Self::FastSwap,
            "partial_reconfig" => Self::PartialReconfig,
            "isolate" => Self::Isolate,
            _ => Self::Other(s),
        }
    }
}

impl From<ReconfigureAction> for String {
    fn from(a: ReconfigureAction) -> Self {
        a.as_str().to_string()
    }
}

impl std::fmt::Display for ReconfigureAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Host → simulator reconfiguration request. `cmd_id` must be unique per host
/// lifetime; it correlates the eventual `cmd_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconfigureCommand {
    pub cmd_id: String,
    pub target_node: String,
    pub action: ReconfigureAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spare_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_state: Option<Value>,
}

/// Synchronous acceptance notice. Not the correlated completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdAck {
    pub cmd_id: String,
    pub status: String,
}

impl CmdAck {
    pub fn accepted(cmd_id: impl Into<String>) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            status: "accepted".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmdStatus {
    Success,
    Failed,
}

/// Terminal outcome of a reconfiguration command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdResult {
    pub cmd_id: String,
    pub status: CmdStatus,
    pub duration_ms: u64,
    pub sandbox_passed: bool,
    /// Structured failure cause for invalid commands (unknown tile,
    /// not-a-spare). Absent on success and on randomized failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ─── Wire envelope ────────────────────────────────────────────────────────────

/// The full message union carried over the HAL link, tagged by `msg_type`.
/// One JSON object per line; a line whose `msg_type` is not listed here fails
/// to parse and is dropped by the reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum HalMessage {
    Heartbeat(Heartbeat),
    StatusSnapshot(StatusSnapshot),
    CmdAck(CmdAck),
    CmdResult(CmdResult),
    FaultEvent(FaultEvent),
    StatusRequest,
    CmdReconfigure(ReconfigureCommand),
}

// ─── Recovery plans ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanSource {
    Cache,
    Model,
    Heuristic,
    Fallback,
}

impl std::fmt::Display for PlanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::Model => write!(f, "model"),
            Self::Heuristic => write!(f, "heuristic"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A recovery plan with its provenance and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub action: ReconfigureAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spare_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,
    pub confidence: f64,
    pub source: PlanSource,
}

/// Coarse metrics used to key the success cache.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextMetrics {
    pub load: f64,
    pub temp_c: f64,
}

/// The situation a plan is recommended for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub node_id: String,
    pub fault_type: FaultKind,
    pub metrics: ContextMetrics,
}

impl RecoveryContext {
    /// Build a context from a fault event. Load and temperature are pulled
    /// from the event's evidence map when present.
    pub fn from_fault(event: &FaultEvent) -> Self {
        let num = |key: &str| {
            event
                .evidence
                .get(key)
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };
        Self {
            node_id: event.node_id.clone(),
            fault_type: event.fault_type.clone(),
            metrics: ContextMetrics {
                load: num("load"),
                temp_c: num("temp_c"),
            },
        }
    }

    /// Deterministic coarse fingerprint: SHA-256 over the canonical tuple
    /// `(node_id, fault_type, load·10 truncated, temp_c truncated)`.
    /// Equal tuples always produce equal fingerprints.
    pub fn fingerprint(&self) -> String {
        let key = format!(
            "{}|{}|{}|{}",
            self.node_id,
            self.fault_type.as_str(),
            (self.metrics.load * 10.0) as i64,
            self.metrics.temp_c as i64,
        );
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate a tile id: non-empty, bounded, alphanumeric plus `-`/`_`.
pub fn validate_tile_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_heartbeat(node: &str) -> Heartbeat {
        Heartbeat {
            node_id: node.to_string(),
            timestamp: 1_700_000_000.25,
            metrics: TileMetrics {
                temp_c: 41.5,
                voltage_v: 1.0,
                load: 0.3,
                error_count: 2.0,
                last_output_crc: "0x1a2b".to_string(),
                status_code: None,
            },
            status: TileStatus::Ok,
        }
    }

    #[test]
    fn heartbeat_round_trips_through_envelope() {
        let msg = HalMessage::Heartbeat(sample_heartbeat("tile_4"));
        let line = serde_json::to_string(&msg).expect("serialize");
        assert!(line.contains(r#""msg_type":"heartbeat""#), "tag missing: {line}");
        let back: HalMessage = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn snapshot_nodes_serialize_in_sorted_order() {
        let mut nodes = BTreeMap::new();
        for id in ["tile_2", "tile_0", "tile_10", "tile_1"] {
            nodes.insert(id.to_string(), sample_heartbeat(id));
        }
        let snap = StatusSnapshot {
            timestamp: 1.0,
            nodes,
        };
        let keys: Vec<&String> = snap.nodes.keys().collect();
        // Lexicographic order, as produced by the board.
        assert_eq!(keys, ["tile_0", "tile_1", "tile_10", "tile_2"]);
    }

    #[test]
    fn unknown_msg_type_fails_to_parse() {
        let line = r#"{"msg_type":"flux_capacitor","node_id":"tile_0"}"#;
        assert!(serde_json::from_str::<HalMessage>(line).is_err());
    }

    #[test]
    fn status_request_is_tag_only() {
        let line = serde_json::to_string(&HalMessage::StatusRequest).unwrap();
        assert_eq!(line, r#"{"msg_type":"status_request"}"#);
        let back: HalMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back, HalMessage::StatusRequest);
    }

    #[test]
    fn fault_kind_preserves_opaque_values() {
        let kind: FaultKind = serde_json::from_value(json!("cosmic_ray")).unwrap();
        assert_eq!(kind, FaultKind::Other("cosmic_ray".to_string()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("cosmic_ray"));

        let known: FaultKind = serde_json::from_value(json!("missing_heartbeat")).unwrap();
        assert_eq!(known, FaultKind::MissingHeartbeat);
    }

    #[test]
    fn reconfigure_action_preserves_opaque_values() {
        let action: ReconfigureAction = serde_json::from_value(json!("defrag")).unwrap();
        assert_eq!(action, ReconfigureAction::Other("defrag".to_string()));
        let known: ReconfigureAction = serde_json::from_value(json!("fast_swap")).unwrap();
        assert_eq!(known, ReconfigureAction::FastSwap);
    }

    #[test]
    fn severity_implies_injection_duration() {
        assert_eq!(FaultSeverity::Critical.implied_duration(), None);
        assert_eq!(
            FaultSeverity::Major.implied_duration(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            FaultSeverity::Minor.implied_duration(),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn fault_event_defaults_severity_to_major() {
        let raw = r#"{
            "msg_type": "fault_event",
            "fault_id": "manual_tile_5_1700000000",
            "node_id": "tile_5",
            "fault_type": "overheat",
            "timestamp": 1700000000.0
        }"#;
        let msg: HalMessage = serde_json::from_str(raw).unwrap();
        match msg {
            HalMessage::FaultEvent(evt) => {
                assert_eq!(evt.severity, FaultSeverity::Major);
                assert!(evt.evidence.is_empty());
            }
            other => panic!("expected fault_event, got {other:?}"),
        }
    }

    #[test]
    fn cmd_result_reason_omitted_on_success() {
        let res = CmdResult {
            cmd_id: "cmd_1".to_string(),
            status: CmdStatus::Success,
            duration_ms: 12,
            sandbox_passed: true,
            reason: None,
        };
        let s = serde_json::to_string(&res).unwrap();
        assert!(s.contains(r#""status":"success""#));
        assert!(!s.contains("reason"), "reason must be omitted when None: {s}");
    }

    #[test]
    fn cmd_ack_accepted_constructor() {
        let ack = CmdAck::accepted("cmd_42");
        assert_eq!(ack.status, "accepted");
        let s = serde_json::to_string(&HalMessage::CmdAck(ack)).unwrap();
        assert!(s.contains(r#""msg_type":"cmd_ack""#));
    }

    #[test]
    fn metrics_tolerate_sparse_bodies() {
        let raw = r#"{"load": 0.5}"#;
        let metrics: TileMetrics = serde_json::from_str(raw).unwrap();
        assert_eq!(metrics.temp_c, 40.0);
        assert_eq!(metrics.voltage_v, 1.0);
        assert_eq!(metrics.load, 0.5);
        assert_eq!(metrics.last_output_crc, "0x0");
        assert!(metrics.status_code.is_none());
    }

    // ─── Fingerprint ─────────────────────────────────────────────────────────

    fn ctx(node: &str, kind: FaultKind, load: f64, temp: f64) -> RecoveryContext {
        RecoveryContext {
            node_id: node.to_string(),
            fault_type: kind,
            metrics: ContextMetrics { load, temp_c: temp },
        }
    }

    #[test]
    fn fingerprint_is_stable_for_equal_tuples() {
        let a = ctx("tile_1", FaultKind::MissingHeartbeat, 0.31, 42.7);
        let b = ctx("tile_1", FaultKind::MissingHeartbeat, 0.31, 42.7);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_coarsens_load_and_temp() {
        // Same decile of load and same whole degree → same key.
        let a = ctx("tile_1", FaultKind::Overheat, 0.31, 42.1);
        let b = ctx("tile_1", FaultKind::Overheat, 0.39, 42.9);
        assert_eq!(a.fingerprint(), b.fingerprint());

        // Different decile → different key.
        let c = ctx("tile_1", FaultKind::Overheat, 0.41, 42.1);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn fingerprint_separates_nodes_and_kinds() {
        let a = ctx("tile_1", FaultKind::Overheat, 0.0, 40.0);
        let b = ctx("tile_2", FaultKind::Overheat, 0.0, 40.0);
        let c = ctx("tile_1", FaultKind::StuckOutput, 0.0, 40.0);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn context_from_fault_reads_evidence_metrics() {
        let mut evidence = serde_json::Map::new();
        evidence.insert("load".to_string(), json!(0.62));
        evidence.insert("temp_c".to_string(), json!(55.4));
        let evt = FaultEvent {
            fault_id: "fault_tile_3_1700000000".to_string(),
            node_id: "tile_3".to_string(),
            fault_type: FaultKind::Overheat,
            severity: FaultSeverity::Major,
            timestamp: 1_700_000_000.0,
            evidence,
        };
        let ctx = RecoveryContext::from_fault(&evt);
        assert_eq!(ctx.metrics.load, 0.62);
        assert_eq!(ctx.metrics.temp_c, 55.4);

        // Missing evidence falls back to zero.
        let bare = FaultEvent {
            evidence: serde_json::Map::new(),
            ..evt
        };
        let ctx = RecoveryContext::from_fault(&bare);
        assert_eq!(ctx.metrics.load, 0.0);
        assert_eq!(ctx.metrics.temp_c, 0.0);
    }

    #[test]
    fn plan_source_serializes_lowercase() {
        assert_eq!(serde_json::to_value(PlanSource::Cache).unwrap(), json!("cache"));
        assert_eq!(
            serde_json::to_value(PlanSource::Heuristic).unwrap(),
            json!("heuristic")
        );
    }

    #[test]
    fn test_validate_tile_id() {
        assert!(validate_tile_id("tile_0"));
        assert!(validate_tile_id("spare-7"));
        assert!(!validate_tile_id(""));
        assert!(!validate_tile_id("tile 0"));
    }
}
