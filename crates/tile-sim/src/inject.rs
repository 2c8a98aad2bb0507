//! Fault injection from wire-level `fault_event` messages.

use crate::{Board, SimResult};
use tile_proto::FaultEvent;
use tracing::info;

/// Apply an inbound fault event to the board. Severity implies the forced
/// fault's duration; the event's evidence map doubles as fault parameters.
pub fn inject_from_event(board: &mut Board, event: &FaultEvent) -> SimResult<()> {
    let duration = event.severity.implied_duration();
    board.inject_fault(
        &event.node_id,
        event.fault_type.clone(),
        duration,
        &event.evidence,
    )?;
    info!(
        tile = %event.node_id,
        fault = %event.fault_type,
        severity = %event.severity,
        "fault injected"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimError;
    use std::collections::HashMap;
    use tile_proto::{FaultKind, FaultSeverity, TileStatus};

    fn event(node: &str, severity: FaultSeverity) -> FaultEvent {
        FaultEvent {
            fault_id: format!("fault_{node}_0"),
            node_id: node.to_string(),
            fault_type: FaultKind::StuckOutput,
            severity,
            timestamp: 0.0,
            evidence: serde_json::Map::new(),
        }
    }

    #[test]
    fn injects_with_severity_implied_duration() {
        let mut board = Board::new(4, 1, HashMap::new());
        inject_from_event(&mut board, &event("tile_0", FaultSeverity::Major)).expect("inject");
        let tile = board.tile("tile_0").unwrap();
        assert_eq!(tile.status, TileStatus::Degraded);
        assert!(tile.has_active_fault());
    }

    #[test]
    fn unknown_tile_surfaces_structured_error() {
        let mut board = Board::new(2, 0, HashMap::new());
        let err = inject_from_event(&mut board, &event("tile_9", FaultSeverity::Minor)).unwrap_err();
        assert!(matches!(err, SimError::UnknownTile(_)));
    }

    #[test]
    fn evidence_overrides_fault_params() {
        let mut board = Board::new(2, 0, HashMap::new());
        let mut evt = event("tile_1", FaultSeverity::Minor);
        evt.evidence
            .insert("increase".to_string(), serde_json::json!(9.0));
        inject_from_event(&mut board, &evt).expect("inject");
        assert_eq!(board.tile("tile_1").unwrap().metrics.error_count, 9.0);
    }
}
