//! Phase driver: maps coordination state to an observable signal phase.
//!
//! Rendering is pure. The resulting [`PhaseRecord`] is handed to the audit
//! trail by the coordinator and shown on the console by the node runtime.

use crate::coordinator::ModeKind;
use crate::frontier::Frontier;
use crate::types::{NodeId, Phase, PriorityEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a phase was rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderCause {
    /// Initial render after startup or restart
    Startup,
    /// Self-initiated rotation step
    Switch,
    /// Own counter raised to a peer's higher counter
    CatchUp,
    /// Overload hold started or was replaced
    Overload,
    /// Emergency all-red started or was extended
    Emergency,
    /// Priority state ended
    Release,
    /// Periodic refresh while a priority state is active
    Refresh,
}

/// Rendered phase of one node at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub node_id: NodeId,
    pub phase: Phase,
    pub previous: Phase,
    pub counter: u64,
    pub mode: ModeKind,
    pub cause: RenderCause,
}

impl PhaseRecord {
    /// Whether the visible signal changed
    pub fn flipped(&self) -> bool {
        self.phase != self.previous
    }
}

/// Stateless renderer
pub struct PhaseDriver;

impl PhaseDriver {
    /// Phase shown for a mode and own counter
    pub fn phase(mode: ModeKind, counter: u64) -> Phase {
        match mode {
            ModeKind::Normal => Phase::from_parity(counter),
            ModeKind::Overload(road) => Phase::hold(road),
            ModeKind::Emergency => Phase::AllRed,
        }
    }

    pub fn render(
        node_id: &str,
        mode: ModeKind,
        counter: u64,
        previous: Phase,
        cause: RenderCause,
    ) -> PhaseRecord {
        PhaseRecord {
            node_id: node_id.to_string(),
            phase: Self::phase(mode, counter),
            previous,
            counter,
            mode,
            cause,
        }
    }
}

/// Append-only diagnostic record, keyed by the originating node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub node_id: NodeId,
    pub event: AuditEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Phase(PhaseRecord),
    Merge { frontier: Frontier, changed: bool },
    Priority(PriorityEvent),
}

impl AuditEntry {
    pub fn phase(record: PhaseRecord) -> Self {
        Self {
            at: Utc::now(),
            node_id: record.node_id.clone(),
            event: AuditEvent::Phase(record),
        }
    }

    pub fn merge(origin: &str, frontier: Frontier, changed: bool) -> Self {
        Self {
            at: Utc::now(),
            node_id: origin.to_string(),
            event: AuditEvent::Merge { frontier, changed },
        }
    }

    pub fn priority(event: PriorityEvent) -> Self {
        Self {
            at: Utc::now(),
            node_id: event.origin.clone(),
            event: AuditEvent::Priority(event),
        }
    }

    /// Frontier knowledge carried by this record, used for restart replay
    pub fn frontier_hint(&self) -> Option<Frontier> {
        match &self.event {
            AuditEvent::Phase(record) => {
                Some([(record.node_id.clone(), record.counter)].into_iter().collect())
            }
            AuditEvent::Merge { frontier, .. } => Some(frontier.clone()),
            AuditEvent::Priority(_) => None,
        }
    }
}

/// One-line summary of every known node's rotation phase
pub fn traffic_summary(frontier: &Frontier) -> String {
    let states: Vec<String> = frontier
        .iter()
        .map(|(node_id, count)| {
            let road = if count % 2 == 0 { "MAIN" } else { "SIDE" };
            format!("{}: {} GREEN ({})", node_id, road, count)
        })
        .collect();
    states.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriorityKind, Road};

    #[test]
    fn test_render_by_mode() {
        assert_eq!(PhaseDriver::phase(ModeKind::Normal, 4), Phase::MainGreen);
        assert_eq!(PhaseDriver::phase(ModeKind::Normal, 5), Phase::SideGreen);
        assert_eq!(
            PhaseDriver::phase(ModeKind::Overload(Road::Main), 5),
            Phase::HoldMain
        );
        assert_eq!(PhaseDriver::phase(ModeKind::Emergency, 4), Phase::AllRed);
    }

    #[test]
    fn test_record_flipped() {
        let record = PhaseDriver::render("A", ModeKind::Normal, 3, Phase::MainGreen, RenderCause::Switch);
        assert!(record.flipped());
        assert_eq!(record.phase, Phase::SideGreen);

        let record = PhaseDriver::render("A", ModeKind::Normal, 4, Phase::MainGreen, RenderCause::CatchUp);
        assert!(!record.flipped());
    }

    #[test]
    fn test_frontier_hint() {
        let record = PhaseDriver::render("A", ModeKind::Normal, 7, Phase::MainGreen, RenderCause::Switch);
        let hint = AuditEntry::phase(record).frontier_hint().unwrap();
        assert_eq!(hint.get("A"), Some(7));

        let event = PriorityEvent::new("B".to_string(), PriorityKind::Emergency);
        assert!(AuditEntry::priority(event).frontier_hint().is_none());
    }

    #[test]
    fn test_audit_entry_json_line() {
        let frontier: Frontier = [("B".to_string(), 2)].into_iter().collect();
        let entry = AuditEntry::merge("B", frontier, true);
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"type\":\"merge\""));

        let parsed: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_traffic_summary() {
        let frontier: Frontier = [("B".to_string(), 3), ("A".to_string(), 2)]
            .into_iter()
            .collect();
        assert_eq!(
            traffic_summary(&frontier),
            "A: MAIN GREEN (2), B: SIDE GREEN (3)"
        );
    }
}
