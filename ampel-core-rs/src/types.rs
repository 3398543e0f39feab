//! Core types for the Ampelnetz protocol

use crate::frontier::Frontier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for an intersection node
pub type NodeId = String;

/// One of the two roads crossing at an intersection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Road {
    Main,
    Side,
}

impl fmt::Display for Road {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Road::Main => write!(f, "main"),
            Road::Side => write!(f, "side"),
        }
    }
}

/// Observable signal phase of an intersection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    MainGreen,
    SideGreen,
    HoldMain,
    HoldSide,
    AllRed,
}

impl Phase {
    /// Rotation phase encoded by a counter's parity
    pub fn from_parity(counter: u64) -> Self {
        if counter % 2 == 0 {
            Phase::MainGreen
        } else {
            Phase::SideGreen
        }
    }

    /// Hold phase for an overloaded road
    pub fn hold(road: Road) -> Self {
        match road {
            Road::Main => Phase::HoldMain,
            Road::Side => Phase::HoldSide,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::MainGreen => write!(f, "MAIN ROAD green"),
            Phase::SideGreen => write!(f, "SIDE ROAD green"),
            Phase::HoldMain => write!(f, "OVERLOAD: holding MAIN ROAD green"),
            Phase::HoldSide => write!(f, "OVERLOAD: holding SIDE ROAD green"),
            Phase::AllRed => write!(f, "EMERGENCY: ALL RED"),
        }
    }
}

/// Kind of a priority interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityKind {
    OverloadMain,
    OverloadSide,
    Emergency,
    EmergencyClear,
}

impl fmt::Display for PriorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityKind::OverloadMain => write!(f, "overload_main"),
            PriorityKind::OverloadSide => write!(f, "overload_side"),
            PriorityKind::Emergency => write!(f, "emergency"),
            PriorityKind::EmergencyClear => write!(f, "emergency_clear"),
        }
    }
}

/// Immutable priority interrupt, deduplicated by `id` on receipt.
///
/// `issued_at` is the issuer's local clock in Unix milliseconds. It is
/// never compared against timestamps from other nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEvent {
    pub id: Uuid,
    pub origin: NodeId,
    pub kind: PriorityKind,
    pub issued_at: u64,
}

impl PriorityEvent {
    /// Create a fresh event issued by `origin` now
    pub fn new(origin: NodeId, kind: PriorityKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            kind,
            issued_at: unix_timestamp_millis(),
        }
    }
}

/// Broadcast payloads exchanged between intersections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Full-state gossip of the sender's known frontier
    #[serde(rename = "FRONTIER")]
    Frontier { origin: NodeId, frontier: Frontier },

    /// Priority interrupt, broadcast once by its issuer
    #[serde(rename = "PRIORITY")]
    Priority(PriorityEvent),
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Node that put this message on the air
    pub fn origin(&self) -> &str {
        match self {
            Message::Frontier { origin, .. } => origin,
            Message::Priority(event) => &event.origin,
        }
    }
}

/// Current Unix timestamp in milliseconds
pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let frontier: Frontier = [("A".to_string(), 2), ("B".to_string(), 3)]
            .into_iter()
            .collect();
        let msg = Message::Frontier {
            origin: "A".to_string(),
            frontier,
        };

        let bytes = msg.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"FRONTIER\""));

        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.origin(), "A");
    }

    #[test]
    fn test_priority_wire_format() {
        let event = PriorityEvent::new("B".to_string(), PriorityKind::OverloadMain);
        let bytes = Message::Priority(event.clone()).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "PRIORITY");
        assert_eq!(value["kind"], "overload_main");
        assert_eq!(value["origin"], "B");

        match Message::from_bytes(&bytes).unwrap() {
            Message::Priority(parsed) => assert_eq!(parsed.id, event.id),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_malformed_payload_rejected() {
        assert!(Message::from_bytes(b"not json").is_err());
        assert!(Message::from_bytes(br#"{"type":"VOTE","from":"A"}"#).is_err());
        assert!(Message::from_bytes(br#"{"type":"FRONTIER","origin":"A","frontier":{"A":-1}}"#).is_err());
    }

    #[test]
    fn test_phase_from_parity() {
        assert_eq!(Phase::from_parity(0), Phase::MainGreen);
        assert_eq!(Phase::from_parity(3), Phase::SideGreen);
        assert_eq!(Phase::hold(Road::Side), Phase::HoldSide);
    }
}
