//! Ampelnetz Core Library
//!
//! Decentralized traffic-light coordination between neighbouring
//! intersections. Each node keeps a grow-only frontier of rotation counters,
//! merged by pairwise maximum, and switches only when every known counter is
//! equal. Overload and emergency events preempt the rotation and release it
//! again without breaking convergence.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod frontier;
pub mod loopback;
pub mod node;
pub mod operator;
pub mod phase;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::{EmergencyPolicy, NodeConfig};
pub use coordinator::{Coordinator, Effect, Mode, ModeKind, NodeStatus, Timing};
pub use error::{Error, Result};
pub use frontier::{Frontier, FrontierStore};
pub use loopback::{LinkFaults, MemoryHub, MemoryTransport};
pub use node::{Node, NodeHandle};
pub use operator::ConsoleCommand;
pub use phase::{traffic_summary, AuditEntry, PhaseDriver, PhaseRecord, RenderCause};
pub use storage::{DurableStore, EphemeralStore, FileStore, MemoryStore, StorageConfig};
pub use transport::{Transport, UdpTransport};
pub use types::*;
