//! Coordination state machine for one intersection.
//!
//! Modes, in increasing priority:
//! - `Normal`: rotation driven by the frontier. A node switches on its own
//!   only at the rendezvous (all known counters equal) once the switch
//!   interval has elapsed, and catches up whenever a peer is ahead.
//! - `Overload`: one road held green for `switch_interval * overload_factor`.
//! - `Emergency`: all red until a clear event, or until the configured
//!   timeout.
//!
//! Leaving a priority state advances the rotation one step with the normal
//! rules (increment at rendezvous, otherwise catch up), so the node never
//! increments while peers are unequal.
//!
//! The coordinator never reads a clock. Every entry point takes `now`, which
//! lets tests and the simulation harness drive many nodes on virtual time.

use crate::config::{EmergencyPolicy, NodeConfig, TimingConfig};
use crate::error::DecodeError;
use crate::frontier::{Frontier, FrontierStore};
use crate::phase::{AuditEntry, PhaseDriver, PhaseRecord, RenderCause};
use crate::storage::DurableStore;
use crate::types::{Message, NodeId, Phase, PriorityEvent, PriorityKind, Road};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Applied priority event ids remembered for deduplication
const SEEN_EVENT_CAPACITY: usize = 4096;

/// Current operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Overload { road: Road, expires_at: Instant },
    Emergency { expires_at: Option<Instant> },
}

impl Mode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::Normal => ModeKind::Normal,
            Mode::Overload { road, .. } => ModeKind::Overload(*road),
            Mode::Emergency { .. } => ModeKind::Emergency,
        }
    }

    /// Overload or emergency
    pub fn is_priority(&self) -> bool {
        !matches!(self, Mode::Normal)
    }
}

/// Clock-free view of [`Mode`] for records and status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Normal,
    Overload(Road),
    Emergency,
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeKind::Normal => write!(f, "NORMAL"),
            ModeKind::Overload(road) => write!(f, "OVERLOAD({})", road),
            ModeKind::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// Durations the state machine works with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub switch_interval: Duration,
    pub overload_hold: Duration,
    /// `None` when an emergency only ends on an explicit clear
    pub emergency: Option<Duration>,
}

impl Timing {
    pub fn new(timing: &TimingConfig, emergency: EmergencyPolicy) -> Self {
        Self {
            switch_interval: timing.switch_interval(),
            overload_hold: timing.overload_hold(),
            emergency: emergency.duration(),
        }
    }
}

impl From<&NodeConfig> for Timing {
    fn from(config: &NodeConfig) -> Self {
        Timing::new(&config.timing, config.emergency)
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::new(&TimingConfig::default(), EmergencyPolicy::default())
    }
}

/// Work the caller must carry out after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Put a message on the broadcast medium
    Broadcast(Message),
    /// A phase was rendered (already written to the audit trail)
    Render(PhaseRecord),
}

/// Snapshot of a node for display and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub mode: ModeKind,
    pub phase: Phase,
    pub frontier: Frontier,
}

impl NodeStatus {
    pub fn own_counter(&self) -> u64 {
        self.frontier.get(&self.node_id).unwrap_or(0)
    }
}

/// Bounded FIFO set of applied event ids
#[derive(Debug)]
struct SeenEvents {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false if the id was already seen
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Per-node coordination state machine
pub struct Coordinator<S: DurableStore> {
    store: FrontierStore,
    durable: S,
    timing: Timing,
    mode: Mode,
    /// Overload received during an emergency, with its own expiry
    pending_overload: Option<(Road, Instant)>,
    phase: Phase,
    last_switch: Instant,
    seen: SeenEvents,
}

impl<S: DurableStore> Coordinator<S> {
    /// Create a coordinator, resuming from the durable store when it holds a
    /// frontier for this node
    pub fn new(node_id: impl Into<NodeId>, timing: Timing, mut durable: S, now: Instant) -> Self {
        let node_id = node_id.into();
        let snapshot = match durable.load_frontier(&node_id) {
            Ok(Some(frontier)) => {
                info!("[{}] Resuming from persisted frontier {:?}", node_id, frontier);
                frontier
            }
            Ok(None) => {
                info!("[{}] No persisted frontier, starting fresh", node_id);
                Frontier::new()
            }
            Err(e) => {
                warn!("[{}] Failed to load frontier, starting fresh: {}", node_id, e);
                Frontier::new()
            }
        };

        let store = FrontierStore::from_snapshot(node_id, snapshot);
        let phase = Phase::from_parity(store.own());

        Self {
            store,
            durable,
            timing,
            mode: Mode::Normal,
            pending_overload: None,
            phase,
            last_switch: now,
            seen: SeenEvents::new(SEEN_EVENT_CAPACITY),
        }
    }

    pub fn node_id(&self) -> &str {
        self.store.node_id()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn frontier(&self) -> &Frontier {
        self.store.frontier()
    }

    pub fn own_counter(&self) -> u64 {
        self.store.own()
    }

    pub fn can_self_switch(&self) -> bool {
        self.store.can_self_switch()
    }

    pub fn pending_overload(&self) -> Option<Road> {
        self.pending_overload.map(|(road, _)| road)
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id().to_string(),
            mode: self.mode.kind(),
            phase: self.phase,
            frontier: self.frontier().clone(),
        }
    }

    /// Persist the initial frontier and render the starting phase
    pub fn start(&mut self) -> Vec<Effect> {
        self.persist();
        self.render(RenderCause::Startup)
    }

    /// Scheduler tick: priority expiry and self-initiated rotation
    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        match self.mode {
            Mode::Emergency {
                expires_at: Some(expires_at),
            } if now >= expires_at => {
                info!("[{}] Emergency period ended", self.node_id());
                self.release_emergency(now)
            }
            Mode::Emergency { .. } => Vec::new(),
            Mode::Overload { expires_at, .. } if now >= expires_at => {
                info!("[{}] Overload period ended, resuming normal operation", self.node_id());
                self.release_to_normal(now)
            }
            Mode::Overload { .. } => Vec::new(),
            Mode::Normal => {
                let elapsed = now.duration_since(self.last_switch);
                if elapsed >= self.timing.switch_interval && self.store.can_self_switch() {
                    self.switch(now)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Re-render the hold or all-red phase while a priority state is active
    pub fn refresh(&mut self) -> Vec<Effect> {
        if self.mode.is_priority() {
            self.render(RenderCause::Refresh)
        } else {
            Vec::new()
        }
    }

    /// Frontier gossip for the send cadence, suppressed in priority states
    pub fn advertise(&self) -> Option<Message> {
        if self.mode.is_priority() {
            return None;
        }
        Some(self.frontier_message())
    }

    /// Decode and apply one received datagram
    pub fn handle_frame(&mut self, bytes: &[u8], now: Instant) -> Vec<Effect> {
        match Message::from_bytes(bytes).map_err(DecodeError::from) {
            Ok(msg) => self.handle_message(msg, now),
            Err(e) => {
                debug!("[{}] Dropping frame ({} bytes): {}", self.node_id(), bytes.len(), e);
                Vec::new()
            }
        }
    }

    pub fn handle_message(&mut self, msg: Message, now: Instant) -> Vec<Effect> {
        // Subnet broadcast loops our own frames back
        if msg.origin() == self.node_id() {
            return Vec::new();
        }

        match msg {
            Message::Frontier { origin, frontier } => self.on_frontier(&origin, frontier, now),
            Message::Priority(event) => self.on_priority(event, now),
        }
    }

    /// Issue a local priority command and broadcast it to peers
    pub fn issue(&mut self, kind: PriorityKind, now: Instant) -> Vec<Effect> {
        let event = PriorityEvent::new(self.node_id().to_string(), kind);
        self.seen.insert(event.id);
        info!("[{}] Issuing {} (id={})", self.node_id(), kind, event.id);
        self.audit(AuditEntry::priority(event.clone()));

        let mut effects = self.apply_priority(&event, now);
        effects.push(Effect::Broadcast(Message::Priority(event)));
        effects
    }

    fn on_frontier(&mut self, origin: &str, remote: Frontier, now: Instant) -> Vec<Effect> {
        let before = self.store.own();
        let changed = self.store.merge(&remote);
        if !changed {
            return Vec::new();
        }

        debug!("[{}] Merged frontier from {}: {:?}", self.node_id(), origin, self.frontier());
        self.audit(AuditEntry::merge(origin, remote, true));
        self.persist();

        if self.mode.is_priority() {
            debug!("[{}] Merge deferred until {} ends", self.node_id(), self.mode.kind());
            return Vec::new();
        }

        if self.store.catch_up().is_some() {
            self.persist();
        }
        if self.store.own() == before {
            return Vec::new();
        }

        info!(
            "[{}] Catching up {} -> {}",
            self.node_id(),
            before,
            self.store.own()
        );
        self.last_switch = now;
        self.render(RenderCause::CatchUp)
    }

    fn on_priority(&mut self, event: PriorityEvent, now: Instant) -> Vec<Effect> {
        if !self.seen.insert(event.id) {
            debug!("[{}] Ignoring duplicate priority event {}", self.node_id(), event.id);
            return Vec::new();
        }

        info!(
            "[{}] Received {} from {} (id={}, issued_at={})",
            self.node_id(),
            event.kind,
            event.origin,
            event.id,
            event.issued_at
        );
        self.audit(AuditEntry::priority(event.clone()));
        self.apply_priority(&event, now)
    }

    fn apply_priority(&mut self, event: &PriorityEvent, now: Instant) -> Vec<Effect> {
        match event.kind {
            PriorityKind::Emergency => {
                if let Mode::Overload { road, .. } = self.mode {
                    info!("[{}] Emergency preempts overload on {} road", self.node_id(), road);
                }
                self.mode = Mode::Emergency {
                    expires_at: self.timing.emergency.map(|d| now + d),
                };
                self.render(RenderCause::Emergency)
            }
            PriorityKind::EmergencyClear => match self.mode {
                Mode::Emergency { .. } => {
                    info!("[{}] Emergency cleared by {}", self.node_id(), event.origin);
                    self.release_emergency(now)
                }
                _ => {
                    debug!("[{}] Clear without active emergency", self.node_id());
                    Vec::new()
                }
            },
            PriorityKind::OverloadMain => self.apply_overload(Road::Main, now),
            PriorityKind::OverloadSide => self.apply_overload(Road::Side, now),
        }
    }

    fn apply_overload(&mut self, road: Road, now: Instant) -> Vec<Effect> {
        let expires_at = now + self.timing.overload_hold;

        if let Mode::Emergency { .. } = self.mode {
            info!("[{}] Overload on {} road deferred by emergency", self.node_id(), road);
            self.pending_overload = Some((road, expires_at));
            return Vec::new();
        }

        self.mode = Mode::Overload { road, expires_at };
        self.render(RenderCause::Overload)
    }

    /// Leave an emergency, resuming an overload that arrived meanwhile and
    /// is still within its hold
    fn release_emergency(&mut self, now: Instant) -> Vec<Effect> {
        match self.pending_overload.take() {
            Some((road, expires_at)) if expires_at > now => {
                info!("[{}] Resuming deferred overload on {} road", self.node_id(), road);
                self.mode = Mode::Overload { road, expires_at };
                self.render(RenderCause::Release)
            }
            _ => self.release_to_normal(now),
        }
    }

    fn release_to_normal(&mut self, now: Instant) -> Vec<Effect> {
        self.mode = Mode::Normal;
        self.pending_overload = None;
        self.last_switch = now;

        let mut broadcast = None;
        if self.store.can_self_switch() {
            self.store.increment_self();
            self.persist();
            broadcast = Some(self.frontier_message());
        } else if self.store.catch_up().is_some() {
            self.persist();
        }

        let mut effects = self.render(RenderCause::Release);
        effects.extend(broadcast.map(Effect::Broadcast));
        effects
    }

    fn switch(&mut self, now: Instant) -> Vec<Effect> {
        let counter = self.store.increment_self();
        debug!("[{}] Self-initiated switch to counter {}", self.node_id(), counter);
        self.persist();
        self.last_switch = now;

        let mut effects = self.render(RenderCause::Switch);
        effects.push(Effect::Broadcast(self.frontier_message()));
        effects
    }

    fn render(&mut self, cause: RenderCause) -> Vec<Effect> {
        let record = PhaseDriver::render(
            self.store.node_id(),
            self.mode.kind(),
            self.store.own(),
            self.phase,
            cause,
        );
        self.phase = record.phase;

        if cause == RenderCause::Refresh {
            debug!("[{}] {}", record.node_id, record.phase);
        } else {
            info!("[{}] {} ({})", record.node_id, record.phase, record.counter);
        }

        self.audit(AuditEntry::phase(record.clone()));
        vec![Effect::Render(record)]
    }

    fn frontier_message(&self) -> Message {
        Message::Frontier {
            origin: self.node_id().to_string(),
            frontier: self.frontier().clone(),
        }
    }

    fn persist(&mut self) {
        let node_id = self.store.node_id().to_string();
        if let Err(e) = self.durable.save_frontier(&node_id, self.store.frontier()) {
            warn!("[{}] Failed to persist frontier, continuing in memory: {}", node_id, e);
        }
    }

    fn audit(&mut self, entry: AuditEntry) {
        if let Err(e) = self.durable.append_audit(&entry) {
            warn!("[{}] Failed to append audit entry: {}", self.store.node_id(), e);
        }
    }
}
