//! In-memory broadcast hub with configurable link faults.
//!
//! Every [`MemoryTransport`] joined to a [`MemoryHub`] receives the frames
//! the others broadcast. Faults apply per receiver, so one broadcast can
//! reach some peers and miss others, the way a lossy radio link does.

use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Fault model applied to each delivery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkFaults {
    /// Probability a delivery is dropped
    pub loss_rate: f64,
    /// Probability a delivery arrives twice
    pub duplicate_rate: f64,
    /// Upper bound of a uniformly random delivery delay
    pub max_delay: Duration,
}

impl LinkFaults {
    pub fn reliable() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::reliable()
        }
    }
}

impl Default for LinkFaults {
    fn default() -> Self {
        Self::reliable()
    }
}

#[derive(Default)]
struct HubState {
    members: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    isolated: HashSet<NodeId>,
    faults: LinkFaults,
    delivered: u64,
    dropped: u64,
}

/// Shared broadcast medium
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: LinkFaults) -> Self {
        let hub = Self::new();
        hub.set_faults(faults);
        hub
    }

    pub fn set_faults(&self, faults: LinkFaults) {
        self.state.lock().faults = faults;
    }

    /// Attach a node. Joining again replaces the previous inbox.
    pub fn join(&self, node_id: impl Into<NodeId>) -> MemoryTransport {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().members.insert(node_id.clone(), tx);
        debug!("Hub: {} joined", node_id);

        MemoryTransport {
            node_id,
            hub: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Detach a node; its pending `recv` returns [`TransportError::Closed`]
    pub fn leave(&self, node_id: &str) {
        self.state.lock().members.remove(node_id);
        debug!("Hub: {} left", node_id);
    }

    /// Cut a node off in both directions
    pub fn isolate(&self, node_id: &str) {
        self.state.lock().isolated.insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.state.lock().isolated.remove(node_id);
    }

    /// Deliveries made and dropped so far
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.delivered, state.dropped)
    }

    fn deliver(&self, from: &str, frame: &[u8]) {
        let mut planned = Vec::new();
        {
            let mut state = self.state.lock();
            let faults = state.faults;
            let sender_isolated = state.isolated.contains(from);
            let mut rng = rand::thread_rng();

            let targets: Vec<(NodeId, mpsc::UnboundedSender<Vec<u8>>)> = state
                .members
                .iter()
                .filter(|(id, _)| id.as_str() != from)
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect();

            for (id, tx) in targets {
                if sender_isolated || state.isolated.contains(&id) || rng.gen::<f64>() < faults.loss_rate {
                    trace!("Hub: dropped {} -> {}", from, id);
                    state.dropped += 1;
                    continue;
                }

                let copies = if rng.gen::<f64>() < faults.duplicate_rate { 2 } else { 1 };
                for _ in 0..copies {
                    let delay = if faults.max_delay.is_zero() {
                        Duration::ZERO
                    } else {
                        faults.max_delay.mul_f64(rng.gen::<f64>())
                    };
                    planned.push((tx.clone(), delay));
                    state.delivered += 1;
                }
            }
        }

        for (tx, delay) in planned {
            let frame = frame.to_vec();
            if delay.is_zero() {
                let _ = tx.send(frame);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(frame);
                });
            }
        }
    }
}

/// One node's attachment to a [`MemoryHub`]
pub struct MemoryTransport {
    node_id: NodeId,
    hub: MemoryHub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.hub.deliver(&self.node_id, frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}
