//! Grow-only frontier of per-intersection rotation counters.
//!
//! Each node owns exactly one entry and only ever raises it. Entries of
//! peers are adopted through [`Frontier::merge`], the pairwise maximum, so
//! any two nodes that have seen the same updates hold the same frontier
//! regardless of delivery order, loss or duplication.
//!
//! The parity of a node's own counter encodes its rotation phase
//! (even = main road green, odd = side road green).

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};

/// Mapping of node id to rotation counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frontier(BTreeMap<NodeId, u64>);

impl Frontier {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, node_id: &str) -> Option<u64> {
        self.0.get(node_id).copied()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.0.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, NodeId, u64> {
        self.0.iter()
    }

    /// Highest counter known for any node
    pub fn max(&self) -> Option<u64> {
        self.0.values().copied().max()
    }

    /// Raise a single entry to `count` if that is higher. Returns whether
    /// the entry changed.
    pub fn observe(&mut self, node_id: &str, count: u64) -> bool {
        match self.0.get_mut(node_id) {
            Some(current) if *current >= count => false,
            Some(current) => {
                *current = count;
                true
            }
            None => {
                self.0.insert(node_id.to_string(), count);
                true
            }
        }
    }

    /// Join `remote` into this frontier in place. Returns whether any local
    /// value changed.
    pub fn merge(&mut self, remote: &Frontier) -> bool {
        let mut changed = false;
        for (node_id, count) in remote.iter() {
            changed |= self.observe(node_id, *count);
        }
        changed
    }

    /// Pairwise maximum of two frontiers
    pub fn join(&self, other: &Frontier) -> Frontier {
        let mut joined = self.clone();
        joined.merge(other);
        joined
    }

    /// True when every known counter holds the same value
    pub fn all_equal(&self) -> bool {
        let mut values = self.0.values();
        match values.next() {
            Some(first) => values.all(|v| v == first),
            None => true,
        }
    }
}

impl FromIterator<(NodeId, u64)> for Frontier {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        let mut frontier = Frontier::new();
        for (node_id, count) in iter {
            frontier.observe(&node_id, count);
        }
        frontier
    }
}

impl<'a> IntoIterator for &'a Frontier {
    type Item = (&'a NodeId, &'a u64);
    type IntoIter = btree_map::Iter<'a, NodeId, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Outcome of raising the own counter to the frontier maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    pub from: u64,
    pub to: u64,
}

impl CatchUp {
    /// Whether the catch-up changed the rendered rotation phase
    pub fn flips_parity(&self) -> bool {
        self.from % 2 != self.to % 2
    }
}

/// A node's frontier together with the identity of its owner
#[derive(Debug, Clone)]
pub struct FrontierStore {
    node_id: NodeId,
    frontier: Frontier,
}

impl FrontierStore {
    /// Fresh store: own counter at zero, no peers known
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::from_snapshot(node_id, Frontier::new())
    }

    /// Resume from a persisted frontier. The own entry is created at zero if
    /// the snapshot does not contain it.
    pub fn from_snapshot(node_id: impl Into<NodeId>, snapshot: Frontier) -> Self {
        let node_id = node_id.into();
        let mut frontier = snapshot;
        frontier.observe(&node_id, 0);
        Self { node_id, frontier }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    /// Own rotation counter
    pub fn own(&self) -> u64 {
        self.frontier.get(&self.node_id).unwrap_or(0)
    }

    /// Self-initiated switch. Returns the new own counter.
    pub fn increment_self(&mut self) -> u64 {
        let next = self.own().saturating_add(1);
        self.frontier.observe(&self.node_id, next);
        next
    }

    /// Join a peer's frontier. Returns whether any local value changed.
    pub fn merge(&mut self, remote: &Frontier) -> bool {
        self.frontier.merge(remote)
    }

    /// True if some known peer counter is strictly above the own counter
    pub fn is_self_behind(&self) -> bool {
        self.frontier.max().map_or(false, |max| max > self.own())
    }

    /// Rendezvous condition: every known counter, own included, is equal
    pub fn can_self_switch(&self) -> bool {
        self.frontier.all_equal()
    }

    /// Raise the own counter to the highest known counter if behind
    pub fn catch_up(&mut self) -> Option<CatchUp> {
        let from = self.own();
        let to = self.frontier.max()?;
        if to <= from {
            return None;
        }
        self.frontier.observe(&self.node_id, to);
        Some(CatchUp { from, to })
    }
}
