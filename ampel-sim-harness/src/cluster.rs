//! In-process multi-node cluster on a virtual clock
//!
//! Every node is a real [`Coordinator`] exchanging encoded frames through an
//! in-memory medium. Time advances in fixed steps, so runs are deterministic
//! for a given fault seed and never sleep.

use crate::fault_injection::{FaultConfig, FaultInjector};
use ampel_core::coordinator::{Coordinator, Effect, NodeStatus, Timing};
use ampel_core::phase::RenderCause;
use ampel_core::storage::MemoryStore;
use ampel_core::types::{Message, NodeId, PriorityKind};
use ampel_core::Frontier;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Virtual time advanced per step, matching the node scheduler tick
pub const STEP_MS: u64 = 100;

/// Cadences of the simulated nodes
#[derive(Debug, Clone, Copy)]
pub struct ClusterTiming {
    pub coordinator: Timing,
    pub send_interval_ms: u64,
    pub refresh_ms: u64,
}

impl Default for ClusterTiming {
    fn default() -> Self {
        Self {
            coordinator: Timing::default(),
            send_interval_ms: 2_000,
            refresh_ms: 1_000,
        }
    }
}

/// Fixed-rate cadence on the virtual clock
#[derive(Debug, Clone, Copy)]
struct Cadence {
    interval_ms: u64,
    next_due_ms: u64,
}

impl Cadence {
    fn new(interval_ms: u64) -> Self {
        let interval_ms = interval_ms.max(1);
        Self {
            interval_ms,
            next_due_ms: interval_ms,
        }
    }

    /// Fires at most once per step; due times missed inside a step collapse
    fn fire(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_due_ms {
            return false;
        }
        let missed = (now_ms - self.next_due_ms) / self.interval_ms + 1;
        self.next_due_ms += missed * self.interval_ms;
        true
    }
}

/// Frame on its way to one receiver
#[derive(Debug, Clone)]
struct InFlight {
    deliver_at_ms: u64,
    to: usize,
    frame: Vec<u8>,
}

/// State for a single node in the cluster
pub struct ClusterNode {
    pub id: NodeId,
    /// `None` while crashed
    coordinator: Option<Coordinator<MemoryStore>>,
    /// Survives crashes, like a disk
    store: MemoryStore,
    /// Highest own counter ever observed, for the monotonicity check
    high_water: u64,
    pub switches: u64,
}

impl ClusterNode {
    pub fn is_crashed(&self) -> bool {
        self.coordinator.is_none()
    }

    pub fn status(&self) -> Option<NodeStatus> {
        self.coordinator.as_ref().map(|c| c.status())
    }

    pub fn coordinator(&self) -> Option<&Coordinator<MemoryStore>> {
        self.coordinator.as_ref()
    }
}

/// Cluster statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub messages_duplicated: u64,
    pub switches: u64,
}

/// In-memory cluster of coordinators
pub struct Cluster {
    pub nodes: Vec<ClusterNode>,
    /// Partition matrix: partitions[i][j] = true means i cannot reach j
    pub partitions: Vec<Vec<bool>>,
    timing: ClusterTiming,
    send: Cadence,
    refresh: Cadence,
    injector: FaultInjector,
    in_flight: Vec<InFlight>,
    t0: Instant,
    now_ms: u64,
    stats: ClusterStats,
    violations: Vec<String>,
}

/// Node names: A..Z, then N26, N27, ...
pub fn node_name(idx: usize) -> NodeId {
    if idx < 26 {
        ((b'A' + idx as u8) as char).to_string()
    } else {
        format!("N{}", idx)
    }
}

impl Cluster {
    /// Create and start a cluster with the specified number of nodes
    pub fn new(num_nodes: usize, timing: ClusterTiming, faults: FaultConfig, seed: u64) -> Self {
        let t0 = Instant::now();
        let mut cluster = Self {
            nodes: Vec::with_capacity(num_nodes),
            partitions: vec![vec![false; num_nodes]; num_nodes],
            timing,
            send: Cadence::new(timing.send_interval_ms),
            refresh: Cadence::new(timing.refresh_ms),
            injector: FaultInjector::new(faults, seed),
            in_flight: Vec::new(),
            t0,
            now_ms: 0,
            stats: ClusterStats::default(),
            violations: Vec::new(),
        };

        for idx in 0..num_nodes {
            let id = node_name(idx);
            let store = MemoryStore::new();
            let mut coordinator = Coordinator::new(id.clone(), timing.coordinator, store.clone(), t0);
            coordinator.start();
            cluster.nodes.push(ClusterNode {
                id,
                coordinator: Some(coordinator),
                store,
                high_water: 0,
                switches: 0,
            });
        }

        info!("Cluster started with {} nodes", num_nodes);
        cluster
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn instant(&self) -> Instant {
        self.t0 + Duration::from_millis(self.now_ms)
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    /// Safety violations seen so far (own counter regressions)
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn set_faults(&mut self, faults: FaultConfig) {
        info!("Fault model changed: {:?}", faults);
        self.injector.set_config(faults);
    }

    /// Check if a node can reach another
    pub fn can_reach(&self, from: usize, to: usize) -> bool {
        !self.partitions[from][to]
    }

    /// Create a network partition between two groups
    pub fn partition(&mut self, group_a: &[usize], group_b: &[usize]) {
        for &a in group_a {
            for &b in group_b {
                self.partitions[a][b] = true;
                self.partitions[b][a] = true;
            }
        }
        info!("Network partition created: {:?} <-> {:?}", group_a, group_b);
    }

    /// Heal all partitions
    pub fn heal_partitions(&mut self) {
        for row in &mut self.partitions {
            row.iter_mut().for_each(|cell| *cell = false);
        }
        info!("All partitions healed");
    }

    /// Stop a node; its store survives
    pub fn crash_node(&mut self, idx: usize) {
        if self.nodes[idx].coordinator.take().is_some() {
            info!("Node {} crashed", self.nodes[idx].id);
        }
    }

    /// Restart a crashed node from its store
    pub fn restart_node(&mut self, idx: usize) {
        if !self.nodes[idx].is_crashed() {
            return;
        }
        let now = self.instant();
        let node = &mut self.nodes[idx];
        let mut coordinator =
            Coordinator::new(node.id.clone(), self.timing.coordinator, node.store.clone(), now);
        coordinator.start();
        info!(
            "Node {} restarted at counter {}",
            node.id,
            coordinator.own_counter()
        );
        node.coordinator = Some(coordinator);
        self.check_monotonic(idx);
    }

    /// Issue an operator command on a node
    pub fn issue(&mut self, idx: usize, kind: PriorityKind) {
        let now = self.instant();
        if self.nodes[idx].is_crashed() {
            warn!("Node {} is down, dropping {}", self.nodes[idx].id, kind);
            return;
        }
        let effects = match self.nodes[idx].coordinator.as_mut() {
            Some(coordinator) => coordinator.issue(kind, now),
            None => return,
        };
        self.apply(idx, effects);
    }

    /// Advance virtual time by one step
    pub fn step(&mut self) {
        self.now_ms += STEP_MS;
        let now = self.instant();

        self.deliver_due(now);
        let send_due = self.send.fire(self.now_ms);
        let refresh_due = self.refresh.fire(self.now_ms);

        for idx in 0..self.nodes.len() {
            let Some(coordinator) = self.nodes[idx].coordinator.as_mut() else {
                continue;
            };
            let mut effects = coordinator.tick(now);

            let advertise = if send_due { coordinator.advertise() } else { None };
            if refresh_due {
                effects.extend(coordinator.refresh());
            }
            effects.extend(advertise.map(Effect::Broadcast));

            self.apply(idx, effects);
        }
    }

    /// Step until `until_ms` (inclusive)
    pub fn run_until(&mut self, until_ms: u64) {
        while self.now_ms + STEP_MS <= until_ms {
            self.step();
        }
    }

    fn deliver_due(&mut self, now: Instant) {
        let now_ms = self.now_ms;
        let (due, pending): (Vec<InFlight>, Vec<InFlight>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|f| f.deliver_at_ms <= now_ms);
        self.in_flight = pending;

        let mut due = due;
        due.sort_by_key(|f| f.deliver_at_ms);

        for frame in due {
            let Some(coordinator) = self.nodes[frame.to].coordinator.as_mut() else {
                self.stats.messages_dropped += 1;
                continue;
            };
            self.stats.messages_delivered += 1;
            let effects = coordinator.handle_frame(&frame.frame, now);
            self.apply(frame.to, effects);
        }
    }

    fn apply(&mut self, from: usize, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(msg) => self.broadcast(from, &msg),
                Effect::Render(record) => {
                    if matches!(record.cause, RenderCause::Switch | RenderCause::Release)
                        && record.flipped()
                    {
                        self.nodes[from].switches += 1;
                        self.stats.switches += 1;
                    }
                }
            }
        }
        self.check_monotonic(from);
    }

    fn broadcast(&mut self, from: usize, msg: &Message) {
        let frame = match msg.to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode message from {}: {}", self.nodes[from].id, e);
                return;
            }
        };

        for to in 0..self.nodes.len() {
            if to == from {
                continue;
            }
            self.stats.messages_sent += 1;

            if !self.can_reach(from, to) || self.injector.should_drop_message() {
                debug!("Dropped {} -> {}", self.nodes[from].id, self.nodes[to].id);
                self.stats.messages_dropped += 1;
                continue;
            }

            let copies = if self.injector.should_duplicate() {
                self.stats.messages_duplicated += 1;
                2
            } else {
                1
            };
            for _ in 0..copies {
                let delay = self.injector.message_delay().as_millis() as u64;
                self.in_flight.push(InFlight {
                    deliver_at_ms: self.now_ms + delay,
                    to,
                    frame: frame.clone(),
                });
            }
        }
    }

    fn check_monotonic(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        let Some(coordinator) = node.coordinator.as_ref() else {
            return;
        };
        let own = coordinator.own_counter();
        if own < node.high_water {
            let violation = format!(
                "{} regressed from {} to {} at {}ms",
                node.id, node.high_water, own, self.now_ms
            );
            warn!("{}", violation);
            self.violations.push(violation);
        }
        node.high_water = node.high_water.max(own);
    }

    /// Step until all running frontiers agree, for at most `within_ms`.
    ///
    /// Catch-ups are not broadcast, so frontiers disagree for up to one
    /// gossip round after every switch.
    pub fn settle(&mut self, within_ms: u64) -> bool {
        let deadline = self.now_ms + within_ms;
        while !self.converged() {
            if self.now_ms >= deadline {
                return false;
            }
            self.step();
        }
        true
    }

    /// Status of every running node
    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.nodes.iter().filter_map(|n| n.status()).collect()
    }

    /// All running nodes hold the same frontier
    pub fn converged(&self) -> bool {
        let frontiers: Vec<&Frontier> = self
            .nodes
            .iter()
            .filter_map(|n| n.coordinator().map(|c| c.frontier()))
            .collect();
        frontiers.windows(2).all(|w| w[0] == w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ampel_core::coordinator::ModeKind;
    use ampel_core::types::{Phase, Road};

    fn scenario_timing() -> ClusterTiming {
        ClusterTiming {
            coordinator: Timing {
                switch_interval: Duration::from_secs(12),
                overload_hold: Duration::from_secs(6),
                emergency: Some(Duration::from_secs(30)),
            },
            send_interval_ms: 2_000,
            refresh_ms: 1_000,
        }
    }

    fn own_counters(cluster: &Cluster) -> Vec<u64> {
        cluster
            .statuses()
            .iter()
            .map(|s| s.own_counter())
            .collect()
    }

    #[test]
    fn test_three_nodes_overload_from_b() {
        let mut cluster = Cluster::new(3, scenario_timing(), FaultConfig::none(), 1);

        cluster.run_until(11_900);
        assert_eq!(own_counters(&cluster), vec![0, 0, 0]);

        cluster.run_until(12_500);
        assert_eq!(own_counters(&cluster), vec![1, 1, 1]);
        assert!(cluster.converged());
        assert!(cluster.statuses().iter().all(|s| s.phase == Phase::SideGreen));

        cluster.run_until(13_000);
        cluster.issue(1, PriorityKind::OverloadMain);
        cluster.run_until(13_200);
        for status in cluster.statuses() {
            assert_eq!(status.mode, ModeKind::Overload(Road::Main));
            assert_eq!(status.phase, Phase::HoldMain);
        }

        cluster.run_until(18_900);
        assert!(cluster.statuses().iter().all(|s| s.phase == Phase::HoldMain));

        cluster.run_until(19_500);
        for status in cluster.statuses() {
            assert_eq!(status.mode, ModeKind::Normal);
            assert_eq!(status.phase, Phase::MainGreen);
            assert_eq!(status.own_counter(), 2);
        }

        // Frontiers agree after the next gossip round
        cluster.run_until(20_500);
        assert!(cluster.converged());
        assert!(cluster.violations().is_empty());
    }

    #[test]
    fn test_partition_blocks_rotation_until_healed() {
        let mut cluster = Cluster::new(3, scenario_timing(), FaultConfig::none(), 1);
        cluster.run_until(13_000);
        cluster.partition(&[0], &[1, 2]);

        cluster.run_until(40_000);
        // Nobody can see the whole frontier at rendezvous
        assert!(own_counters(&cluster).iter().all(|c| *c <= 2));

        cluster.heal_partitions();
        cluster.run_until(70_000);
        assert!(cluster.converged());
        let counters = own_counters(&cluster);
        assert!(counters.iter().all(|c| *c == counters[0]));
        assert!(counters[0] >= 3);
    }

    #[test]
    fn test_restart_resumes_counter() {
        let mut cluster = Cluster::new(3, scenario_timing(), FaultConfig::none(), 1);
        cluster.run_until(25_000);
        let before = cluster.nodes[2].status().map(|s| s.own_counter());
        assert_eq!(before, Some(2));

        cluster.crash_node(2);
        assert!(cluster.nodes[2].is_crashed());
        cluster.run_until(30_000);

        cluster.restart_node(2);
        assert_eq!(cluster.nodes[2].status().map(|s| s.own_counter()), Some(2));

        cluster.run_until(65_000);
        assert!(cluster.converged());
        assert!(cluster.violations().is_empty());
    }

    #[test]
    fn test_node_names() {
        assert_eq!(node_name(0), "A");
        assert_eq!(node_name(25), "Z");
        assert_eq!(node_name(26), "N26");
    }

    #[test]
    fn test_cadence_off_step_interval() {
        let mut cadence = Cadence::new(250);
        let fired: Vec<u64> = (1..=10)
            .map(|step| step * STEP_MS)
            .filter(|now_ms| cadence.fire(*now_ms))
            .collect();
        assert_eq!(fired, vec![300, 500, 800, 1_000]);
    }

    #[test]
    fn test_cadence_zero_interval_fires_every_step() {
        let mut cadence = Cadence::new(0);
        assert!((1..=5).all(|step| cadence.fire(step * STEP_MS)));
    }

    #[test]
    fn test_cluster_with_off_step_gossip() {
        let timing = ClusterTiming {
            send_interval_ms: 250,
            refresh_ms: 0,
            ..scenario_timing()
        };
        let mut cluster = Cluster::new(3, timing, FaultConfig::none(), 1);

        cluster.run_until(13_000);
        assert_eq!(own_counters(&cluster), vec![1, 1, 1]);
        assert!(cluster.converged());
        assert!(cluster.violations().is_empty());
    }
}
