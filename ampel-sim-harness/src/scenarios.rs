//! Predefined coordination scenarios
//!
//! Each scenario is a timeline of actions (priority commands, partitions,
//! crashes, fault model changes) and expectations checked at fixed virtual
//! times. A run yields a [`ScenarioReport`] that serializes to the JSON
//! summary printed by `ampel-sim`.

use crate::cluster::{Cluster, ClusterStats, ClusterTiming};
use crate::fault_injection::FaultConfig;
use ampel_core::coordinator::{ModeKind, Timing};
use ampel_core::types::{NodeId, Phase, PriorityKind};
use ampel_core::Frontier;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from scenario execution
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Scenario needs at least {needed} nodes, got {got}")]
    TooFewNodes { needed: usize, got: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Scripted action or check
#[derive(Debug, Clone)]
pub enum Step {
    Issue { node: usize, kind: PriorityKind },
    Partition { group_a: Vec<usize>, group_b: Vec<usize> },
    Heal,
    Crash(usize),
    Restart(usize),
    SetFaults(FaultConfig),
    /// Run until all frontiers agree, failing after the given time
    Settle { within_ms: u64 },
    Expect(Expectation),
}

/// Condition on the running nodes
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// Every running node renders this phase
    AllPhase(Phase),
    /// Every running node is in this mode
    AllMode(ModeKind),
    /// Every running node holds this own counter
    AllCounter(u64),
    /// Every running node holds at least this own counter
    MinCounter(u64),
    /// Own counter of one node
    Counter { node: usize, value: u64 },
    /// All running frontiers are equal
    Converged,
}

/// Scenario configuration
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub name: String,
    pub description: String,
    pub min_nodes: usize,
    pub duration_ms: u64,
    pub timing: ClusterTiming,
    pub faults: FaultConfig,
    /// Timeline, sorted by virtual time
    pub timeline: Vec<(u64, Step)>,
}

/// Scenario execution results
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub description: String,
    pub nodes: usize,
    pub seed: u64,
    pub duration_ms: u64,
    pub converged: bool,
    pub passed: bool,
    pub frontiers: BTreeMap<NodeId, Frontier>,
    pub phases: BTreeMap<NodeId, Phase>,
    pub switches: BTreeMap<NodeId, u64>,
    pub stats: ClusterStats,
    pub failures: Vec<String>,
}

/// Test suite results
#[derive(Debug, Clone, Serialize)]
pub struct SuiteResults {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub reports: Vec<ScenarioReport>,
}

/// Names accepted by [`get_scenario`]
pub const SCENARIOS: &[&str] = &["happy", "lossy", "overload", "emergency", "partition", "restart"];

fn default_timing() -> ClusterTiming {
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

/// Longest a healthy cluster needs to agree: one rotation plus one gossip round
fn settle_bound(timing: &ClusterTiming) -> u64 {
    timing.coordinator.switch_interval.as_millis() as u64 + timing.send_interval_ms
}

fn expect(at: u64, expectation: Expectation) -> (u64, Step) {
    (at, Step::Expect(expectation))
}

/// Get a predefined scenario by name
pub fn get_scenario(name: &str) -> Result<ScenarioConfig, ScenarioError> {
    let scenario = match name.to_lowercase().as_str() {
        "happy" | "none" => ScenarioConfig {
            name: "happy".to_string(),
            description: "No faults - nodes rotate in lockstep".to_string(),
            min_nodes: 2,
            duration_ms: 65_000,
            timing: default_timing(),
            faults: FaultConfig::none(),
            timeline: vec![
                expect(11_900, Expectation::AllCounter(0)),
                expect(12_500, Expectation::AllPhase(Phase::SideGreen)),
                expect(12_500, Expectation::AllCounter(1)),
                expect(24_500, Expectation::AllPhase(Phase::MainGreen)),
                expect(65_000, Expectation::AllCounter(5)),
                expect(65_000, Expectation::Converged),
            ],
        },

        "lossy" => ScenarioConfig {
            name: "lossy".to_string(),
            description: "Loss, duplication and reordering, then a clean link".to_string(),
            min_nodes: 2,
            duration_ms: 125_000,
            timing: default_timing(),
            faults: FaultConfig::lossy(),
            timeline: vec![
                (120_000, Step::SetFaults(FaultConfig::none())),
                (120_000, Step::Settle { within_ms: 15_000 }),
                expect(125_000, Expectation::MinCounter(3)),
            ],
        },

        "overload" => ScenarioConfig {
            name: "overload".to_string(),
            description: "Overload on the main road from B at 13s, released at 19s".to_string(),
            min_nodes: 2,
            duration_ms: 21_000,
            timing: default_timing(),
            faults: FaultConfig::none(),
            timeline: vec![
                expect(12_500, Expectation::AllCounter(1)),
                expect(12_500, Expectation::AllPhase(Phase::SideGreen)),
                (
                    13_000,
                    Step::Issue {
                        node: 1,
                        kind: PriorityKind::OverloadMain,
                    },
                ),
                expect(13_200, Expectation::AllPhase(Phase::HoldMain)),
                expect(18_900, Expectation::AllPhase(Phase::HoldMain)),
                expect(19_500, Expectation::AllMode(ModeKind::Normal)),
                expect(19_500, Expectation::AllCounter(2)),
                expect(19_500, Expectation::AllPhase(Phase::MainGreen)),
                expect(21_000, Expectation::Converged),
            ],
        },

        "emergency" => ScenarioConfig {
            name: "emergency".to_string(),
            description: "Emergency preempts an overload; a later overload resumes after clear"
                .to_string(),
            min_nodes: 3,
            duration_ms: 30_000,
            timing: default_timing(),
            faults: FaultConfig::none(),
            timeline: vec![
                (
                    13_000,
                    Step::Issue {
                        node: 0,
                        kind: PriorityKind::OverloadSide,
                    },
                ),
                expect(13_200, Expectation::AllPhase(Phase::HoldSide)),
                (
                    14_000,
                    Step::Issue {
                        node: 2,
                        kind: PriorityKind::Emergency,
                    },
                ),
                expect(14_200, Expectation::AllPhase(Phase::AllRed)),
                (
                    15_000,
                    Step::Issue {
                        node: 1,
                        kind: PriorityKind::OverloadMain,
                    },
                ),
                expect(15_200, Expectation::AllPhase(Phase::AllRed)),
                (
                    16_000,
                    Step::Issue {
                        node: 2,
                        kind: PriorityKind::EmergencyClear,
                    },
                ),
                expect(16_200, Expectation::AllPhase(Phase::HoldMain)),
                expect(21_500, Expectation::AllMode(ModeKind::Normal)),
                expect(21_500, Expectation::AllCounter(2)),
                expect(30_000, Expectation::Converged),
            ],
        },

        "partition" => ScenarioConfig {
            name: "partition".to_string(),
            description: "One node cut off for 26s, then healed".to_string(),
            min_nodes: 3,
            duration_ms: 70_000,
            timing: default_timing(),
            faults: FaultConfig::none(),
            timeline: vec![
                (
                    13_000,
                    Step::Partition {
                        group_a: vec![0],
                        group_b: vec![1, 2],
                    },
                ),
                (40_000, Step::Heal),
                (40_000, Step::Settle { within_ms: 15_000 }),
                expect(70_000, Expectation::Converged),
                expect(70_000, Expectation::MinCounter(3)),
            ],
        },

        "restart" => ScenarioConfig {
            name: "restart".to_string(),
            description: "Node C crashes at 25s and restarts from its store at 30s".to_string(),
            min_nodes: 3,
            duration_ms: 65_000,
            timing: default_timing(),
            faults: FaultConfig::none(),
            timeline: vec![
                expect(25_000, Expectation::Counter { node: 2, value: 2 }),
                (25_000, Step::Crash(2)),
                (30_000, Step::Restart(2)),
                expect(30_000, Expectation::Counter { node: 2, value: 2 }),
                expect(65_000, Expectation::Converged),
                expect(65_000, Expectation::MinCounter(4)),
            ],
        },

        other => return Err(ScenarioError::UnknownScenario(other.to_string())),
    };
    Ok(scenario)
}

fn check(cluster: &Cluster, expectation: &Expectation) -> Result<(), String> {
    let statuses = cluster.statuses();
    let at = cluster.now_ms();

    let failed = |what: String| Err(format!("at {}ms: {}", at, what));

    match expectation {
        Expectation::AllPhase(phase) => {
            let wrong: Vec<_> = statuses
                .iter()
                .filter(|s| s.phase != *phase)
                .map(|s| format!("{}={:?}", s.node_id, s.phase))
                .collect();
            if wrong.is_empty() {
                Ok(())
            } else {
                failed(format!("expected all {:?}, got {}", phase, wrong.join(", ")))
            }
        }
        Expectation::AllMode(mode) => {
            let wrong: Vec<_> = statuses
                .iter()
                .filter(|s| s.mode != *mode)
                .map(|s| format!("{}={}", s.node_id, s.mode))
                .collect();
            if wrong.is_empty() {
                Ok(())
            } else {
                failed(format!("expected all {}, got {}", mode, wrong.join(", ")))
            }
        }
        Expectation::AllCounter(value) => {
            let wrong: Vec<_> = statuses
                .iter()
                .filter(|s| s.own_counter() != *value)
                .map(|s| format!("{}={}", s.node_id, s.own_counter()))
                .collect();
            if wrong.is_empty() {
                Ok(())
            } else {
                failed(format!("expected all counters {}, got {}", value, wrong.join(", ")))
            }
        }
        Expectation::MinCounter(value) => {
            let wrong: Vec<_> = statuses
                .iter()
                .filter(|s| s.own_counter() < *value)
                .map(|s| format!("{}={}", s.node_id, s.own_counter()))
                .collect();
            if wrong.is_empty() {
                Ok(())
            } else {
                failed(format!("expected counters >= {}, got {}", value, wrong.join(", ")))
            }
        }
        Expectation::Counter { node, value } => {
            match cluster.nodes.get(*node).and_then(|n| n.status()) {
                Some(status) if status.own_counter() == *value => Ok(()),
                Some(status) => failed(format!(
                    "expected {} at {}, got {}",
                    status.node_id,
                    value,
                    status.own_counter()
                )),
                None => failed(format!("node {} is not running", node)),
            }
        }
        Expectation::Converged => {
            if cluster.converged() {
                Ok(())
            } else {
                failed("frontiers diverged".to_string())
            }
        }
    }
}

/// Run a scenario on a fresh cluster
pub fn run_scenario(
    config: &ScenarioConfig,
    nodes: usize,
    seed: u64,
) -> Result<ScenarioReport, ScenarioError> {
    if nodes < config.min_nodes {
        return Err(ScenarioError::TooFewNodes {
            needed: config.min_nodes,
            got: nodes,
        });
    }

    info!("Scenario {}: {} ({} nodes, seed {})", config.name, config.description, nodes, seed);

    let mut cluster = Cluster::new(nodes, config.timing, config.faults.clone(), seed);
    let mut failures = Vec::new();

    for (at, step) in &config.timeline {
        cluster.run_until(*at);
        match step {
            Step::Issue { node, kind } => cluster.issue(*node, *kind),
            Step::Partition { group_a, group_b } => cluster.partition(group_a, group_b),
            Step::Heal => cluster.heal_partitions(),
            Step::Crash(node) => cluster.crash_node(*node),
            Step::Restart(node) => cluster.restart_node(*node),
            Step::SetFaults(faults) => cluster.set_faults(faults.clone()),
            Step::Settle { within_ms } => {
                if !cluster.settle(*within_ms) {
                    let failure = format!("at {}ms: no agreement within {}ms", cluster.now_ms(), within_ms);
                    warn!("Scenario {}: {}", config.name, failure);
                    failures.push(failure);
                }
            }
            Step::Expect(expectation) => {
                if let Err(failure) = check(&cluster, expectation) {
                    warn!("Scenario {}: {}", config.name, failure);
                    failures.push(failure);
                }
            }
        }
    }
    cluster.run_until(config.duration_ms);
    let converged = cluster.settle(settle_bound(&config.timing));

    failures.extend(cluster.violations().iter().cloned());

    let mut frontiers = BTreeMap::new();
    let mut phases = BTreeMap::new();
    for status in cluster.statuses() {
        phases.insert(status.node_id.clone(), status.phase);
        frontiers.insert(status.node_id, status.frontier);
    }
    let switches = cluster
        .nodes
        .iter()
        .map(|n| (n.id.clone(), n.switches))
        .collect();

    let report = ScenarioReport {
        scenario: config.name.clone(),
        description: config.description.clone(),
        nodes,
        seed,
        duration_ms: cluster.now_ms(),
        converged,
        passed: failures.is_empty(),
        frontiers,
        phases,
        switches,
        stats: cluster.stats().clone(),
        failures,
    };

    if report.passed {
        info!("Scenario {} passed", config.name);
    } else {
        warn!("Scenario {} failed with {} findings", config.name, report.failures.len());
    }
    Ok(report)
}

/// Run every predefined scenario
pub fn run_suite(nodes: usize, seed: u64) -> Result<SuiteResults, ScenarioError> {
    let mut reports = Vec::new();
    for name in SCENARIOS {
        let config = get_scenario(name)?;
        reports.push(run_scenario(&config, nodes.max(config.min_nodes), seed)?);
    }

    let passed = reports.iter().filter(|r| r.passed).count();
    Ok(SuiteResults {
        total: reports.len(),
        passed,
        failed: reports.len() - passed,
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_scenario() {
        assert!(matches!(
            get_scenario("byzantine"),
            Err(ScenarioError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_too_few_nodes() {
        let config = get_scenario("partition").unwrap();
        assert!(matches!(
            run_scenario(&config, 2, 1),
            Err(ScenarioError::TooFewNodes { needed: 3, got: 2 })
        ));
    }

    #[test]
    fn test_each_scenario_passes() {
        for name in SCENARIOS {
            let config = get_scenario(name).unwrap();
            let report = run_scenario(&config, 3, 42).unwrap();
            assert!(report.passed, "{} failed: {:?}", name, report.failures);
            assert!(report.converged, "{} did not converge", name);
        }
    }

    #[test]
    fn test_overload_report_summary() {
        let config = get_scenario("overload").unwrap();
        let report = run_scenario(&config, 3, 1).unwrap();

        let twos: Frontier = [("A", 2), ("B", 2), ("C", 2)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert!(report.frontiers.values().all(|f| *f == twos));
        assert!(report.phases.values().all(|p| *p == Phase::MainGreen));
        assert_eq!(report.stats.messages_dropped, 0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"], "overload");
        assert_eq!(json["passed"], true);
        assert_eq!(json["phases"]["B"], "MAIN_GREEN");
    }

    #[test]
    fn test_lossy_run_reproducible() {
        let config = get_scenario("lossy").unwrap();
        let first = run_scenario(&config, 4, 9).unwrap();
        let second = run_scenario(&config, 4, 9).unwrap();
        assert_eq!(first.stats.messages_dropped, second.stats.messages_dropped);
        assert_eq!(first.frontiers, second.frontiers);
    }
}
