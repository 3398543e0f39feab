//! Node runtime tests over the in-memory hub on paused tokio time

use ampel_core::{
    LinkFaults, MemoryHub, MemoryStore, ModeKind, Node, NodeConfig, NodeHandle, Phase,
    PriorityKind, Transport,
};
use std::sync::Arc;
use std::time::Duration;

fn config(id: &str) -> NodeConfig {
    NodeConfig::new(id)
        .with_ephemeral(true)
        .with_switch_interval(Duration::from_secs(1))
        .with_send_interval(Duration::from_millis(200))
}

fn spawn_cluster(hub: &MemoryHub, ids: &[&str]) -> Vec<NodeHandle> {
    let transports: Vec<Arc<dyn Transport>> = ids
        .iter()
        .map(|id| Arc::new(hub.join(*id)) as Arc<dyn Transport>)
        .collect();

    ids.iter()
        .zip(transports)
        .map(|(id, transport)| Node::spawn(&config(id), MemoryStore::new(), transport))
        .collect()
}

fn own_counters(nodes: &[NodeHandle]) -> Vec<u64> {
    nodes.iter().map(|n| n.status().own_counter()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_cluster_rotates_in_lockstep() {
    let hub = MemoryHub::new();
    let nodes = spawn_cluster(&hub, &["A", "B", "C"]);

    tokio::time::sleep(Duration::from_millis(10_050)).await;

    let counters = own_counters(&nodes);
    let min = *counters.iter().min().unwrap();
    let max = *counters.iter().max().unwrap();
    assert!(min >= 5, "rotation stalled: {:?}", counters);
    assert!(max - min <= 1, "nodes drifted apart: {:?}", counters);

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_emergency_propagates_and_clears() {
    let hub = MemoryHub::new();
    let nodes = spawn_cluster(&hub, &["A", "B", "C"]);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    nodes[1].issue(PriorityKind::Emergency).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    for node in &nodes {
        let status = node.status();
        assert_eq!(status.mode, ModeKind::Emergency);
        assert_eq!(status.phase, Phase::AllRed);
    }

    let frozen = own_counters(&nodes);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(own_counters(&nodes), frozen);

    nodes[2].issue(PriorityKind::EmergencyClear).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    for node in &nodes {
        assert_eq!(node.status().mode, ModeKind::Normal);
    }

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_converges_under_loss_and_duplication() {
    let hub = MemoryHub::with_faults(LinkFaults {
        loss_rate: 0.3,
        duplicate_rate: 0.2,
        max_delay: Duration::from_millis(150),
    });
    let nodes = spawn_cluster(&hub, &["A", "B", "C", "D"]);
    tokio::time::sleep(Duration::from_secs(20)).await;

    // Heal the medium and let gossip settle within one rotation
    hub.set_faults(LinkFaults::reliable());
    tokio::time::sleep(Duration::from_millis(600)).await;

    let counters = own_counters(&nodes);
    let max = *counters.iter().max().unwrap();
    let min = *counters.iter().min().unwrap();
    assert!(max - min <= 1, "nodes drifted apart: {:?}", counters);
    assert!(min >= 1, "rotation stalled: {:?}", counters);

    let (_, dropped) = hub.counters();
    assert!(dropped > 0);

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_phase_stream_reports_switches() {
    let hub = MemoryHub::new();
    let nodes = spawn_cluster(&hub, &["A", "B"]);
    let mut phases = nodes[0].subscribe_phases();

    tokio::time::sleep(Duration::from_millis(2_100)).await;

    let mut seen = Vec::new();
    while let Ok(record) = phases.try_recv() {
        seen.push(record.phase);
    }
    assert!(seen.contains(&Phase::SideGreen));
    assert!(seen.contains(&Phase::MainGreen));

    for node in nodes {
        node.shutdown().await;
    }
}
