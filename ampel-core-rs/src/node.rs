//! Node runtime: drives one [`Coordinator`] from timers, the transport and
//! operator commands.
//!
//! The coordinator is owned by a single actor task, so every mutation of the
//! frontier and mode is serialized without locks. Transport I/O runs on two
//! helper tasks connected by channels; the actor only ever does `try_send`
//! towards the network and never waits on it.

use crate::config::{NodeConfig, TimingConfig};
use crate::coordinator::{Coordinator, Effect, NodeStatus, Timing};
use crate::error::{Error, TransportError};
use crate::phase::PhaseRecord;
use crate::storage::DurableStore;
use crate::transport::Transport;
use crate::types::{Message, PriorityKind};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outbound frames buffered between the actor and the send task
const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Control surface of a running node
pub struct NodeHandle {
    commands: mpsc::Sender<PriorityKind>,
    status: watch::Receiver<NodeStatus>,
    phases: broadcast::Sender<PhaseRecord>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    /// Inject a local priority command
    pub async fn issue(&self, kind: PriorityKind) -> Result<(), Error> {
        self.commands.send(kind).await.map_err(|_| Error::Stopped)
    }

    /// Sender for command sources living outside the async runtime
    pub fn command_sender(&self) -> mpsc::Sender<PriorityKind> {
        self.commands.clone()
    }

    /// Latest published status
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Stream of rendered phases
    pub fn subscribe_phases(&self) -> broadcast::Receiver<PhaseRecord> {
        self.phases.subscribe()
    }

    /// Stop all node tasks and wait for the actor to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!("Node task ended abnormally: {}", e);
        }
    }
}

/// Single-writer actor around a coordinator
pub struct Node<S: DurableStore> {
    coordinator: Coordinator<S>,
    timing: TimingConfig,
    outbound: mpsc::Sender<Vec<u8>>,
    status: watch::Sender<NodeStatus>,
    phases: broadcast::Sender<PhaseRecord>,
}

impl<S: DurableStore + 'static> Node<S> {
    /// Start the actor, receive and send tasks for a validated config
    pub fn spawn(config: &NodeConfig, store: S, transport: Arc<dyn Transport>) -> NodeHandle {
        let mut coordinator = Coordinator::new(config.node_id.clone(), Timing::from(config), store, now());
        let startup = coordinator.start();

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (frames_tx, frames_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(coordinator.status());
        let (phases_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);

        spawn_receiver(transport.clone(), frames_tx, shutdown_tx.subscribe());
        spawn_sender(transport, outbound_rx);

        let mut node = Node {
            coordinator,
            timing: config.timing.clone(),
            outbound: outbound_tx,
            status: status_tx,
            phases: phases_tx.clone(),
        };
        node.apply(startup);

        let shutdown_rx = shutdown_tx.subscribe();
        let task = tokio::spawn(node.run(frames_rx, commands_rx, shutdown_rx));

        NodeHandle {
            commands: commands_tx,
            status: status_rx,
            phases: phases_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(
        mut self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut commands: mpsc::Receiver<PriorityKind>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut tick = interval(self.timing.tick());
        let mut send = interval(self.timing.send_interval());
        let mut refresh = interval(self.timing.refresh());
        for timer in [&mut tick, &mut send, &mut refresh] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        info!("[{}] Coordination loop started", self.coordinator.node_id());

        loop {
            let effects = tokio::select! {
                _ = tick.tick() => self.coordinator.tick(now()),
                _ = send.tick() => {
                    if let Some(msg) = self.coordinator.advertise() {
                        self.send(&msg);
                    }
                    Vec::new()
                }
                _ = refresh.tick() => self.coordinator.refresh(),
                Some(frame) = frames.recv() => self.coordinator.handle_frame(&frame, now()),
                Some(kind) = commands.recv() => self.coordinator.issue(kind, now()),
                _ = shutdown.recv() => break,
            };

            self.apply(effects);
            self.publish_status();
        }

        info!("[{}] Coordination loop stopped", self.coordinator.node_id());
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(msg) => self.send(&msg),
                Effect::Render(record) => {
                    let _ = self.phases.send(record);
                }
            }
        }
    }

    fn send(&self, msg: &Message) {
        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode message: {}", TransportError::from(e));
                return;
            }
        };
        if let Err(e) = self.outbound.try_send(bytes) {
            warn!("[{}] Dropping outbound frame: {}", self.coordinator.node_id(), e);
        }
    }

    fn publish_status(&self) {
        let current = self.coordinator.status();
        self.status.send_if_modified(|published| {
            if *published == current {
                false
            } else {
                *published = current;
                true
            }
        });
    }
}

fn spawn_receiver(
    transport: Arc<dyn Transport>,
    frames: mpsc::Sender<Vec<u8>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = transport.recv() => frame,
                _ = shutdown.recv() => break,
            };

            match frame {
                Ok(frame) => {
                    if frames.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(TransportError::Closed) => {
                    debug!("Transport closed, receive task ending");
                    break;
                }
                Err(e) => warn!("Receive error: {}", e),
            }
        }
    });
}

fn spawn_sender(transport: Arc<dyn Transport>, mut outbound: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = transport.broadcast(&frame).await {
                warn!("Broadcast failed: {}", e);
            }
        }
    });
}
