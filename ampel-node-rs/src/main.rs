//! Ampelnetz Node - one intersection controller
//!
//! # Usage
//!
//! ```bash
//! # Subnet broadcast on the default port
//! ampel-node --name A
//!
//! # Three nodes on one host
//! ampel-node --name A --bind 127.0.0.1:10001 --peer 127.0.0.1:10002 --peer 127.0.0.1:10003
//!
//! # From a config file, overriding the rotation period
//! ampel-node --config node.toml --switch-interval 8000
//! ```

use ampel_core::config::NodeConfig;
use ampel_core::operator::{ConsoleCommand, HELP};
use ampel_core::storage::{DurableStore, EphemeralStore, FileStore, StorageConfig};
use ampel_core::transport::UdpTransport;
use ampel_core::{traffic_summary, EmergencyPolicy, Node, Result};
use clap::Parser;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Ampelnetz intersection node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name/identifier (overrides the config file)
    #[arg(short, long)]
    name: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local UDP address to receive on
    #[arg(short, long)]
    bind: Option<String>,

    /// Broadcast destination (can be repeated)
    #[arg(long)]
    peer: Vec<String>,

    /// Normal rotation period in milliseconds
    #[arg(long)]
    switch_interval: Option<u64>,

    /// Frontier gossip cadence in milliseconds
    #[arg(long)]
    send_interval: Option<u64>,

    /// Fraction of the rotation period an overload holds its road
    #[arg(long)]
    overload_factor: Option<f64>,

    /// Emergency duration in milliseconds
    #[arg(long, conflicts_with = "explicit_clear")]
    emergency_timeout: Option<u64>,

    /// Keep emergencies until an explicit clear
    #[arg(long)]
    explicit_clear: bool,

    /// Do not persist state
    #[arg(long)]
    ephemeral: bool,

    /// Base directory for snapshots and audit logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(name) = self.name {
            config = config.with_node_id(name);
        }
        if let Some(bind) = self.bind {
            config = config.with_bind(bind);
        }
        if !self.peer.is_empty() {
            config = config.with_peers(self.peer);
        }
        if let Some(ms) = self.switch_interval {
            config = config.with_switch_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.send_interval {
            config = config.with_send_interval(Duration::from_millis(ms));
        }
        if let Some(factor) = self.overload_factor {
            config = config.with_overload_factor(factor);
        }
        if let Some(duration_ms) = self.emergency_timeout {
            config = config.with_emergency(EmergencyPolicy::Timeout { duration_ms });
        }
        if self.explicit_clear {
            config = config.with_emergency(EmergencyPolicy::ExplicitClear);
        }
        if self.ephemeral {
            config = config.with_ephemeral(true);
        }
        if let Some(dir) = self.data_dir {
            config = config.with_data_dir(dir);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = args.into_config()?;
    info!("Ampelnetz node \"{}\" starting", config.node_id);

    let store: Box<dyn DurableStore> = if config.ephemeral {
        info!("Ephemeral mode, state will not be persisted");
        Box::new(EphemeralStore::new())
    } else {
        let storage = StorageConfig {
            dir: config.data_dir.clone(),
            fsync_on_write: true,
        };
        Box::new(FileStore::new(storage, config.node_id.clone())?)
    };

    let transport = UdpTransport::bind(config.bind_addr()?, config.peer_addrs()?).await?;
    info!(
        "Listening on {}, broadcasting to {:?}",
        transport.local_addr()?,
        transport.peers()
    );

    let node = Node::spawn(&config, store, Arc::new(transport));

    // Console display
    let mut phases = node.subscribe_phases();
    tokio::spawn(async move {
        while let Ok(record) = phases.recv().await {
            println!("[{}] {}", record.node_id, record.phase);
        }
    });

    // Operator console
    let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
    let commands = node.command_sender();
    let status = node.watch_status();
    std::thread::spawn(move || {
        println!("\n{}\n", HELP);

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            match line.parse::<ConsoleCommand>() {
                Ok(ConsoleCommand::Priority(kind)) => {
                    if commands.blocking_send(kind).is_err() {
                        break;
                    }
                }
                Ok(ConsoleCommand::Status) => {
                    let current = status.borrow().clone();
                    println!(
                        "[{}] {} | {} | {}",
                        current.node_id,
                        current.mode,
                        current.phase,
                        traffic_summary(&current.frontier)
                    );
                }
                Ok(ConsoleCommand::Quit) => {
                    let _ = quit_tx.blocking_send(());
                    break;
                }
                Err(e) => println!("{}\n{}", e, HELP),
            }
        }
    });

    tokio::select! {
        Some(()) = quit_rx.recv() => info!("Operator requested shutdown"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Interrupted, shutting down");
        }
    }

    node.shutdown().await;
    Ok(())
}
