//! Ampelnetz Simulation Harness - fault-injection testing for coordination
//!
//! This CLI tool runs whole clusters of coordinators in-process on a virtual
//! clock:
//! - `run` - Run one scenario and print or write its JSON summary
//! - `suite` - Run every scenario, exit non-zero on any failure
//! - `list` - List the available scenarios

mod cluster;
mod fault_injection;
mod scenarios;

use clap::{Parser, Subcommand};
use scenarios::ScenarioError;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ampel-sim")]
#[command(about = "Fault-injection harness for Ampelnetz coordination")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single scenario
    Run {
        /// Scenario to run
        #[arg(short, long, default_value = "happy")]
        scenario: String,

        /// Number of nodes in the cluster
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Seed for the fault injector
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Write the JSON summary here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the full scenario suite
    Suite {
        /// Number of nodes in each cluster
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Seed for the fault injector
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output directory for per-scenario summaries
        #[arg(short = 'd', long)]
        output_dir: Option<PathBuf>,
    },

    /// List available scenarios
    List,
}

fn main() -> Result<(), ScenarioError> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Run {
            scenario,
            nodes,
            seed,
            output,
        } => {
            info!("Running scenario: {} with {} nodes", scenario, nodes);

            let config = scenarios::get_scenario(&scenario)?;
            let report = scenarios::run_scenario(&config, nodes, seed)?;
            let json = serde_json::to_string_pretty(&report)?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Summary written to: {}", path.display());
                }
                None => println!("{}", json),
            }

            if !report.passed {
                std::process::exit(1);
            }
        }

        Commands::Suite {
            nodes,
            seed,
            output_dir,
        } => {
            info!("Running full scenario suite");

            let results = scenarios::run_suite(nodes, seed)?;

            if let Some(dir) = output_dir {
                std::fs::create_dir_all(&dir)?;
                for report in &results.reports {
                    let path = dir.join(format!("{}-summary.json", report.scenario));
                    std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
                    info!("Summary written to: {}", path.display());
                }
            }

            println!("\nScenario Suite Results:");
            for report in &results.reports {
                let verdict = if report.passed { "PASS" } else { "FAIL" };
                println!(
                    "  {:<10} {}  (switches: {}, sent: {}, dropped: {})",
                    report.scenario,
                    verdict,
                    report.stats.switches,
                    report.stats.messages_sent,
                    report.stats.messages_dropped
                );
                for failure in &report.failures {
                    println!("      {}", failure);
                }
            }
            println!("  Total: {}", results.total);
            println!("  Passed: {}", results.passed);
            println!("  Failed: {}", results.failed);

            if results.failed > 0 {
                std::process::exit(1);
            }
        }

        Commands::List => {
            for name in scenarios::SCENARIOS {
                let config = scenarios::get_scenario(name)?;
                println!("  {:<10} {}", config.name, config.description);
            }
        }
    }

    Ok(())
}
