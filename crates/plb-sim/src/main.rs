//! plb-sim — drive the placement and load balancing engine offline.
//!
//! Loads a cluster scenario from TOML, runs a number of refreshes at a
//! fixed logical time step and prints the decided movements. With
//! `--apply` every movement is completed before the next round, which
//! shows how the cluster converges.
//!
//! # Usage
//!
//! ```text
//! plb-sim run demos/three-node.toml --refreshes 5 --apply
//! plb-sim check-config plb.toml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

mod scenario;
mod sim;

use scenario::Scenario;
use sim::{SimOptions, Simulation};

#[derive(Parser)]
#[command(name = "plb-sim", about = "Placement and load balancing simulator", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run refreshes over a scenario file.
    Run {
        /// Scenario TOML file.
        scenario: PathBuf,
        /// Number of refreshes to run.
        #[arg(short = 'n', long, default_value = "1")]
        refreshes: u32,
        /// Logical seconds between refreshes.
        #[arg(long, default_value = "10")]
        step: f64,
        /// Complete every movement before the next refresh.
        #[arg(long)]
        apply: bool,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate an engine configuration file.
    CheckConfig {
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            scenario,
            refreshes,
            step,
            apply,
            json,
        } => {
            anyhow::ensure!(step.is_finite() && step >= 0.0, "--step must be a non-negative number of seconds");
            let options = SimOptions {
                refreshes,
                step: Duration::from_secs_f64(step),
                apply,
            };
            run(&scenario, &options, json)
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn run(path: &Path, options: &SimOptions, json: bool) -> anyhow::Result<()> {
    let plb = Scenario::from_file(path)?.into_engine()?;
    let mut simulation = Simulation::new(plb);
    let report = simulation.run(options);
    info!(
        rounds = report.rounds.len(),
        actions = report.action_count(),
        pending = simulation.plb().pending_count(),
        "simulation finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", sim::format_report(&report));
    }
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = plb_core::PlbConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    plb_scheduler::check_config(&config)?;
    println!("✓ {} is valid", path.display());
    Ok(())
}
