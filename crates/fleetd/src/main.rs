//! fleetd — the fleetgrid scheduler daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd check --plan fleet.toml
//! fleetd simulate --plan fleet.toml --passes 3
//! ```

mod config;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::FleetPlan;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid scheduler daemon")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a fleet plan.
    Check {
        /// Path to the plan file.
        #[arg(long)]
        plan: PathBuf,
    },
    /// Place a fleet plan in-process and print the placement report.
    Simulate {
        /// Path to the plan file.
        #[arg(long)]
        plan: PathBuf,

        /// Processing passes to run.
        #[arg(long, default_value = "3")]
        passes: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Check { plan } => {
            let parsed = FleetPlan::from_file(&plan)?;
            parsed.validate()?;
            info!(path = ?plan, "plan is valid");
            println!(
                "{}: {} nodes, {} deployments",
                plan.display(),
                parsed.nodes.len(),
                parsed.deployments.len()
            );
            Ok(())
        }
        Command::Simulate { plan, passes } => {
            let parsed = FleetPlan::from_file(&plan)?;
            info!(path = ?plan, passes, "simulating plan");
            let report = simulate::simulate(&parsed, passes).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleet=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
