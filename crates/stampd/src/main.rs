//! stampd: the stampgrid daemon.
//!
//! Hosts scale managers for one site. Without a real fabric client it runs
//! them against an in-process simulated fabric:
//!
//! - Worker table (in-memory, or redb under `--data-dir`)
//! - Simulated fabric with per-stamp capacity
//! - One `ScaleManager` loop per simulated instance
//!
//! # Usage
//!
//! ```text
//! stampd simulate --config stampd.toml --home-workers 2 --slave-workers 1 --demand 300
//! stampd check-config --config stampd.toml
//! ```

mod config;
mod fabric;
mod provider;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Overrides, SimulationPlan, StampdConfig};

#[derive(Parser)]
#[command(name = "stampd", about = "stampgrid scale manager daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fleet of scale managers against a simulated fabric.
    Simulate {
        /// Path to stampd.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Site name.
        #[arg(long)]
        site: Option<String>,

        /// Instances started on the home stamp.
        #[arg(long)]
        home_workers: Option<usize>,

        /// Instances started on slave stamps.
        #[arg(long)]
        slave_workers: Option<usize>,

        /// Total site load, spread across live workers.
        #[arg(long)]
        demand: Option<u32>,

        /// How long to run, e.g. "90s" or "5m".
        #[arg(long)]
        duration: Option<String>,

        /// Keep the worker table in a redb file under this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Validate a config file and print the resolved settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,stampd=debug,stampgrid=debug"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<StampdConfig> {
    match path {
        Some(path) => StampdConfig::from_file(path),
        None => Ok(StampdConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Command::Simulate {
            config,
            site,
            home_workers,
            slave_workers,
            demand,
            duration,
            data_dir,
        } => {
            let file = load_config(config.as_ref())?;
            let plan = SimulationPlan::resolve(
                &file,
                Overrides {
                    site,
                    home_workers,
                    slave_workers,
                    demand,
                    duration,
                    data_dir,
                },
            )?;
            info!(site = %plan.site, home_stamp = %plan.home_stamp, "stampd starting simulation");

            let report = simulate::run(plan).await?;
            print!("{}", report.render());
            Ok(())
        }
        Command::CheckConfig { config } => {
            let file = load_config(Some(&config))?;
            let plan = SimulationPlan::resolve(&file, Overrides::default())?;
            println!("config ok: {}", config.display());
            println!("{:#?}", plan.settings);
            Ok(())
        }
    }
}
