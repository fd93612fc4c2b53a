//! Kairos - scheduler simulator
//!
//! Builds a scheduler for a modelled big.LITTLE machine from a TOML
//! configuration, replays a scenario against it and prints every placement,
//! throttling and migration decision.

mod config;
mod scenario;

use crate::config::KairosConfig;
use crate::scenario::{Scenario, Simulator};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kairos - replay scheduling scenarios on a modelled platform
#[derive(Parser, Debug)]
#[command(name = "kairos", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "KAIROS_CONFIG", default_value = "kairos.toml")]
    config: PathBuf,

    /// Scenario to replay (TOML, or JSON with a .json extension)
    scenario: PathBuf,

    /// Write the effective configuration to this path and continue
    #[arg(long)]
    dump_config: Option<PathBuf>,

    /// Enable debug logging (scheduler decisions at trace level need RUST_LOG)
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; the scheduler core's log records are forwarded
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Kairos v{} starting", VERSION);

    let config = KairosConfig::load(&args.config)?;
    info!("Configuration loaded from {:?}", args.config);
    if let Some(path) = &args.dump_config {
        config.save(path)?;
        info!("Effective configuration written to {:?}", path);
    }

    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("loading scenario {:?}", args.scenario))?;
    info!(
        "Replaying {} steps from {:?}",
        scenario.steps.len(),
        args.scenario
    );

    let mut sim = Simulator::new(&config)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = sim.replay(&scenario, &mut out) {
        error!("Replay stopped: {:#}", e);
        sim.summary(&mut out)?;
        return Err(e);
    }

    info!("Replay complete, {} tasks alive", sim.scheduler().tasks().len());
    Ok(())
}
