//! Diagnostic request manager simulator
//!
//! Runs the request manager against in-process ECUs: the tick loop drives
//! the engine, the simulated bus moves frames and a small scenario scans
//! for ECUs, reads their identification and sends a functional request.
//!
//! # Usage
//!
//! ```bash
//! ./drm-sim --config config/drm-sim.toml --verbose
//! RUST_LOG=drm_core=trace ./drm-sim --skip-discovery
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use drm_core::{DiscoveryTable, RequestManager};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod bus;
mod config;
mod scenario;
mod store;

use bus::SimulatedBus;
use config::SimConfig;
use scenario::{Phase, Scenario};
use store::FileStore;

#[derive(Parser, Debug)]
#[command(name = "drm-sim")]
#[command(about = "Drive the diagnostic request manager against simulated ECUs")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "config/drm-sim.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    /// Read every physical connection without scanning first
    #[arg(long)]
    skip_discovery: bool,
}

fn init_tracing(args: &Args) {
    let default_filter = if args.verbose {
        "drm_sim=debug,drm_core=debug"
    } else {
        "drm_sim=info,drm_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("Loading config from: {}", args.config);
    let config = SimConfig::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config))?;

    let bus = Arc::new(SimulatedBus::new(&config));
    let mut drm = RequestManager::new(config.drm.clone(), bus.clone())
        .context("Failed to create request manager")?
        .with_discovery_listener(Arc::new(|table: &DiscoveryTable| {
            info!(block = %hex::encode(table.as_block()), "Discovery finished");
        }));
    if let Some(path) = &config.store_path {
        info!(path = %path.display(), "Using discovery store");
        drm = drm.with_store(Arc::new(FileStore::new(path)));
    }

    info!(
        connections = drm.connections().len(),
        tick_ms = config.drm.tick_ms,
        "Starting simulation"
    );

    let mut scenario = Scenario::new(&drm, args.skip_discovery);
    let mut interval = tokio::time::interval(Duration::from_millis(config.drm.tick_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                drm.tick();
                bus.pump(&drm);
                ticks += 1;
                if scenario.step(&drm) == Phase::Done {
                    info!(ticks, "Scenario complete");
                    break;
                }
                if ticks >= config.max_ticks {
                    warn!(ticks, phase = ?scenario.phase(), "Tick limit reached");
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    let outcomes = scenario.outcomes();
    let positive = outcomes.iter().filter(|o| o.code.is_positive()).count();
    for outcome in outcomes.iter().filter(|o| !o.code.is_positive()) {
        info!(
            connection = %outcome.connection,
            service = format_args!("0x{:02X}", outcome.service_id),
            code = %outcome.code,
            bytes = outcome.response.len(),
            "Request did not succeed"
        );
    }
    info!(
        requests = outcomes.len(),
        positive,
        frames_in_flight = bus.pending_frames(),
        "Summary"
    );

    drm.shutdown();
    Ok(())
}
