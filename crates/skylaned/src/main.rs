//! Skylane Daemon - offboard waypoint flights for PX4
//!
//! `fly` runs the demo mission: connect, arm, take off, fly a square, land.
//! `status` prints the vehicle snapshot as JSON lines.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use skylane_common::{Readiness, SkylaneConfig};
use skylaned::navigator::square_route;
use skylaned::{
    Autopilot, CommandFacade, CommandHandle, CommandOutput, FlightCore, SimConfig,
    SimulatedAutopilot,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skylaned")]
#[command(about = "Skylane - offboard waypoint navigation for PX4", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to /etc/skylane/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Autopilot address, overrides the config (e.g. udp://:14540)
    #[arg(long, global = true)]
    address: Option<String>,

    /// Fly against the built-in simulated vehicle
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fly the square demo mission
    Fly {
        /// Cruise altitude in meters
        #[arg(long)]
        altitude: Option<f32>,

        /// Side of the square in meters
        #[arg(long, default_value_t = 3.0)]
        side: f32,
    },

    /// Print vehicle status as JSON
    Status {
        /// Seconds between reports
        #[arg(long, default_value_t = 1)]
        interval: u64,

        /// Stop after this many reports
        #[arg(long)]
        count: Option<usize>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()) {
        error!("[FATAL] {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("[BOOT] Skylane v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => SkylaneConfig::load_from_path(path)?,
        None => SkylaneConfig::load(),
    };
    if let Some(address) = cli.address {
        config.link.address = address;
    }

    let autopilot = autopilot(cli.sim)?;
    let core = FlightCore::start(config.clone(), autopilot)?;
    let facade = core.facade();

    let result = match cli.command {
        Commands::Fly { altitude, side } => {
            let altitude = altitude.unwrap_or(config.takeoff.default_altitude_m);
            fly(&facade, &config, side, altitude)
        }
        Commands::Status { interval, count } => {
            status(&facade, Duration::from_secs(interval.max(1)), count)
        }
    };

    if result.is_err() && facade.phase().is_airborne() {
        warn!("[BOOT] Mission failed in flight, landing");
        match facade.land().map_err(anyhow::Error::from).and_then(wait) {
            Ok(output) => info!("[BOOT] Recovery landing: {:?}", output),
            Err(e) => error!("[FATAL] Recovery landing failed: {:#}", e),
        }
    }
    core.shutdown();
    result
}

#[cfg(feature = "mavlink")]
fn autopilot(sim: bool) -> Result<Arc<dyn Autopilot>> {
    if sim {
        return Ok(Arc::new(SimulatedAutopilot::new(SimConfig::default())));
    }
    Ok(Arc::new(skylaned::autopilot::mavlink::MavlinkAutopilot::new()))
}

#[cfg(not(feature = "mavlink"))]
fn autopilot(sim: bool) -> Result<Arc<dyn Autopilot>> {
    if !sim {
        bail!("built without the `mavlink` feature; pass --sim to fly the simulated vehicle");
    }
    Ok(Arc::new(SimulatedAutopilot::new(SimConfig::default())))
}

fn wait(handle: CommandHandle) -> Result<CommandOutput> {
    let name = handle.name();
    let output = handle
        .wait()
        .with_context(|| format!("{} never completed", name))?
        .with_context(|| format!("{} failed", name))?;
    Ok(output)
}

fn fly(
    facade: &CommandFacade,
    config: &SkylaneConfig,
    side_m: f32,
    altitude_m: f32,
) -> Result<()> {
    wait(facade.connect()?)?;
    info!("[BOOT] Connected to {}", config.link.address);

    if let CommandOutput::Readiness(Readiness::TimedOut) = wait(facade.wait_for_armable()?)? {
        warn!("[BOOT] Vehicle not reported armable, trying to arm anyway");
    }

    match wait(facade.arm()?)? {
        CommandOutput::Armed(outcome) => info!("[BOOT] Arm: {:?}", outcome),
        other => bail!("unexpected arm result: {:?}", other),
    }

    match wait(facade.takeoff(Some(altitude_m))?)? {
        CommandOutput::TookOff(outcome) if outcome.is_degraded() => {
            warn!("[BOOT] Takeoff degraded at {:.2}m, continuing", outcome.altitude_m())
        }
        CommandOutput::TookOff(outcome) => info!("[BOOT] Takeoff: {:?}", outcome),
        other => bail!("unexpected takeoff result: {:?}", other),
    }

    let route = square_route(&config.navigation, side_m, altitude_m);
    match wait(facade.route(route)?)? {
        CommandOutput::Route(report) if report.is_complete() => {
            info!("[BOOT] Route complete: {:?}", report.reached)
        }
        CommandOutput::Route(report) => warn!(
            "[BOOT] Route incomplete ({}/{}): {:?}",
            report.reached.len(),
            report.total,
            report.last
        ),
        other => bail!("unexpected route result: {:?}", other),
    }

    match wait(facade.land()?)? {
        CommandOutput::Landed(outcome) => info!("[BOOT] Land: {:?}", outcome),
        other => bail!("unexpected land result: {:?}", other),
    }
    Ok(())
}

fn status(facade: &CommandFacade, interval: Duration, count: Option<usize>) -> Result<()> {
    wait(facade.connect()?)?;

    let mut printed = 0;
    while count.map_or(true, |limit| printed < limit) {
        let report = facade.get_status();
        println!("{}", serde_json::to_string(&report)?);
        printed += 1;
        std::thread::sleep(interval);
    }
    Ok(())
}
