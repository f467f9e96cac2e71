//! Command Facade
//!
//! Synchronous, thread-safe entry points for callers outside the async core
//! (a web handler thread, a CLI). Every flight command is handed to the
//! dedicated flight-core thread through a bounded queue and the call returns
//! at once with a [`CommandHandle`]. Callers may ignore the handle, poll it,
//! block on it or cancel through it.
//!
//! Snapshots (`get_position`, `get_status`) are read directly and never touch
//! the queue. Emergency stop skips the queue too.

use anyhow::Context;
use skylane_common::{
    ArmOutcome, FlightError, FlightPhase, LandOutcome, NavigationOutcome, PositionReport,
    Readiness, RouteReport, SkylaneConfig, StatusReport, TakeoffOutcome, Waypoint,
};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::autopilot::Autopilot;
use crate::flight::FlightStateMachine;
use crate::navigator::WaypointNavigator;

/// Why a command was not accepted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Not connected to the autopilot")]
    NotConnected,

    #[error("Emergency stop active, reset first")]
    EmergencyStopped,

    #[error("Command queue is full")]
    QueueFull,

    #[error("Flight core is not running")]
    CoreStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect,
    WaitForArmable,
    Arm,
    Takeoff {
        altitude_m: f32,
    },
    Goto {
        north: f32,
        east: f32,
        altitude: f32,
    },
    MoveRelative {
        delta_north: f32,
        delta_east: f32,
        delta_down: f32,
        delta_yaw_deg: f32,
    },
    Route(Vec<Waypoint>),
    Land,
    Reset,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::WaitForArmable => "wait_for_armable",
            Command::Arm => "arm",
            Command::Takeoff { .. } => "takeoff",
            Command::Goto { .. } => "goto",
            Command::MoveRelative { .. } => "move_relative",
            Command::Route(_) => "route",
            Command::Land => "land",
            Command::Reset => "reset",
        }
    }

    fn needs_link(&self) -> bool {
        !matches!(self, Command::Connect | Command::Reset)
    }

    fn is_navigation(&self) -> bool {
        matches!(
            self,
            Command::Goto { .. } | Command::MoveRelative { .. } | Command::Route(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Connected,
    Readiness(Readiness),
    Armed(ArmOutcome),
    TookOff(TakeoffOutcome),
    Navigated(NavigationOutcome),
    Route(RouteReport),
    Landed(LandOutcome),
    Stopped,
    Reset(FlightPhase),
    Cancelled,
}

pub type CommandResult = Result<CommandOutput, FlightError>;

struct Job {
    id: Uuid,
    command: Command,
    done: oneshot::Sender<CommandResult>,
    cancel: Arc<Notify>,
}

// ============================================================================
// Command Handle
// ============================================================================

/// Receipt for an accepted command.
pub struct CommandHandle {
    id: Uuid,
    name: &'static str,
    done: oneshot::Receiver<CommandResult>,
    cancel: Arc<Notify>,
}

impl CommandHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the core to stop a navigation command. Other commands run their
    /// bounded waits to the end.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// The result if the command already finished.
    pub fn try_result(&mut self) -> Option<CommandResult> {
        self.done.try_recv().ok()
    }

    /// Block the calling thread until the command finishes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<CommandResult, SubmitError> {
        self.done.blocking_recv().map_err(|_| SubmitError::CoreStopped)
    }
}

// ============================================================================
// Flight core thread
// ============================================================================

/// Owns the flight-core thread and its single-threaded runtime.
pub struct FlightCore {
    facade: CommandFacade,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlightCore {
    pub fn start(config: SkylaneConfig, autopilot: Arc<dyn Autopilot>) -> anyhow::Result<Self> {
        config.validate().context("Invalid flight-core configuration")?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build flight-core runtime")?;

        let flight = FlightStateMachine::new(config.clone(), autopilot);
        let navigator = Arc::new(WaypointNavigator::new(flight.clone()));
        let (jobs_tx, jobs_rx) = mpsc::channel(config.core.queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let facade = CommandFacade {
            jobs: jobs_tx,
            runtime: runtime.handle().clone(),
            flight,
            default_altitude_m: config.takeoff.default_altitude_m,
        };

        let thread = thread::Builder::new()
            .name("flight-core".to_string())
            .spawn(move || runtime.block_on(dispatch(navigator, jobs_rx, shutdown_rx)))
            .context("Failed to spawn flight-core thread")?;

        Ok(Self {
            facade,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn facade(&self) -> CommandFacade {
        self.facade.clone()
    }

    /// Stop the core. Commands still running are dropped.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("[CORE] Flight-core thread panicked");
            }
        }
    }
}

impl Drop for FlightCore {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn dispatch(
    navigator: Arc<WaypointNavigator>,
    mut jobs: mpsc::Receiver<Job>,
    mut shutdown: oneshot::Receiver<()>,
) {
    info!("[CORE] Flight core running");
    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => {
                    tokio::spawn(run_job(navigator.clone(), job));
                }
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }
    info!("[CORE] Flight core stopped");
}

async fn run_job(navigator: Arc<WaypointNavigator>, job: Job) {
    let Job {
        id,
        command,
        done,
        cancel,
    } = job;
    let name = command.name();
    debug!("[CORE] {} started ({})", name, id);

    let result = if command.is_navigation() {
        tokio::select! {
            result = execute(&navigator, command) => result,
            _ = cancel.notified() => {
                info!("[CORE] {} cancelled ({})", name, id);
                navigator.abandon().await;
                Ok(CommandOutput::Cancelled)
            }
        }
    } else {
        execute(&navigator, command).await
    };

    match &result {
        Ok(output) => info!("[CORE] {} finished: {:?}", name, output),
        Err(e) => warn!("[CORE] {} failed: {}", name, e),
    }
    if done.send(result).is_err() {
        debug!("[CORE] Result of {} dropped, nobody waiting", id);
    }
}

async fn execute(navigator: &WaypointNavigator, command: Command) -> CommandResult {
    let flight = navigator.flight();
    match command {
        Command::Connect => flight.connect().await.map(|_| CommandOutput::Connected),
        Command::WaitForArmable => flight
            .wait_for_armable(flight.config().arming.armable_timeout())
            .await
            .map(CommandOutput::Readiness),
        Command::Arm => flight.arm().await.map(CommandOutput::Armed),
        Command::Takeoff { altitude_m } => {
            if flight.phase() == FlightPhase::Idle && !flight.telemetry().current_state().armed {
                info!("[CORE] Vehicle disarmed, arming before takeoff");
                if flight.arm().await? == ArmOutcome::TimedOut {
                    return Err(FlightError::NotArmed);
                }
            }
            flight.takeoff(altitude_m).await.map(CommandOutput::TookOff)
        }
        Command::Goto {
            north,
            east,
            altitude,
        } => {
            let waypoint = navigator.waypoint(north, east, altitude);
            navigator
                .navigate_to(&waypoint)
                .await
                .map(CommandOutput::Navigated)
        }
        Command::MoveRelative {
            delta_north,
            delta_east,
            delta_down,
            delta_yaw_deg,
        } => navigator
            .move_relative(delta_north, delta_east, delta_down, delta_yaw_deg)
            .await
            .map(CommandOutput::Navigated),
        Command::Route(waypoints) => navigator
            .navigate_route(&waypoints)
            .await
            .map(CommandOutput::Route),
        Command::Land => flight.land().await.map(CommandOutput::Landed),
        Command::Reset => flight.reset().map(CommandOutput::Reset),
    }
}

// ============================================================================
// Command Facade
// ============================================================================

/// Cheap to clone; every clone feeds the same core.
#[derive(Clone)]
pub struct CommandFacade {
    jobs: mpsc::Sender<Job>,
    runtime: Handle,
    flight: Arc<FlightStateMachine>,
    default_altitude_m: f32,
}

impl CommandFacade {
    pub fn connect(&self) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::Connect)
    }

    pub fn wait_for_armable(&self) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::WaitForArmable)
    }

    pub fn arm(&self) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::Arm)
    }

    /// Take off to `altitude_m`, or the configured default. Arms first when
    /// the vehicle is idle and disarmed.
    pub fn takeoff(&self, altitude_m: Option<f32>) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::Takeoff {
            altitude_m: altitude_m.unwrap_or(self.default_altitude_m),
        })
    }

    pub fn land(&self) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::Land)
    }

    pub fn goto_position(
        &self,
        north: f32,
        east: f32,
        altitude: f32,
    ) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::Goto {
            north,
            east,
            altitude,
        })
    }

    /// Nudge by a delta from the current position (`delta_down` positive
    /// descends).
    pub fn move_relative(
        &self,
        delta_north: f32,
        delta_east: f32,
        delta_down: f32,
        delta_yaw_deg: f32,
    ) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::MoveRelative {
            delta_north,
            delta_east,
            delta_down,
            delta_yaw_deg,
        })
    }

    pub fn route(&self, waypoints: Vec<Waypoint>) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::Route(waypoints))
    }

    pub fn reset(&self) -> Result<CommandHandle, SubmitError> {
        self.submit(Command::Reset)
    }

    /// Kill the motors. Always accepted, whatever the phase, and never queued
    /// behind other commands.
    pub fn emergency_stop(&self) -> CommandHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let flight = self.flight.clone();
        warn!("[CORE] Emergency stop requested ({})", id);

        self.runtime.spawn(async move {
            let result = flight
                .emergency_stop()
                .await
                .map(|_| CommandOutput::Stopped);
            let _ = done_tx.send(result);
        });

        CommandHandle {
            id,
            name: "emergency_stop",
            done: done_rx,
            cancel: Arc::new(Notify::new()),
        }
    }

    pub fn get_position(&self) -> PositionReport {
        PositionReport::from(self.flight.telemetry().current_state().ned())
    }

    pub fn get_status(&self) -> StatusReport {
        StatusReport {
            telemetry: self.flight.telemetry().current_state().snapshot(),
            phase: self.flight.phase(),
            offboard_active: self.flight.handshake().is_active(),
        }
    }

    pub fn phase(&self) -> FlightPhase {
        self.flight.phase()
    }

    fn submit(&self, command: Command) -> Result<CommandHandle, SubmitError> {
        if self.flight.phase() == FlightPhase::EmergencyStopped && command != Command::Reset {
            return Err(SubmitError::EmergencyStopped);
        }
        if command.needs_link() && !self.flight.telemetry().is_connected() {
            return Err(SubmitError::NotConnected);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let cancel = Arc::new(Notify::new());
        let id = Uuid::new_v4();
        let name = command.name();

        self.jobs
            .try_send(Job {
                id,
                command,
                done: done_tx,
                cancel: cancel.clone(),
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => SubmitError::QueueFull,
                TrySendError::Closed(_) => SubmitError::CoreStopped,
            })?;

        debug!("[CORE] Accepted {} ({})", name, id);
        Ok(CommandHandle {
            id,
            name,
            done: done_rx,
            cancel,
        })
    }
}
