//! Skylane flight core
//!
//! Offboard waypoint navigation and flight-phase control for PX4 vehicles.
//!
//! Components, leaves first:
//! - `telemetry`  - latest vehicle state from independent channel loops
//! - `connection` - autopilot link setup, telemetry start once per session
//! - `offboard`   - pre-stream-then-start offboard handshake
//! - `flight`     - flight-phase state machine
//! - `navigator`  - waypoint arrival and route sequencing
//! - `facade`     - synchronous command entry points and the core thread

use std::sync::{Mutex, MutexGuard};

pub mod autopilot;
pub mod connection;
pub mod facade;
pub mod flight;
pub mod navigator;
pub mod offboard;
pub mod telemetry;

pub use autopilot::sim::{AutopilotCall, SimConfig, SimulatedAutopilot};
pub use autopilot::Autopilot;
pub use facade::{CommandFacade, CommandHandle, CommandOutput, FlightCore, SubmitError};
pub use flight::FlightStateMachine;
pub use navigator::WaypointNavigator;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
