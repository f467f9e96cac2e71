//! Shared types for the skylane flight core.
//!
//! Everything here is runtime-free: the daemon crate owns the async side and
//! the excluded web/chat layers only ever see these types.

pub mod config;
pub mod error;
pub mod outcome;
pub mod phase;
pub mod state;
pub mod waypoint;

pub use config::SkylaneConfig;
pub use error::{FlightError, RejectCode, Rejection};
pub use outcome::{
    ArmOutcome, LandOutcome, NavigationOutcome, Readiness, RouteReport, TakeoffOutcome,
};
pub use phase::{FlightOperation, FlightPhase};
pub use state::{
    FlightMode, Health, Ned, PositionNedYaw, PositionReport, PositionSource, StatusReport,
    TelemetrySnapshot, VehicleState,
};
pub use waypoint::Waypoint;

/// Crate version, shared by the daemon for its boot banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
