//! Autopilot link abstraction.
//!
//! The flight core never talks to PX4 directly. It goes through [`Autopilot`],
//! which exposes one independent telemetry stream per channel plus the handful
//! of commands the core issues.
//!
//! Production builds with the `mavlink` feature use [`mavlink::MavlinkAutopilot`].
//! Tests and `skylaned --sim` use [`sim::SimulatedAutopilot`].

use async_trait::async_trait;
use skylane_common::{FlightMode, Health, Ned, PositionNedYaw, Rejection};
use std::pin::Pin;
use tokio_stream::Stream;

#[cfg(feature = "mavlink")]
pub mod mavlink;
pub mod sim;

/// One telemetry channel. Ends when the link goes away.
pub type TelemetryStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

pub type CommandResult = Result<(), Rejection>;

// ============================================================================
// Autopilot Trait
// ============================================================================

/// The seam between the flight core and the vehicle.
#[async_trait]
pub trait Autopilot: Send + Sync {
    /// Issue the connection request. Does not wait for the link to come up;
    /// watch [`Autopilot::connection_state`] for that.
    async fn connect(&self, address: &str) -> Result<(), String>;

    /// `true` once the autopilot is heard, `false` when it goes silent.
    fn connection_state(&self) -> TelemetryStream<bool>;

    /// Full local position. `None` when the autopilot does not provide it.
    fn position_velocity_ned(&self) -> Option<TelemetryStream<Ned>>;

    /// Relative altitude above home in meters (the basic position channel).
    fn position(&self) -> TelemetryStream<f32>;

    fn armed(&self) -> TelemetryStream<bool>;

    fn in_air(&self) -> TelemetryStream<bool>;

    fn flight_mode(&self) -> TelemetryStream<FlightMode>;

    /// Remaining battery in percent.
    fn battery(&self) -> TelemetryStream<f32>;

    fn health(&self) -> TelemetryStream<Health>;

    async fn arm(&self) -> CommandResult;

    async fn set_takeoff_altitude(&self, altitude_m: f32) -> CommandResult;

    async fn takeoff(&self) -> CommandResult;

    async fn land(&self) -> CommandResult;

    /// Stop the motors immediately, in the air or not.
    async fn kill(&self) -> CommandResult;

    async fn set_position_ned(&self, setpoint: PositionNedYaw) -> CommandResult;

    async fn start_offboard(&self) -> CommandResult;

    async fn stop_offboard(&self) -> CommandResult;
}
