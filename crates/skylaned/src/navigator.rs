//! Waypoint Navigator
//!
//! Drives the vehicle to targets in the Offboard phase. Each `navigate_to`
//! call is one navigation session: setpoint sends and position reads
//! alternate at the setpoint cadence until the planar distance drops below
//! the waypoint's threshold or its timeout runs out.
//!
//! A newer session, a land request, emergency stop or link loss ends the
//! running session at its next tick.

use skylane_common::config::NavigationConfig;
use skylane_common::{FlightError, FlightPhase, NavigationOutcome, PositionNedYaw, RouteReport, Waypoint};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::flight::FlightStateMachine;
use crate::lock;

/// Distance is logged at most this often while tracking.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

pub struct WaypointNavigator {
    flight: Arc<FlightStateMachine>,
    /// Last commanded heading, the base for relative yaw changes.
    last_yaw_deg: Mutex<f32>,
}

impl WaypointNavigator {
    pub fn new(flight: Arc<FlightStateMachine>) -> Self {
        Self {
            flight,
            last_yaw_deg: Mutex::new(0.0),
        }
    }

    pub fn flight(&self) -> &Arc<FlightStateMachine> {
        &self.flight
    }

    /// A waypoint with the configured arrival policy.
    pub fn waypoint(&self, north: f32, east: f32, altitude: f32) -> Waypoint {
        self.flight.config().navigation.waypoint(north, east, altitude)
    }

    pub async fn navigate_to(&self, waypoint: &Waypoint) -> Result<NavigationOutcome, FlightError> {
        let session = self.flight.begin_session();
        self.run(waypoint, session).await
    }

    /// Fly the waypoints in order, stopping at the first one not reached.
    pub async fn navigate_route(&self, waypoints: &[Waypoint]) -> Result<RouteReport, FlightError> {
        let session = self.flight.begin_session();
        let mut report = RouteReport {
            total: waypoints.len(),
            reached: Vec::with_capacity(waypoints.len()),
            last: None,
        };

        for (index, waypoint) in waypoints.iter().enumerate() {
            info!(
                "[NAV] Waypoint {}/{}: {}",
                index + 1,
                waypoints.len(),
                waypoint.label
            );
            let outcome = self.run(waypoint, session).await?;
            let reached = outcome.is_reached();
            report.last = Some(outcome);
            if !reached {
                warn!("[NAV] Route stopped at '{}'", waypoint.label);
                return Ok(report);
            }
            report.reached.push(waypoint.label.clone());

            if index + 1 < waypoints.len() {
                self.settle(waypoint, session).await?;
            }
        }

        info!("[NAV] Route complete ({} waypoints)", report.total);
        Ok(report)
    }

    /// Move by a delta from the current position. The yaw delta is applied to
    /// the last commanded heading.
    pub async fn move_relative(
        &self,
        delta_north: f32,
        delta_east: f32,
        delta_down: f32,
        delta_yaw_deg: f32,
    ) -> Result<NavigationOutcome, FlightError> {
        let here = self.flight.telemetry().current_state().ned();
        let target = here.offset(delta_north, delta_east, delta_down);
        let yaw = wrap_degrees(*lock(&self.last_yaw_deg) + delta_yaw_deg);

        let waypoint = self
            .waypoint(target.north, target.east, (-target.down).max(0.0))
            .with_yaw(yaw)
            .labeled(format!(
                "relative dN={:.1} dE={:.1} dD={:.1} dYaw={:.0}",
                delta_north, delta_east, delta_down, delta_yaw_deg
            ));
        self.navigate_to(&waypoint).await
    }

    async fn run(&self, waypoint: &Waypoint, session: u64) -> Result<NavigationOutcome, FlightError> {
        self.flight.enter_offboard()?;
        *lock(&self.last_yaw_deg) = waypoint.yaw_deg;
        info!("[NAV] Navigating to '{}' ({})", waypoint.label, waypoint.target());

        if let Some(rejected) = self.engage(session).await? {
            return Ok(rejected);
        }
        self.track(waypoint, session).await
    }

    /// Engage offboard if needed. A rejection drops back to Hovering and is
    /// returned as the session's outcome.
    async fn engage(&self, session: u64) -> Result<Option<NavigationOutcome>, FlightError> {
        let handshake = self.flight.handshake();
        if handshake.is_active() {
            return Ok(None);
        }

        let ended = self
            .flight
            .session_ended("goto", session, FlightPhase::Offboard);
        let engaged = tokio::select! {
            result = handshake.engage() => result,
            reason = ended => return Err(reason),
        };

        match engaged {
            Ok(()) => Ok(None),
            Err(rejection) => {
                warn!("[NAV] Offboard handshake rejected: {}", rejection);
                self.flight.fall_back_to_hover("goto")?;
                Ok(Some(NavigationOutcome::HandshakeRejected(rejection)))
            }
        }
    }

    async fn track(&self, waypoint: &Waypoint, session: u64) -> Result<NavigationOutcome, FlightError> {
        let period = self.flight.config().offboard.setpoint_period();
        let setpoint = waypoint.setpoint();
        let timeout = waypoint.timeout();
        let ended = self
            .flight
            .session_ended("goto", session, FlightPhase::Offboard);
        tokio::pin!(ended);

        let started = Instant::now();
        let mut last_distance = None;
        let mut last_log = started;

        loop {
            self.flight
                .check_session("goto", session, FlightPhase::Offboard)?;

            let elapsed = started.elapsed();
            if elapsed > timeout {
                warn!(
                    "[NAV] '{}' not reached within {:.1}s (last distance {:?})",
                    waypoint.label, waypoint.timeout_secs, last_distance
                );
                self.give_up().await?;
                return Ok(NavigationOutcome::TimedOut {
                    elapsed,
                    last_distance_m: last_distance,
                });
            }

            if let Some(rejected) = self.engage(session).await? {
                return Ok(rejected);
            }
            self.send(setpoint).await?;

            let position = self.flight.telemetry().current_state().ned();
            let distance = waypoint.distance_from(&position);
            last_distance = Some(distance);
            if distance < waypoint.arrival_threshold_m {
                let elapsed = started.elapsed();
                info!(
                    "[NAV] Reached '{}' in {:.1}s ({:.2}m off)",
                    waypoint.label,
                    elapsed.as_secs_f32(),
                    distance
                );
                return Ok(NavigationOutcome::Reached {
                    elapsed,
                    distance_m: distance,
                });
            }

            if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                debug!("[NAV] {} | {:.2}m to '{}'", position, distance, waypoint.label);
                last_log = Instant::now();
            }

            tokio::select! {
                _ = time::sleep(period) => {}
                reason = &mut ended => return Err(reason),
            }
        }
    }

    /// Keep holding the reached waypoint so offboard stays alive between
    /// route legs.
    async fn settle(&self, waypoint: &Waypoint, session: u64) -> Result<(), FlightError> {
        let pause = self.flight.config().navigation.settle_pause();
        let period = self.flight.config().offboard.setpoint_period();
        let setpoint = waypoint.setpoint();
        let ended = self
            .flight
            .session_ended("route", session, FlightPhase::Offboard);
        tokio::pin!(ended);

        debug!("[NAV] Settling for {}ms", pause.as_millis());
        let until = Instant::now() + pause;
        loop {
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            self.flight
                .check_session("route", session, FlightPhase::Offboard)?;
            self.send(setpoint).await?;
            tokio::select! {
                _ = time::sleep(period.min(until - now)) => {}
                reason = &mut ended => return Err(reason),
            }
        }
    }

    async fn send(&self, setpoint: PositionNedYaw) -> Result<(), FlightError> {
        self.flight
            .handshake()
            .set_position(setpoint)
            .await
            .map_err(|rejection| {
                warn!("[NAV] Setpoint rejected: {}", rejection);
                FlightError::CommandFailed {
                    command: "set_position_ned",
                    rejection,
                }
            })
    }

    /// Stop a navigation that was cut off from outside (cancelled job).
    pub async fn abandon(&self) {
        if self.flight.phase() != FlightPhase::Offboard {
            return;
        }
        self.flight.begin_session();
        if let Err(e) = self.give_up().await {
            debug!("[NAV] Abandon: {}", e);
        }
    }

    /// Timeout fallback: stop offboard so the autopilot holds position, back
    /// to Hovering.
    async fn give_up(&self) -> Result<(), FlightError> {
        if let Err(rejection) = self.flight.handshake().disengage().await {
            warn!("[NAV] Ignoring stop offboard failure: {}", rejection);
        }
        self.flight.fall_back_to_hover("goto")
    }
}

/// Heading folded into [-180, 180).
fn wrap_degrees(yaw: f32) -> f32 {
    (yaw + 180.0).rem_euclid(360.0) - 180.0
}

/// Straight-line legs flown by `skylaned fly`: a square at `altitude`.
pub fn square_route(navigation: &NavigationConfig, side_m: f32, altitude: f32) -> Vec<Waypoint> {
    let corners = [
        (side_m, 0.0, "North"),
        (side_m, side_m, "North-East"),
        (0.0, side_m, "East"),
        (0.0, 0.0, "Home"),
    ];
    corners
        .iter()
        .map(|&(north, east, name)| {
            navigation
                .waypoint(north, east, altitude)
                .labeled(format!("{} ({:.0}, {:.0})", name, north, east))
        })
        .collect()
}
