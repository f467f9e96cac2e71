//! Vehicle state as reported by telemetry.
//!
//! Positions live in the local NED frame (meters, `down` positive toward the
//! ground). Anything handed to callers exposes altitude as a positive
//! magnitude instead of `down`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::phase::FlightPhase;

/// Local position in the NED frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ned {
    pub north: f32,
    pub east: f32,
    pub down: f32,
}

impl Ned {
    pub fn new(north: f32, east: f32, down: f32) -> Self {
        Self { north, east, down }
    }

    /// Build a position from a positive-up altitude.
    pub fn from_altitude(north: f32, east: f32, altitude: f32) -> Self {
        Self {
            north,
            east,
            down: -altitude.abs(),
        }
    }

    pub fn altitude(&self) -> f32 {
        self.down.abs()
    }

    /// Horizontal distance only; `down` is ignored.
    pub fn planar_distance(&self, other: &Ned) -> f32 {
        (self.north - other.north).hypot(self.east - other.east)
    }

    pub fn offset(&self, north: f32, east: f32, down: f32) -> Ned {
        Ned {
            north: self.north + north,
            east: self.east + east,
            down: self.down + down,
        }
    }
}

impl fmt::Display for Ned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "N={:.2} E={:.2} Alt={:.2}m",
            self.north,
            self.east,
            self.altitude()
        )
    }
}

/// A position setpoint as streamed to the autopilot in offboard mode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionNedYaw {
    pub position: Ned,
    /// Heading in degrees, 0 = north.
    pub yaw_deg: f32,
}

impl PositionNedYaw {
    pub fn new(position: Ned, yaw_deg: f32) -> Self {
        Self { position, yaw_deg }
    }
}

/// Where the current position estimate came from.
///
/// The rich channel carries the full local position. When it is unavailable
/// only the relative altitude is known and north/east collapse to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PositionSource {
    Rich(Ned),
    Basic { relative_altitude_m: f32 },
}

impl PositionSource {
    pub fn ned(&self) -> Ned {
        match *self {
            PositionSource::Rich(ned) => ned,
            PositionSource::Basic {
                relative_altitude_m,
            } => Ned::from_altitude(0.0, 0.0, relative_altitude_m),
        }
    }

    pub fn altitude(&self) -> f32 {
        self.ned().altitude()
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, PositionSource::Basic { .. })
    }
}

/// PX4 flight modes as reported on the flight-mode channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightMode {
    #[default]
    Unknown,
    Ready,
    Takeoff,
    Hold,
    Mission,
    ReturnToLaunch,
    Land,
    Offboard,
    FollowMe,
    Manual,
    Altctl,
    Posctl,
    Acro,
    Stabilized,
    Rattitude,
}

impl FlightMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Ready => "READY",
            Self::Takeoff => "TAKEOFF",
            Self::Hold => "HOLD",
            Self::Mission => "MISSION",
            Self::ReturnToLaunch => "RETURN_TO_LAUNCH",
            Self::Land => "LAND",
            Self::Offboard => "OFFBOARD",
            Self::FollowMe => "FOLLOW_ME",
            Self::Manual => "MANUAL",
            Self::Altctl => "ALTCTL",
            Self::Posctl => "POSCTL",
            Self::Acro => "ACRO",
            Self::Stabilized => "STABILIZED",
            Self::Rattitude => "RATTITUDE",
        }
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-flight health as reported by the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Health {
    pub gyrometer_calibration_ok: bool,
    pub accelerometer_calibration_ok: bool,
    pub magnetometer_calibration_ok: bool,
    pub local_position_ok: bool,
    pub global_position_ok: bool,
    pub home_position_ok: bool,
    pub armable: bool,
}

impl Health {
    /// Everything green.
    pub fn ready() -> Self {
        Self {
            gyrometer_calibration_ok: true,
            accelerometer_calibration_ok: true,
            magnetometer_calibration_ok: true,
            local_position_ok: true,
            global_position_ok: true,
            home_position_ok: true,
            armable: true,
        }
    }

    /// Names of the checks that are currently failing.
    pub fn failing_checks(&self) -> Vec<&'static str> {
        let checks = [
            ("gyro", self.gyrometer_calibration_ok),
            ("accel", self.accelerometer_calibration_ok),
            ("mag", self.magnetometer_calibration_ok),
            ("local_position", self.local_position_ok),
            ("global_position", self.global_position_ok),
            ("home_position", self.home_position_ok),
        ];
        checks
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Latest known vehicle state.
///
/// Each field is fed by its own telemetry channel, so a snapshot may combine
/// values of different age (e.g. `in_air` fresher than `position`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VehicleState {
    pub position: Option<PositionSource>,
    pub armed: bool,
    pub in_air: bool,
    pub flight_mode: FlightMode,
    pub battery_percent: Option<f32>,
    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
}

impl VehicleState {
    /// Current position, the origin when nothing has been received yet.
    pub fn ned(&self) -> Ned {
        self.position.map(|p| p.ned()).unwrap_or_default()
    }

    pub fn altitude(&self) -> f32 {
        self.ned().altitude()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            position: PositionReport::from(self.ned()),
            armed: self.armed,
            in_air: self.in_air,
            connected: self.connected,
            flight_mode: self.flight_mode,
            battery_percent: self.battery_percent,
        }
    }
}

/// Position as exposed to callers: altitude positive up.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionReport {
    pub north: f32,
    pub east: f32,
    pub altitude: f32,
}

impl From<Ned> for PositionReport {
    fn from(ned: Ned) -> Self {
        Self {
            north: ned.north,
            east: ned.east,
            altitude: ned.altitude(),
        }
    }
}

/// Telemetry snapshot in the shape the HTTP/JSON layer serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub position: PositionReport,
    pub armed: bool,
    pub in_air: bool,
    pub connected: bool,
    pub flight_mode: FlightMode,
    pub battery_percent: Option<f32>,
}

/// Snapshot plus the core's own view of the flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(flatten)]
    pub telemetry: TelemetrySnapshot,
    pub phase: FlightPhase,
    pub offboard_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_planar_distance_ignores_down() {
        let a = Ned::new(0.0, 0.0, -2.0);
        let b = Ned::new(3.0, 4.0, -10.0);
        assert_relative_eq!(a.planar_distance(&b), 5.0);
    }

    #[test]
    fn test_basic_source_collapses_to_origin() {
        let source = PositionSource::Basic {
            relative_altitude_m: 1.5,
        };
        let ned = source.ned();
        assert_eq!(ned.north, 0.0);
        assert_eq!(ned.east, 0.0);
        assert_relative_eq!(ned.down, -1.5);
        assert!(source.is_degraded());
    }

    #[test]
    fn test_snapshot_inverts_down() {
        let state = VehicleState {
            position: Some(PositionSource::Rich(Ned::new(1.0, 2.0, -3.5))),
            armed: true,
            in_air: true,
            connected: true,
            flight_mode: FlightMode::Offboard,
            battery_percent: Some(87.0),
            last_update: None,
        };
        let snapshot = state.snapshot();
        assert_relative_eq!(snapshot.position.altitude, 3.5);
        assert_relative_eq!(snapshot.position.north, 1.0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["inAir"], true);
        assert_eq!(json["flightMode"], "OFFBOARD");
        assert_eq!(json["batteryPercent"], 87.0);
    }

    #[test]
    fn test_status_report_flattens_snapshot() {
        let report = StatusReport {
            telemetry: VehicleState::default().snapshot(),
            phase: FlightPhase::Disconnected,
            offboard_active: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["connected"], false);
        assert_eq!(json["phase"], "DISCONNECTED");
        assert_eq!(json["offboardActive"], false);
    }

    #[test]
    fn test_failing_checks() {
        let mut health = Health::ready();
        assert!(health.failing_checks().is_empty());
        health.home_position_ok = false;
        health.magnetometer_calibration_ok = false;
        assert_eq!(health.failing_checks(), vec!["mag", "home_position"]);
    }
}
