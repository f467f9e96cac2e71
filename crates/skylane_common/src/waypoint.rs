//! Navigation targets.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::state::{Ned, PositionNedYaw};

pub const DEFAULT_ARRIVAL_THRESHOLD_M: f32 = 0.5;
pub const DEFAULT_WAYPOINT_TIMEOUT_SECS: f64 = 30.0;

/// A target position with its own arrival and timeout policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub north: f32,
    pub east: f32,
    /// Positive up.
    pub altitude: f32,
    pub yaw_deg: f32,
    pub arrival_threshold_m: f32,
    pub timeout_secs: f64,
    pub label: String,
}

impl Waypoint {
    pub fn new(north: f32, east: f32, altitude: f32) -> Self {
        Self {
            north,
            east,
            altitude,
            yaw_deg: 0.0,
            arrival_threshold_m: DEFAULT_ARRIVAL_THRESHOLD_M,
            timeout_secs: DEFAULT_WAYPOINT_TIMEOUT_SECS,
            label: format!("N{:.1} E{:.1} Alt{:.1}", north, east, altitude),
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_yaw(mut self, yaw_deg: f32) -> Self {
        self.yaw_deg = yaw_deg;
        self
    }

    pub fn with_threshold(mut self, meters: f32) -> Self {
        self.arrival_threshold_m = meters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    pub fn target(&self) -> Ned {
        Ned::from_altitude(self.north, self.east, self.altitude)
    }

    pub fn setpoint(&self) -> PositionNedYaw {
        PositionNedYaw::new(self.target(), self.yaw_deg)
    }

    /// Planar distance from `position` to this waypoint.
    pub fn distance_from(&self, position: &Ned) -> f32 {
        self.target().planar_distance(position)
    }
}

/// Parses `north,east,altitude[,label]`.
impl FromStr for Waypoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, ',').map(str::trim).collect();
        if parts.len() < 3 {
            return Err(format!(
                "expected north,east,altitude[,label], got '{}'",
                s
            ));
        }

        let number = |idx: usize, name: &str| {
            parts[idx]
                .parse::<f32>()
                .map_err(|e| format!("invalid {} '{}': {}", name, parts[idx], e))
        };

        let waypoint = Waypoint::new(
            number(0, "north")?,
            number(1, "east")?,
            number(2, "altitude")?,
        );
        Ok(match parts.get(3) {
            Some(label) if !label.is_empty() => waypoint.labeled(*label),
            _ => waypoint,
        })
    }
}
