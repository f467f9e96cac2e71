//! Flight phases and the operations that move between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The core's view of where the flight is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightPhase {
    Disconnected,
    Idle,
    Arming,
    TakingOff,
    Hovering,
    Offboard,
    Landing,
    /// Terminal until an explicit reset.
    EmergencyStopped,
}

impl FlightPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Idle => "IDLE",
            Self::Arming => "ARMING",
            Self::TakingOff => "TAKING_OFF",
            Self::Hovering => "HOVERING",
            Self::Offboard => "OFFBOARD",
            Self::Landing => "LANDING",
            Self::EmergencyStopped => "EMERGENCY_STOPPED",
        }
    }

    pub fn is_airborne(&self) -> bool {
        matches!(
            self,
            Self::TakingOff | Self::Hovering | Self::Offboard | Self::Landing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EmergencyStopped)
    }
}

impl fmt::Display for FlightPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guarded operations of the state machine.
///
/// Emergency stop is not listed: it is never gated by phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlightOperation {
    Connect,
    Arm,
    Takeoff,
    Goto,
    Land,
    Reset,
}

impl FlightOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Arm => "arm",
            Self::Takeoff => "takeoff",
            Self::Goto => "goto",
            Self::Land => "land",
            Self::Reset => "reset",
        }
    }

    /// Phases from which the operation may start.
    pub fn origins(&self) -> &'static [FlightPhase] {
        use FlightPhase::*;
        match self {
            Self::Connect => &[Disconnected],
            Self::Arm => &[Idle],
            Self::Takeoff => &[Idle],
            Self::Goto => &[Hovering, Offboard],
            Self::Land => &[TakingOff, Hovering, Offboard, Landing],
            Self::Reset => &[EmergencyStopped],
        }
    }

    pub fn permitted_from(&self, phase: FlightPhase) -> bool {
        self.origins().contains(&phase)
    }
}
