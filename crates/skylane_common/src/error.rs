//! Error types for the flight core.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::phase::FlightPhase;

/// Why the autopilot refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectCode {
    Denied,
    NoSetpoint,
    Busy,
    Unsupported,
    Failed,
    Timeout,
    ConnectionError,
    /// Raised locally: no position estimate to hold while engaging offboard.
    NoPositionEstimate,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Denied => "COMMAND_DENIED",
            Self::NoSetpoint => "NO_SETPOINT_SET",
            Self::Busy => "BUSY",
            Self::Unsupported => "UNSUPPORTED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::NoPositionEstimate => "NO_POSITION_ESTIMATE",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused autopilot command: reason code plus the autopilot's detail text.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code} ({detail})")]
pub struct Rejection {
    pub code: RejectCode,
    pub detail: String,
}

impl Rejection {
    pub fn new(code: RejectCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn denied(detail: impl Into<String>) -> Self {
        Self::new(RejectCode::Denied, detail)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlightError {
    #[error("Connection to {address} timed out after {timeout_secs}s")]
    ConnectionTimeout { address: String, timeout_secs: u64 },

    #[error("Link error: {0}")]
    Link(String),

    #[error("Not connected to the autopilot")]
    NotConnected,

    #[error("Telemetry link lost")]
    LinkLost,

    #[error("Arming rejected: {0}")]
    ArmRejected(Rejection),

    #[error("Vehicle is not armed")]
    NotArmed,

    #[error("Offboard handshake rejected: {0}")]
    HandshakeRejected(Rejection),

    #[error("Waypoint '{label}' not reached within {timeout_secs}s")]
    NavigationTimeout { label: String, timeout_secs: f64 },

    #[error("Cannot {operation} while {phase}")]
    InvalidPhaseTransition {
        operation: &'static str,
        phase: FlightPhase,
    },

    #[error("{command} rejected: {rejection}")]
    CommandFailed {
        command: &'static str,
        rejection: Rejection,
    },

    #[error("Emergency stop refused by autopilot: {0}")]
    EmergencyStopFailed(Rejection),

    #[error("{operation} aborted: phase is now {phase}")]
    Aborted {
        operation: &'static str,
        phase: FlightPhase,
    },

    #[error("{operation} superseded by a newer command")]
    Superseded { operation: &'static str },
}

impl FlightError {
    pub fn code(&self) -> i32 {
        match self {
            FlightError::ConnectionTimeout { .. } => -32100,
            FlightError::Link(_) => -32101,
            FlightError::NotConnected => -32102,
            FlightError::LinkLost => -32103,
            FlightError::ArmRejected(_) => -32110,
            FlightError::NotArmed => -32111,
            FlightError::HandshakeRejected(_) => -32120,
            FlightError::NavigationTimeout { .. } => -32121,
            FlightError::InvalidPhaseTransition { .. } => -32130,
            FlightError::CommandFailed { .. } => -32140,
            FlightError::EmergencyStopFailed(_) => -32150,
            FlightError::Aborted { .. } => -32160,
            FlightError::Superseded { .. } => -32161,
        }
    }

    /// Only a refused motor kill leaves the vehicle in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlightError::EmergencyStopFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display() {
        let rejection = Rejection::new(RejectCode::NoSetpoint, "stream setpoints first");
        assert_eq!(rejection.to_string(), "NO_SETPOINT_SET (stream setpoints first)");

        let err = FlightError::HandshakeRejected(rejection);
        assert_eq!(
            err.to_string(),
            "Offboard handshake rejected: NO_SETPOINT_SET (stream setpoints first)"
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = FlightError::InvalidPhaseTransition {
            operation: "goto",
            phase: FlightPhase::Idle,
        };
        assert_eq!(err.to_string(), "Cannot goto while IDLE");
        assert_eq!(err.code(), -32130);
    }

    #[test]
    fn test_only_kill_refusal_is_fatal() {
        assert!(FlightError::EmergencyStopFailed(Rejection::denied("busy")).is_fatal());
        assert!(!FlightError::LinkLost.is_fatal());
        assert!(!FlightError::ArmRejected(Rejection::denied("no gps")).is_fatal());
    }
}
