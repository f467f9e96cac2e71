//! Typed results of bounded waits.
//!
//! A wait that runs out of time resolves to a `TimedOut` variant instead of an
//! error, so callers can retry or give up without unwinding.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FlightError, Rejection};
use crate::waypoint::Waypoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Armable,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArmOutcome {
    Armed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TakeoffOutcome {
    /// Within tolerance of the commanded altitude.
    Reached { altitude_m: f32 },
    /// Settled short of the target; accepted by the stabilization heuristic.
    Stabilized { altitude_m: f32 },
    /// Neither criterion met in time; the flight continues degraded.
    TimedOut { altitude_m: f32 },
}

impl TakeoffOutcome {
    pub fn altitude_m(&self) -> f32 {
        match *self {
            Self::Reached { altitude_m }
            | Self::Stabilized { altitude_m }
            | Self::TimedOut { altitude_m } => altitude_m,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LandOutcome {
    Landed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NavigationOutcome {
    Reached {
        elapsed: Duration,
        distance_m: f32,
    },
    TimedOut {
        elapsed: Duration,
        last_distance_m: Option<f32>,
    },
    HandshakeRejected(Rejection),
}

impl NavigationOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, Self::Reached { .. })
    }

    /// Collapse into the error taxonomy for callers that only care about success.
    pub fn into_result(self, waypoint: &Waypoint) -> Result<Duration, FlightError> {
        match self {
            Self::Reached { elapsed, .. } => Ok(elapsed),
            Self::TimedOut { .. } => Err(FlightError::NavigationTimeout {
                label: waypoint.label.clone(),
                timeout_secs: waypoint.timeout_secs,
            }),
            Self::HandshakeRejected(rejection) => Err(FlightError::HandshakeRejected(rejection)),
        }
    }
}

/// Result of sequencing a list of waypoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteReport {
    pub total: usize,
    /// Labels of the waypoints reached, in order.
    pub reached: Vec<String>,
    /// Resolution of the last waypoint attempted; `None` for an empty route.
    pub last: Option<NavigationOutcome>,
}

impl RouteReport {
    pub fn is_complete(&self) -> bool {
        self.reached.len() == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectCode;

    #[test]
    fn test_into_result_maps_timeout() {
        let wp = Waypoint::new(1.0, 1.0, 2.0).labeled("gate");
        let outcome = NavigationOutcome::TimedOut {
            elapsed: Duration::from_secs(30),
            last_distance_m: Some(4.0),
        };
        match outcome.into_result(&wp) {
            Err(FlightError::NavigationTimeout { label, .. }) => assert_eq!(label, "gate"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_into_result_maps_rejection() {
        let wp = Waypoint::new(1.0, 1.0, 2.0);
        let rejection = Rejection::new(RejectCode::NoSetpoint, "no stream");
        let outcome = NavigationOutcome::HandshakeRejected(rejection.clone());
        assert_eq!(
            outcome.into_result(&wp),
            Err(FlightError::HandshakeRejected(rejection))
        );
    }

    #[test]
    fn test_route_report_completion() {
        let report = RouteReport {
            total: 2,
            reached: vec!["a".into()],
            last: None,
        };
        assert!(!report.is_complete());
    }
}
