//! Flight Scenario Tests
//!
//! End-to-end flights of the state machine and navigator against the
//! simulated vehicle. Every test runs on tokio's paused clock, so multi-second
//! climbs, pre-streams and timeouts finish instantly and timings are exact
//! in virtual time.
//!
//! Default simulated vehicle: 1 m/s in every axis, 50ms physics step.

use approx::assert_relative_eq;
use skylane_common::{
    ArmOutcome, FlightError, FlightMode, FlightPhase, LandOutcome, NavigationOutcome, Readiness,
    Rejection, SkylaneConfig, TakeoffOutcome, Waypoint,
};
use skylaned::navigator::square_route;
use skylaned::{
    AutopilotCall, FlightStateMachine, SimConfig, SimulatedAutopilot, WaypointNavigator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

// ============================================================================
// Helpers
// ============================================================================

async fn connected(sim: SimConfig) -> (Arc<SimulatedAutopilot>, Arc<WaypointNavigator>) {
    let sim = Arc::new(SimulatedAutopilot::new(sim));
    let flight = FlightStateMachine::new(SkylaneConfig::default(), sim.clone());
    flight.connect().await.expect("connect");
    (sim, Arc::new(WaypointNavigator::new(flight)))
}

/// Connected, armed and hovering at 2m.
async fn airborne(sim: SimConfig) -> (Arc<SimulatedAutopilot>, Arc<WaypointNavigator>) {
    let (sim, navigator) = connected(sim).await;
    let flight = navigator.flight();
    assert_eq!(flight.arm().await, Ok(ArmOutcome::Armed));
    let outcome = flight.takeoff(2.0).await.expect("takeoff");
    assert!(!outcome.is_degraded(), "takeoff degraded: {:?}", outcome);
    assert_eq!(flight.phase(), FlightPhase::Hovering);
    (sim, navigator)
}

fn setpoints_after(sim: &SimulatedAutopilot, call: &AutopilotCall) -> usize {
    let calls = sim.calls();
    match calls.iter().rposition(|c| c == call) {
        Some(index) => calls[index + 1..].iter().filter(|c| c.is_setpoint()).count(),
        None => 0,
    }
}

// ============================================================================
// Nominal flight
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_flight_reaches_waypoint_and_lands() {
    let (sim, navigator) = airborne(SimConfig::default()).await;
    let flight = navigator.flight().clone();

    let outcome = navigator
        .navigate_to(&navigator.waypoint(3.0, 0.0, 2.0))
        .await
        .expect("goto");
    match outcome {
        NavigationOutcome::Reached {
            elapsed,
            distance_m,
        } => {
            // 2.5m to cover at 1 m/s, checked every 200ms
            assert!(
                elapsed >= Duration::from_millis(2200) && elapsed <= Duration::from_millis(3000),
                "reached after {:?}",
                elapsed
            );
            assert!(distance_m < 0.5);
        }
        other => panic!("expected arrival, got {:?}", other),
    }
    assert_eq!(flight.phase(), FlightPhase::Offboard);
    assert!(sim.vehicle_position().north > 2.4);

    assert_eq!(flight.land().await, Ok(LandOutcome::Landed));
    assert_eq!(flight.phase(), FlightPhase::Idle);
    assert!(!flight.telemetry().current_state().armed);
    assert!(!flight.handshake().is_active());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_streams_before_offboard_start() {
    let (sim, navigator) = airborne(SimConfig::default()).await;
    navigator
        .navigate_to(&navigator.waypoint(1.0, 0.0, 2.0))
        .await
        .expect("goto");

    let trace = sim.trace();
    let start = trace
        .iter()
        .position(|e| e.call == AutopilotCall::StartOffboard)
        .expect("offboard started");
    let before: Vec<_> = trace[..start]
        .iter()
        .filter(|e| e.call.is_setpoint())
        .collect();

    assert!(before.len() >= 10, "only {} setpoints pre-streamed", before.len());
    let streamed = trace[start].at - before[0].at;
    assert!(streamed >= Duration::from_secs(2), "pre-stream lasted {:?}", streamed);
}

#[tokio::test(start_paused = true)]
async fn test_route_visits_every_waypoint() {
    let (sim, navigator) = airborne(SimConfig::default()).await;
    let route = square_route(&SkylaneConfig::default().navigation, 2.0, 2.0);

    let report = navigator.navigate_route(&route).await.expect("route");
    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(report.reached.len(), 4);
    assert_eq!(
        sim.calls()
            .iter()
            .filter(|c| **c == AutopilotCall::StartOffboard)
            .count(),
        1
    );

    let home = sim.vehicle_position();
    assert!(home.north.hypot(home.east) < 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_move_relative_keeps_heading_delta() {
    let (sim, navigator) = airborne(SimConfig::default()).await;
    let outcome = navigator
        .move_relative(1.0, 0.0, 0.0, 90.0)
        .await
        .expect("move");
    assert!(outcome.is_reached());

    let last = sim
        .calls()
        .into_iter()
        .rev()
        .find_map(|c| match c {
            AutopilotCall::SetPositionNed(sp) => Some(sp),
            _ => None,
        })
        .expect("a setpoint");
    assert_relative_eq!(last.yaw_deg, 90.0);
    assert_relative_eq!(last.position.north, 1.0, epsilon = 0.05);
}

// ============================================================================
// Phase guards
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_goto_refused_outside_flight() {
    let (sim, navigator) = connected(SimConfig::default()).await;
    let err = navigator
        .navigate_to(&Waypoint::new(1.0, 0.0, 2.0))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FlightError::InvalidPhaseTransition {
            operation: "goto",
            phase: FlightPhase::Idle
        }
    );
    assert!(!sim.calls().iter().any(|c| c.is_setpoint()));
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let (sim, navigator) = connected(SimConfig::default()).await;
    let flight = navigator.flight();
    flight.connect().await.unwrap();
    flight.connect().await.unwrap();

    for channel in ["position", "armed", "in_air", "flight_mode", "battery", "health"] {
        assert_eq!(sim.subscriptions(channel), 1, "channel {}", channel);
    }
    assert_eq!(flight.telemetry().sessions_started(), 1);
    let connects = sim
        .calls()
        .iter()
        .filter(|c| matches!(c, AutopilotCall::Connect(_)))
        .count();
    assert_eq!(connects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out_without_heartbeat() {
    let sim = Arc::new(SimulatedAutopilot::new(SimConfig {
        refuse_connection: true,
        ..SimConfig::default()
    }));
    let flight = FlightStateMachine::new(SkylaneConfig::default(), sim);
    let started = Instant::now();

    let err = flight.connect().await.unwrap_err();
    assert!(matches!(
        err,
        FlightError::ConnectionTimeout {
            timeout_secs: 10,
            ..
        }
    ));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(flight.phase(), FlightPhase::Disconnected);
}

// ============================================================================
// Arming
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_waits_until_armable() {
    let (_sim, navigator) = connected(SimConfig {
        armable_after: Some(Duration::from_secs(5)),
        ..SimConfig::default()
    })
    .await;
    let flight = navigator.flight();
    let started = Instant::now();

    assert_eq!(
        flight.wait_for_armable(Duration::from_secs(30)).await,
        Ok(Readiness::Armable)
    );
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(flight.arm().await, Ok(ArmOutcome::Armed));
}

#[tokio::test(start_paused = true)]
async fn test_never_armable_is_reported_not_retried() {
    let (sim, navigator) = connected(SimConfig {
        armable_after: None,
        ..SimConfig::default()
    })
    .await;
    let flight = navigator.flight();

    assert_eq!(
        flight.wait_for_armable(Duration::from_secs(5)).await,
        Ok(Readiness::TimedOut)
    );
    assert!(matches!(flight.arm().await, Err(FlightError::ArmRejected(_))));
    assert_eq!(flight.phase(), FlightPhase::Idle);
    let attempts = sim.calls().iter().filter(|c| **c == AutopilotCall::Arm).count();
    assert_eq!(attempts, 1);
}

// ============================================================================
// Takeoff heuristic
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_takeoff_settles_below_target() {
    let (_sim, navigator) = connected(SimConfig::default().with_plateau(1.65, 0.02)).await;
    let flight = navigator.flight();
    flight.arm().await.unwrap();

    let started = Instant::now();
    let outcome = flight.takeoff(2.0).await.unwrap();
    match outcome {
        TakeoffOutcome::Stabilized { altitude_m } => {
            assert_relative_eq!(altitude_m, 1.65, epsilon = 0.02)
        }
        other => panic!("expected stabilized takeoff, got {:?}", other),
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(3) && elapsed <= Duration::from_millis(4500),
        "settled after {:?}",
        elapsed
    );
    assert_eq!(flight.phase(), FlightPhase::Hovering);
}

#[tokio::test(start_paused = true)]
async fn test_low_plateau_times_out_degraded() {
    let (_sim, navigator) = connected(SimConfig::default().with_plateau(1.0, 0.0)).await;
    let flight = navigator.flight();
    flight.arm().await.unwrap();

    let started = Instant::now();
    let outcome = flight.takeoff(2.0).await.unwrap();
    assert!(outcome.is_degraded(), "{:?}", outcome);
    assert_relative_eq!(outcome.altitude_m(), 1.0, epsilon = 0.01);
    assert!(started.elapsed() >= Duration::from_secs(60));

    // The flight goes on from Hovering.
    assert_eq!(flight.phase(), FlightPhase::Hovering);
    assert_eq!(flight.land().await, Ok(LandOutcome::Landed));
}

// ============================================================================
// Landing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_landing_finishes_after_timeout() {
    let (_sim, navigator) = airborne(SimConfig {
        landing_speed: 0.02,
        ..SimConfig::default()
    })
    .await;
    let flight = navigator.flight();

    // 2m at 2cm/s takes 100s, the landing bound is 60s.
    assert_eq!(flight.land().await, Ok(LandOutcome::TimedOut));
    assert_eq!(flight.phase(), FlightPhase::Landing);

    time::sleep(Duration::from_secs(45)).await;
    let state = flight.telemetry().current_state();
    assert!(!state.in_air);
    assert_eq!(flight.phase(), FlightPhase::Idle);
    assert_eq!(flight.arm().await, Ok(ArmOutcome::Armed));
}

// ============================================================================
// Offboard failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_offboard_rejection_falls_back_to_hover() {
    let (sim, navigator) = airborne(SimConfig {
        offboard_rejection: Some(Rejection::denied("offboard not allowed")),
        ..SimConfig::default()
    })
    .await;

    let outcome = navigator
        .navigate_to(&navigator.waypoint(3.0, 0.0, 2.0))
        .await
        .expect("goto");
    match outcome {
        NavigationOutcome::HandshakeRejected(rejection) => {
            assert_eq!(rejection.detail, "offboard not allowed")
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(navigator.flight().phase(), FlightPhase::Hovering);
    assert!(!navigator.flight().handshake().is_active());
    assert_eq!(setpoints_after(&sim, &AutopilotCall::StartOffboard), 0);
}

#[tokio::test(start_paused = true)]
async fn test_autopilot_leaving_offboard_returns_to_hover() {
    let (sim, navigator) = airborne(SimConfig::default()).await;
    let flight = navigator.flight();
    navigator
        .navigate_to(&navigator.waypoint(1.0, 0.0, 2.0))
        .await
        .expect("goto");
    assert!(flight.handshake().is_active());

    sim.override_mode(FlightMode::Hold);
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(flight.phase(), FlightPhase::Hovering);
    assert!(!flight.handshake().is_active());

    // The next goto engages again from scratch.
    let outcome = navigator
        .navigate_to(&navigator.waypoint(0.0, 0.0, 2.0))
        .await
        .expect("goto");
    assert!(outcome.is_reached());
    let starts = sim
        .calls()
        .iter()
        .filter(|c| **c == AutopilotCall::StartOffboard)
        .count();
    assert_eq!(starts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_position_holds_origin() {
    let (sim, navigator) = airborne(SimConfig {
        rich_position: false,
        ..SimConfig::default()
    })
    .await;

    let waypoint = navigator
        .waypoint(3.0, 0.0, 2.0)
        .with_timeout(Duration::from_secs(5));
    let outcome = navigator.navigate_to(&waypoint).await.expect("goto");
    assert!(
        matches!(outcome, NavigationOutcome::TimedOut { .. }),
        "{:?}",
        outcome
    );
    assert_eq!(navigator.flight().phase(), FlightPhase::Hovering);

    let hold = sim
        .calls()
        .into_iter()
        .find_map(|c| match c {
            AutopilotCall::SetPositionNed(sp) => Some(sp),
            _ => None,
        })
        .expect("pre-stream setpoint");
    assert_relative_eq!(hold.position.north, 0.0);
    assert_relative_eq!(hold.position.east, 0.0);
    assert!(hold.position.down < -1.5);
}

// ============================================================================
// Preemption
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_preempts_navigation() {
    let (sim, navigator) = airborne(SimConfig::default()).await;
    let flight = navigator.flight().clone();

    let nav = {
        let navigator = navigator.clone();
        tokio::spawn(async move {
            let waypoint = navigator.waypoint(20.0, 0.0, 2.0);
            navigator.navigate_to(&waypoint).await
        })
    };
    time::sleep(Duration::from_secs(3)).await;
    assert_eq!(flight.phase(), FlightPhase::Offboard);

    flight.emergency_stop().await.expect("kill accepted");
    assert_eq!(flight.phase(), FlightPhase::EmergencyStopped);

    let result = nav.await.expect("navigation task");
    assert_eq!(
        result,
        Err(FlightError::Aborted {
            operation: "goto",
            phase: FlightPhase::EmergencyStopped
        })
    );

    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(setpoints_after(&sim, &AutopilotCall::Kill), 0);
    assert!(!flight.handshake().is_active());
    assert!(matches!(
        flight.takeoff(2.0).await,
        Err(FlightError::InvalidPhaseTransition { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_slow_kill_still_aborts_navigation() {
    let (_sim, navigator) = airborne(SimConfig {
        kill_delay: Duration::from_millis(500),
        ..SimConfig::default()
    })
    .await;
    let flight = navigator.flight().clone();

    let nav = {
        let navigator = navigator.clone();
        tokio::spawn(async move {
            let waypoint = navigator.waypoint(20.0, 0.0, 2.0);
            navigator.navigate_to(&waypoint).await
        })
    };
    time::sleep(Duration::from_secs(3)).await;

    flight.emergency_stop().await.expect("kill accepted");
    assert_eq!(
        nav.await.expect("navigation task"),
        Err(FlightError::Aborted {
            operation: "goto",
            phase: FlightPhase::EmergencyStopped
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_land_preempts_navigation() {
    let (_sim, navigator) = airborne(SimConfig::default()).await;
    let flight = navigator.flight().clone();

    let nav = {
        let navigator = navigator.clone();
        tokio::spawn(async move {
            let waypoint = navigator.waypoint(20.0, 0.0, 2.0);
            navigator.navigate_to(&waypoint).await
        })
    };
    time::sleep(Duration::from_secs(3)).await;

    assert_eq!(flight.land().await, Ok(LandOutcome::Landed));
    let result = nav.await.expect("navigation task");
    assert!(
        matches!(result, Err(FlightError::Aborted { operation: "goto", .. })),
        "{:?}",
        result
    );
    assert_eq!(flight.phase(), FlightPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_newer_goto_supersedes_running_one() {
    let (_sim, navigator) = airborne(SimConfig::default()).await;

    let first = {
        let navigator = navigator.clone();
        tokio::spawn(async move {
            let waypoint = navigator.waypoint(20.0, 0.0, 2.0);
            navigator.navigate_to(&waypoint).await
        })
    };
    time::sleep(Duration::from_secs(3)).await;

    let second = navigator
        .navigate_to(&navigator.waypoint(0.0, 1.0, 2.0))
        .await
        .expect("second goto");
    assert!(second.is_reached());
    assert_eq!(
        first.await.expect("first task"),
        Err(FlightError::Superseded { operation: "goto" })
    );
}

// ============================================================================
// Link loss
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_link_loss_disconnects_until_reconnect() {
    let (sim, navigator) = airborne(SimConfig::default()).await;
    let flight = navigator.flight();

    sim.drop_link();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(flight.phase(), FlightPhase::Disconnected);
    assert!(!flight.telemetry().is_connected());
    assert_eq!(flight.telemetry().active_loops(), 0);

    let err = navigator
        .navigate_to(&navigator.waypoint(1.0, 0.0, 2.0))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FlightError::InvalidPhaseTransition {
            operation: "goto",
            phase: FlightPhase::Disconnected
        }
    );

    // Still in the air, so the core resumes hovering and can land it.
    flight.connect().await.expect("reconnect");
    assert_eq!(flight.phase(), FlightPhase::Hovering);
    assert_eq!(flight.telemetry().sessions_started(), 2);

    assert_eq!(flight.land().await, Ok(LandOutcome::Landed));
    assert_eq!(flight.phase(), FlightPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_on_ground_is_idle() {
    let (sim, navigator) = connected(SimConfig::default()).await;
    let flight = navigator.flight();

    sim.drop_link();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(flight.phase(), FlightPhase::Disconnected);

    flight.connect().await.expect("reconnect");
    assert_eq!(flight.phase(), FlightPhase::Idle);
}
