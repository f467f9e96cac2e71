//! Flight-Phase State Machine
//!
//! Owns the single [`FlightPhase`] and every guarded transition between
//! phases. It is the explicitly constructed core object: it builds the
//! telemetry aggregator, the connection manager and the offboard handshake,
//! and hands them out by reference.
//!
//! Bounded waits (arm confirmation, takeoff, landing, armable) resolve to a
//! `TimedOut` outcome instead of an error. Emergency stop is not a guarded
//! transition; it is always available and ends in `EmergencyStopped`.

use skylane_common::config::TakeoffConfig;
use skylane_common::{
    ArmOutcome, FlightError, FlightMode, FlightOperation, FlightPhase, LandOutcome, Readiness,
    SkylaneConfig, TakeoffOutcome,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::autopilot::Autopilot;
use crate::connection::ConnectionManager;
use crate::lock;
use crate::offboard::OffboardHandshake;
use crate::telemetry::{Stamped, TelemetryAggregator};

/// How long a fresh connection waits for its first in-air sample.
const IN_AIR_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Takeoff heuristic
// ============================================================================

/// Decides when a climb is over.
///
/// Reached when within tolerance of the target. Otherwise an altitude that has
/// stopped changing for enough consecutive samples is accepted once it is
/// above the settle ratio of the target, since altitude hold does not always
/// converge to the commanded value.
#[derive(Debug, Clone)]
pub struct ClimbMonitor {
    target_m: f32,
    reach_tolerance_m: f32,
    settle_ratio: f32,
    settle_jitter_m: f32,
    settle_samples: u32,
    previous: Option<f32>,
    stable: u32,
}

impl ClimbMonitor {
    pub fn new(target_m: f32, config: &TakeoffConfig) -> Self {
        Self {
            target_m,
            reach_tolerance_m: config.reach_tolerance_m,
            settle_ratio: config.settle_ratio,
            settle_jitter_m: config.settle_jitter_m,
            settle_samples: config.settle_samples,
            previous: None,
            stable: 0,
        }
    }

    pub fn observe(&mut self, altitude_m: f32) -> Option<TakeoffOutcome> {
        if altitude_m >= self.target_m - self.reach_tolerance_m {
            return Some(TakeoffOutcome::Reached { altitude_m });
        }

        if let Some(previous) = self.previous {
            if (altitude_m - previous).abs() < self.settle_jitter_m {
                self.stable += 1;
            } else {
                self.stable = 0;
            }
        }
        self.previous = Some(altitude_m);

        if self.stable >= self.settle_samples && altitude_m >= self.target_m * self.settle_ratio {
            return Some(TakeoffOutcome::Stabilized { altitude_m });
        }
        None
    }

    pub fn stable_samples(&self) -> u32 {
        self.stable
    }
}

// ============================================================================
// State machine
// ============================================================================

pub struct FlightStateMachine {
    config: SkylaneConfig,
    autopilot: Arc<dyn Autopilot>,
    telemetry: Arc<TelemetryAggregator>,
    connection: ConnectionManager,
    handshake: Arc<OffboardHandshake>,
    phase: watch::Sender<FlightPhase>,
    /// Bumped whenever in-flight navigation must give up.
    nav_epoch: watch::Sender<u64>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl FlightStateMachine {
    pub fn new(config: SkylaneConfig, autopilot: Arc<dyn Autopilot>) -> Arc<Self> {
        let telemetry = Arc::new(TelemetryAggregator::new());
        let connection = ConnectionManager::new(autopilot.clone(), telemetry.clone());
        let handshake = Arc::new(OffboardHandshake::new(
            autopilot.clone(),
            telemetry.clone(),
            config.offboard.clone(),
        ));

        Arc::new(Self {
            config,
            autopilot,
            telemetry,
            connection,
            handshake,
            phase: watch::channel(FlightPhase::Disconnected).0,
            nav_epoch: watch::channel(0).0,
            supervisors: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SkylaneConfig {
        &self.config
    }

    pub fn autopilot(&self) -> &Arc<dyn Autopilot> {
        &self.autopilot
    }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    pub fn handshake(&self) -> &Arc<OffboardHandshake> {
        &self.handshake
    }

    pub fn phase(&self) -> FlightPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<FlightPhase> {
        self.phase.subscribe()
    }

    // ------------------------------------------------------------------------
    // Transition function
    // ------------------------------------------------------------------------

    /// Start `operation` by moving to `to`, if the current phase allows it.
    fn begin(&self, operation: FlightOperation, to: FlightPhase) -> Result<(), FlightError> {
        let mut from = FlightPhase::Disconnected;
        let moved = self.phase.send_if_modified(|phase| {
            from = *phase;
            if *phase != to && operation.permitted_from(*phase) {
                *phase = to;
                true
            } else {
                false
            }
        });

        if moved {
            info!("[FLIGHT] {} -> {} ({})", from, to, operation.name());
            Ok(())
        } else if from == to && operation.permitted_from(to) {
            Ok(())
        } else {
            Err(FlightError::InvalidPhaseTransition {
                operation: operation.name(),
                phase: from,
            })
        }
    }

    /// Finish a step of an operation. Fails with `Aborted` when something else
    /// (emergency stop, link loss, land) moved the phase in the meantime.
    fn advance(
        &self,
        operation: &'static str,
        from: FlightPhase,
        to: FlightPhase,
    ) -> Result<(), FlightError> {
        let mut current = from;
        let moved = self.phase.send_if_modified(|phase| {
            current = *phase;
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        });

        if moved {
            info!("[FLIGHT] {} -> {}", from, to);
            Ok(())
        } else {
            Err(FlightError::Aborted {
                operation,
                phase: current,
            })
        }
    }

    /// Unconditional move, for emergency stop, reset and link loss.
    fn force(&self, to: FlightPhase) {
        let from = self.phase.send_replace(to);
        if from != to {
            info!("[FLIGHT] {} -> {} (forced)", from, to);
        }
    }

    pub(crate) fn ensure_phase(
        &self,
        operation: &'static str,
        expected: FlightPhase,
    ) -> Result<(), FlightError> {
        let phase = self.phase();
        if phase == expected {
            Ok(())
        } else {
            Err(FlightError::Aborted { operation, phase })
        }
    }

    /// Resolves once the phase is no longer `phase`.
    fn phase_left(&self, phase: FlightPhase) -> impl Future<Output = FlightPhase> + Send + 'static {
        let mut rx = self.phase.subscribe();
        async move {
            let left = rx.wait_for(|current| *current != phase).await.map(|current| *current);
            match left {
                Ok(current) => current,
                Err(_) => std::future::pending().await,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Navigation sessions
    // ------------------------------------------------------------------------

    /// Open a navigation session, preempting any running one.
    pub fn begin_session(&self) -> u64 {
        let mut session = 0;
        self.nav_epoch.send_modify(|epoch| {
            *epoch += 1;
            session = *epoch;
        });
        session
    }

    fn preempt_navigation(&self) {
        self.begin_session();
    }

    /// `Ok` while `session` is the live session and the phase is still
    /// `expected`.
    pub fn check_session(
        &self,
        operation: &'static str,
        session: u64,
        expected: FlightPhase,
    ) -> Result<(), FlightError> {
        self.ensure_phase(operation, expected)?;
        if *self.nav_epoch.borrow() != session {
            return Err(FlightError::Superseded { operation });
        }
        Ok(())
    }

    /// Resolves with the reason once `session` may no longer run.
    pub fn session_ended(
        &self,
        operation: &'static str,
        session: u64,
        expected: FlightPhase,
    ) -> impl Future<Output = FlightError> + Send + 'static {
        let mut phase = self.phase.subscribe();
        let mut epoch = self.nav_epoch.subscribe();
        async move {
            loop {
                let current = *phase.borrow_and_update();
                if current != expected {
                    return FlightError::Aborted {
                        operation,
                        phase: current,
                    };
                }
                if *epoch.borrow_and_update() != session {
                    return FlightError::Superseded { operation };
                }
                tokio::select! {
                    changed = phase.changed() => if changed.is_err() { std::future::pending::<()>().await },
                    changed = epoch.changed() => if changed.is_err() { std::future::pending::<()>().await },
                }
            }
        }
    }

    /// Move `Hovering -> Offboard` for a navigation request; already `Offboard`
    /// is accepted as is.
    pub fn enter_offboard(&self) -> Result<FlightPhase, FlightError> {
        let before = self.phase();
        self.begin(FlightOperation::Goto, FlightPhase::Offboard)?;
        Ok(before)
    }

    /// Fallback after a failed or timed-out navigation.
    pub fn fall_back_to_hover(&self, operation: &'static str) -> Result<(), FlightError> {
        self.advance(operation, FlightPhase::Offboard, FlightPhase::Hovering)
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Connect to the autopilot. A no-op while connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), FlightError> {
        if self.connection.is_connected() {
            return Ok(());
        }
        let phase = self.phase();
        if !FlightOperation::Connect.permitted_from(phase) {
            return Err(FlightError::InvalidPhaseTransition {
                operation: FlightOperation::Connect.name(),
                phase,
            });
        }

        let requested = Instant::now();
        self.connection
            .connect(&self.config.link.address, self.config.link.connect_timeout())
            .await?;

        // A vehicle picked up in the air can still be landed.
        let to = if self.fresh_in_air(requested).await {
            warn!("[FLIGHT] Vehicle is airborne, resuming as hovering");
            FlightPhase::Hovering
        } else {
            FlightPhase::Idle
        };
        self.begin(FlightOperation::Connect, to)?;
        self.spawn_supervisors();
        Ok(())
    }

    /// In-air flag of the new session. Falls back to the last known value
    /// when the channel stays quiet.
    async fn fresh_in_air(&self, since: Instant) -> bool {
        let mut in_air = self.telemetry.subscribe_in_air();
        let fresh = time::timeout(
            IN_AIR_GRACE,
            in_air.wait_for(|sample| sample.map_or(false, |s: Stamped<bool>| s.at >= since)),
        )
        .await;
        match fresh {
            Ok(Ok(sample)) => (*sample).map_or(false, |s| s.value),
            _ => self.telemetry.current_state().in_air,
        }
    }

    /// Poll health until the vehicle reports armable or `timeout` runs out.
    pub async fn wait_for_armable(&self, timeout: Duration) -> Result<Readiness, FlightError> {
        self.require_connected()?;
        let started = Instant::now();
        let mut ticker = time::interval(self.config.arming.armable_poll());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.telemetry.health() {
                Some(health) if health.armable => {
                    info!("[FLIGHT] Vehicle is armable");
                    return Ok(Readiness::Armable);
                }
                Some(health) => {
                    info!(
                        "[FLIGHT] Waiting for armable, failing: {}",
                        health.failing_checks().join(", ")
                    );
                }
                None => info!("[FLIGHT] Waiting for health telemetry"),
            }

            if started.elapsed() >= timeout {
                warn!("[FLIGHT] Vehicle not armable after {}s", timeout.as_secs());
                return Ok(Readiness::TimedOut);
            }
        }
    }

    /// Arm and wait for the armed flag. A refusal is returned as
    /// `ArmRejected`, never retried.
    pub async fn arm(&self) -> Result<ArmOutcome, FlightError> {
        self.require_connected()?;
        self.begin(FlightOperation::Arm, FlightPhase::Arming)?;

        if let Err(rejection) = self.autopilot.arm().await {
            warn!("[FLIGHT] Arming rejected: {}", rejection);
            self.advance("arm", FlightPhase::Arming, FlightPhase::Idle)?;
            return Err(FlightError::ArmRejected(rejection));
        }

        let mut armed = self.telemetry.subscribe_armed();
        let confirmed = async {
            armed
                .wait_for(|sample| sample.map_or(false, |s: Stamped<bool>| s.value))
                .await
                .is_ok()
        };

        let outcome = tokio::select! {
            confirmed = time::timeout(self.config.arming.confirm_timeout(), confirmed) => {
                match confirmed {
                    Ok(true) => ArmOutcome::Armed,
                    _ => ArmOutcome::TimedOut,
                }
            }
            phase = self.phase_left(FlightPhase::Arming) => {
                return Err(FlightError::Aborted { operation: "arm", phase });
            }
        };

        self.advance("arm", FlightPhase::Arming, FlightPhase::Idle)?;
        match outcome {
            ArmOutcome::Armed => info!("[FLIGHT] Armed"),
            ArmOutcome::TimedOut => warn!(
                "[FLIGHT] Arm accepted but armed flag not seen within {}s",
                self.config.arming.confirm_timeout_secs
            ),
        }
        Ok(outcome)
    }

    /// Take off and monitor the climb. Ends in `Hovering`, degraded when the
    /// climb timed out.
    pub async fn takeoff(&self, altitude_m: f32) -> Result<TakeoffOutcome, FlightError> {
        let phase = self.phase();
        if !FlightOperation::Takeoff.permitted_from(phase) {
            return Err(FlightError::InvalidPhaseTransition {
                operation: FlightOperation::Takeoff.name(),
                phase,
            });
        }
        if !self.telemetry.current_state().armed {
            return Err(FlightError::NotArmed);
        }

        self.begin(FlightOperation::Takeoff, FlightPhase::TakingOff)?;
        self.preempt_navigation();
        if let Err(rejection) = self.handshake.disengage().await {
            warn!("[FLIGHT] Ignoring stop offboard failure: {}", rejection);
        }

        info!("[FLIGHT] Taking off to {:.1}m", altitude_m);
        let commanded = match self.autopilot.set_takeoff_altitude(altitude_m).await {
            Ok(()) => self.autopilot.takeoff().await.map_err(|rejection| ("takeoff", rejection)),
            Err(rejection) => Err(("set_takeoff_altitude", rejection)),
        };
        if let Err((command, rejection)) = commanded {
            warn!("[FLIGHT] {} rejected: {}", command, rejection);
            self.advance("takeoff", FlightPhase::TakingOff, FlightPhase::Idle)?;
            return Err(FlightError::CommandFailed { command, rejection });
        }

        let outcome = self.monitor_climb(altitude_m).await?;
        self.advance("takeoff", FlightPhase::TakingOff, FlightPhase::Hovering)?;
        match outcome {
            TakeoffOutcome::Reached { altitude_m } => {
                info!("[FLIGHT] Reached takeoff altitude ({:.2}m)", altitude_m)
            }
            TakeoffOutcome::Stabilized { altitude_m } => info!(
                "[FLIGHT] Altitude settled at {:.2}m, accepting as takeoff altitude",
                altitude_m
            ),
            TakeoffOutcome::TimedOut { altitude_m } => warn!(
                "[FLIGHT] Takeoff did not settle within {}s, continuing degraded at {:.2}m",
                self.config.takeoff.timeout_secs, altitude_m
            ),
        }
        Ok(outcome)
    }

    async fn monitor_climb(&self, target_m: f32) -> Result<TakeoffOutcome, FlightError> {
        let config = &self.config.takeoff;
        let mut monitor = ClimbMonitor::new(target_m, config);
        let started = Instant::now();
        let mut ticker = time::interval(config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.ensure_phase("takeoff", FlightPhase::TakingOff)?;

            let altitude_m = self.telemetry.current_state().altitude();
            if let Some(outcome) = monitor.observe(altitude_m) {
                return Ok(outcome);
            }
            if started.elapsed() >= config.timeout() {
                return Ok(TakeoffOutcome::TimedOut { altitude_m });
            }
        }
    }

    /// Land and wait for touchdown. Any navigation is preempted and offboard
    /// is stopped first.
    pub async fn land(self: &Arc<Self>) -> Result<LandOutcome, FlightError> {
        self.begin(FlightOperation::Land, FlightPhase::Landing)?;
        self.preempt_navigation();
        if let Err(rejection) = self.handshake.disengage().await {
            warn!("[FLIGHT] Ignoring stop offboard failure: {}", rejection);
        }

        info!("[FLIGHT] Landing");
        if let Err(rejection) = self.autopilot.land().await {
            warn!("[FLIGHT] Land rejected: {}", rejection);
            self.advance("land", FlightPhase::Landing, FlightPhase::Hovering)?;
            return Err(FlightError::CommandFailed {
                command: "land",
                rejection,
            });
        }

        let mut in_air = self.telemetry.subscribe_in_air();
        let touched_down = async {
            in_air
                .wait_for(|sample| sample.map_or(false, |s: Stamped<bool>| !s.value))
                .await
                .is_ok()
        };

        let outcome = tokio::select! {
            landed = time::timeout(self.config.landing.timeout(), touched_down) => {
                match landed {
                    Ok(true) => LandOutcome::Landed,
                    _ => LandOutcome::TimedOut,
                }
            }
            phase = self.phase_left(FlightPhase::Landing) => {
                return Err(FlightError::Aborted { operation: "land", phase });
            }
        };

        match outcome {
            LandOutcome::Landed => {
                self.advance("land", FlightPhase::Landing, FlightPhase::Idle)?;
                info!("[FLIGHT] Landed");
            }
            LandOutcome::TimedOut => {
                warn!(
                    "[FLIGHT] Still airborne {}s after landing command",
                    self.config.landing.timeout_secs
                );
                lock(&self.supervisors).push(tokio::spawn(self.clone().await_touchdown()));
            }
        }
        Ok(outcome)
    }

    /// Finish a landing that outlived its bound once the vehicle is down.
    async fn await_touchdown(self: Arc<Self>) {
        let mut in_air = self.telemetry.subscribe_in_air();
        let touched_down = async {
            in_air
                .wait_for(|sample| sample.map_or(false, |s: Stamped<bool>| !s.value))
                .await
                .is_ok()
        };

        tokio::select! {
            true = touched_down => {
                if self.advance("land", FlightPhase::Landing, FlightPhase::Idle).is_ok() {
                    info!("[FLIGHT] Landed late");
                }
            }
            _ = self.phase_left(FlightPhase::Landing) => {}
        }
    }

    /// Kill the motors and force `EmergencyStopped`, whatever is running.
    ///
    /// The phase is forced even when the autopilot refuses the kill; the
    /// refusal is returned as the one fatal error.
    pub async fn emergency_stop(&self) -> Result<(), FlightError> {
        warn!("[FLIGHT] EMERGENCY STOP");
        self.force(FlightPhase::EmergencyStopped);
        self.handshake.invalidate();
        self.preempt_navigation();

        let result = self.autopilot.kill().await;

        match result {
            Ok(()) => {
                warn!("[FLIGHT] Motors killed");
                Ok(())
            }
            Err(rejection) => {
                error!("[FATAL] Autopilot refused motor kill: {}", rejection);
                Err(FlightError::EmergencyStopFailed(rejection))
            }
        }
    }

    /// Leave `EmergencyStopped`.
    pub fn reset(&self) -> Result<FlightPhase, FlightError> {
        let phase = self.phase();
        if !FlightOperation::Reset.permitted_from(phase) {
            return Err(FlightError::InvalidPhaseTransition {
                operation: FlightOperation::Reset.name(),
                phase,
            });
        }
        let to = if self.telemetry.is_connected() {
            FlightPhase::Idle
        } else {
            FlightPhase::Disconnected
        };
        self.force(to);
        Ok(to)
    }

    fn require_connected(&self) -> Result<(), FlightError> {
        if self.telemetry.is_connected() {
            Ok(())
        } else {
            Err(FlightError::NotConnected)
        }
    }

    // ------------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------------

    fn spawn_supervisors(self: &Arc<Self>) {
        let mut supervisors = lock(&self.supervisors);
        for stale in supervisors.drain(..) {
            stale.abort();
        }
        supervisors.push(tokio::spawn(self.clone().supervise_link()));
        supervisors.push(tokio::spawn(self.clone().supervise_offboard_exit()));
    }

    async fn supervise_link(self: Arc<Self>) {
        let mut connected = self.telemetry.subscribe_connected();
        if connected.wait_for(|up| !*up).await.is_err() {
            return;
        }

        warn!("[FLIGHT] Link lost during {}", self.phase());
        self.handshake.invalidate();
        self.preempt_navigation();
        if self.phase() != FlightPhase::EmergencyStopped {
            self.force(FlightPhase::Disconnected);
        }
    }

    /// When the autopilot leaves offboard by itself, clear the engagement and
    /// fall back to hovering. The next goto engages again.
    async fn supervise_offboard_exit(self: Arc<Self>) {
        let mut mode = self.telemetry.subscribe_flight_mode();
        let mut was_offboard = false;

        while mode.changed().await.is_ok() {
            let current = mode.borrow_and_update().map(|s| s.value);
            match current {
                Some(FlightMode::Offboard) => was_offboard = true,
                Some(other) if was_offboard => {
                    was_offboard = false;
                    if !self.handshake.is_active() {
                        continue;
                    }
                    warn!("[FLIGHT] Autopilot left offboard (now {})", other);
                    self.handshake.invalidate();
                    if self
                        .advance("offboard", FlightPhase::Offboard, FlightPhase::Hovering)
                        .is_ok()
                    {
                        self.preempt_navigation();
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autopilot::sim::{SimConfig, SimulatedAutopilot};
    use skylane_common::Rejection;

    #[test]
    fn test_climb_reaches_within_tolerance() {
        let mut monitor = ClimbMonitor::new(2.0, &TakeoffConfig::default());
        assert_eq!(monitor.observe(1.0), None);
        assert_eq!(
            monitor.observe(1.75),
            Some(TakeoffOutcome::Reached { altitude_m: 1.75 })
        );
    }

    #[test]
    fn test_climb_settles_after_stable_samples() {
        let mut monitor = ClimbMonitor::new(2.0, &TakeoffConfig::default());
        // First sample only seeds the comparison.
        for _ in 0..20 {
            assert_eq!(monitor.observe(1.65), None);
        }
        assert_eq!(
            monitor.observe(1.66),
            Some(TakeoffOutcome::Stabilized { altitude_m: 1.66 })
        );
    }

    #[test]
    fn test_climb_never_settles_low() {
        let mut monitor = ClimbMonitor::new(2.0, &TakeoffConfig::default());
        for _ in 0..100 {
            assert_eq!(monitor.observe(1.0), None);
        }
        assert!(monitor.stable_samples() >= 20);
    }

    #[test]
    fn test_jump_resets_stability() {
        let mut monitor = ClimbMonitor::new(2.0, &TakeoffConfig::default());
        for _ in 0..15 {
            monitor.observe(1.6);
        }
        monitor.observe(1.5);
        assert_eq!(monitor.stable_samples(), 0);
    }

    async fn connected(config: SimConfig) -> (Arc<SimulatedAutopilot>, Arc<FlightStateMachine>) {
        let sim = Arc::new(SimulatedAutopilot::new(config));
        let flight = FlightStateMachine::new(SkylaneConfig::default(), sim.clone());
        flight.connect().await.unwrap();
        (sim, flight)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_moves_to_idle() {
        let (_sim, flight) = connected(SimConfig::default()).await;
        assert_eq!(flight.phase(), FlightPhase::Idle);
        flight.connect().await.unwrap();
        assert_eq!(flight.phase(), FlightPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_rejection_is_surfaced() {
        let config = SimConfig {
            arm_rejection: Some(Rejection::denied("no global position")),
            ..SimConfig::default()
        };
        let (_sim, flight) = connected(config).await;
        let err = flight.arm().await.unwrap_err();
        assert!(matches!(err, FlightError::ArmRejected(_)));
        assert_eq!(flight.phase(), FlightPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeoff_requires_armed() {
        let (_sim, flight) = connected(SimConfig::default()).await;
        assert_eq!(flight.takeoff(2.0).await, Err(FlightError::NotArmed));
        assert_eq!(flight.phase(), FlightPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_requires_emergency_stop() {
        let (_sim, flight) = connected(SimConfig::default()).await;
        assert!(flight.reset().is_err());

        flight.emergency_stop().await.unwrap();
        assert_eq!(flight.phase(), FlightPhase::EmergencyStopped);
        assert!(matches!(
            flight.arm().await,
            Err(FlightError::InvalidPhaseTransition { .. })
        ));
        assert_eq!(flight.reset(), Ok(FlightPhase::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_kill_still_stops() {
        let config = SimConfig {
            kill_rejection: Some(Rejection::denied("kill refused")),
            ..SimConfig::default()
        };
        let (_sim, flight) = connected(config).await;
        let err = flight.emergency_stop().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(flight.phase(), FlightPhase::EmergencyStopped);
    }
}
