//! Offboard Handshake
//!
//! PX4 refuses to enter offboard mode unless position setpoints are already
//! arriving. `engage` therefore streams the current position for the
//! configured dwell time before requesting the mode switch.
//!
//! This module owns the `active` flag and is its only writer. Nothing else may
//! send a setpoint while the flag is clear; [`OffboardHandshake::set_position`]
//! engages first when needed.

use skylane_common::config::OffboardConfig;
use skylane_common::{PositionNedYaw, RejectCode, Rejection};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::autopilot::Autopilot;
use crate::telemetry::TelemetryAggregator;

pub struct OffboardHandshake {
    autopilot: Arc<dyn Autopilot>,
    telemetry: Arc<TelemetryAggregator>,
    config: OffboardConfig,
    active: watch::Sender<bool>,
    serial: Mutex<()>,
}

impl OffboardHandshake {
    pub fn new(
        autopilot: Arc<dyn Autopilot>,
        telemetry: Arc<TelemetryAggregator>,
        config: OffboardConfig,
    ) -> Self {
        Self {
            autopilot,
            telemetry,
            config,
            active: watch::channel(false).0,
            serial: Mutex::new(()),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    /// Pre-stream the current position, then request offboard mode.
    ///
    /// On rejection the flag stays as it was and the autopilot's reason is
    /// returned.
    pub async fn engage(&self) -> Result<(), Rejection> {
        let _serial = self.serial.lock().await;
        if self.is_active() {
            return Ok(());
        }

        let hold = self.hold_setpoint()?;
        let samples = self.config.pre_stream_samples();
        let period = self.config.setpoint_period();
        info!(
            "[OFFBOARD] Pre-streaming {} ({} setpoints every {}ms)",
            hold.position,
            samples,
            period.as_millis()
        );

        for _ in 0..samples {
            self.autopilot.set_position_ned(hold).await?;
            tokio::time::sleep(period).await;
        }

        match self.autopilot.start_offboard().await {
            Ok(()) => {
                self.active.send_replace(true);
                info!("[OFFBOARD] Offboard mode engaged");
                Ok(())
            }
            Err(rejection) => {
                warn!("[OFFBOARD] Offboard start rejected: {}", rejection);
                Err(rejection)
            }
        }
    }

    /// Stop offboard mode. A no-op when it was never engaged.
    ///
    /// The flag is cleared even if the autopilot refuses; it then falls back to
    /// its own failsafe once setpoints stop.
    pub async fn disengage(&self) -> Result<(), Rejection> {
        let _serial = self.serial.lock().await;
        if !self.is_active() {
            return Ok(());
        }

        let result = self.autopilot.stop_offboard().await;
        self.active.send_replace(false);
        match &result {
            Ok(()) => info!("[OFFBOARD] Offboard mode stopped"),
            Err(rejection) => warn!("[OFFBOARD] Stop offboard failed: {}", rejection),
        }
        result
    }

    /// Forget the engagement without talking to the autopilot.
    ///
    /// Used when the autopilot already left offboard on its own or the link is
    /// gone.
    pub fn invalidate(&self) {
        if self.active.send_replace(false) {
            debug!("[OFFBOARD] Engagement invalidated");
        }
    }

    /// Send one setpoint, engaging first when offboard is not active.
    pub async fn set_position(&self, setpoint: PositionNedYaw) -> Result<(), Rejection> {
        if !self.is_active() {
            self.engage().await?;
        }
        self.autopilot.set_position_ned(setpoint).await
    }

    /// Current position as a hold setpoint. With only the basic position
    /// channel this is the origin at the reported altitude.
    fn hold_setpoint(&self) -> Result<PositionNedYaw, Rejection> {
        let state = self.telemetry.current_state();
        match state.position {
            Some(source) => {
                if source.is_degraded() {
                    warn!("[OFFBOARD] Rich position unavailable, holding at N=0 E=0");
                }
                Ok(PositionNedYaw::new(source.ned(), 0.0))
            }
            None => Err(Rejection::new(
                RejectCode::NoPositionEstimate,
                "no position telemetry received yet",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autopilot::sim::{AutopilotCall, SimConfig, SimulatedAutopilot};
    use std::time::Duration;

    async fn handshake(config: SimConfig) -> (Arc<SimulatedAutopilot>, OffboardHandshake) {
        let sim = Arc::new(SimulatedAutopilot::new(config));
        let autopilot: Arc<dyn Autopilot> = sim.clone();
        let telemetry = Arc::new(TelemetryAggregator::new());
        autopilot.connect("sim").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        telemetry.start(&autopilot);
        tokio::time::sleep(Duration::from_millis(200)).await;
        (
            sim,
            OffboardHandshake::new(autopilot, telemetry, OffboardConfig::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_disengage_without_engage_is_noop() {
        let (sim, handshake) = handshake(SimConfig::default()).await;
        handshake.disengage().await.unwrap();
        assert!(!sim.calls().contains(&AutopilotCall::StopOffboard));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_leaves_flag_clear() {
        let config = SimConfig {
            offboard_rejection: Some(Rejection::denied("mode switch refused")),
            ..SimConfig::default()
        };
        let (_sim, handshake) = handshake(config).await;
        let err = handshake.engage().await.unwrap_err();
        assert_eq!(err.code, RejectCode::Denied);
        assert!(!handshake.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_engage_on_setpoint() {
        let (sim, handshake) = handshake(SimConfig::default()).await;
        handshake
            .set_position(PositionNedYaw::default())
            .await
            .unwrap();
        assert!(handshake.is_active());

        let calls = sim.calls();
        let start = calls
            .iter()
            .position(|c| *c == AutopilotCall::StartOffboard)
            .unwrap();
        assert_eq!(calls[..start].iter().filter(|c| c.is_setpoint()).count(), 10);
        assert!(calls[start + 1].is_setpoint());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_sends_nothing() {
        let (sim, handshake) = handshake(SimConfig::default()).await;
        handshake.engage().await.unwrap();
        let before = sim.calls().len();

        handshake.invalidate();
        assert!(!handshake.is_active());
        assert_eq!(sim.calls().len(), before);
    }
}
