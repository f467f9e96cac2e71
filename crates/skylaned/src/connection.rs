//! Connection Manager
//!
//! Establishes the autopilot link and starts telemetry once per session.
//! There is no automatic reconnect: after a link loss the caller has to ask
//! again, so flight commands never resume silently against a stale session.

use skylane_common::FlightError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::autopilot::Autopilot;
use crate::telemetry::TelemetryAggregator;

pub struct ConnectionManager {
    autopilot: Arc<dyn Autopilot>,
    telemetry: Arc<TelemetryAggregator>,
    gate: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(autopilot: Arc<dyn Autopilot>, telemetry: Arc<TelemetryAggregator>) -> Self {
        Self {
            autopilot,
            telemetry,
            gate: Mutex::new(()),
        }
    }

    /// Connect and wait for the first "connected" event, at most `timeout`.
    ///
    /// A no-op while already connected.
    pub async fn connect(&self, address: &str, timeout: Duration) -> Result<(), FlightError> {
        let _gate = self.gate.lock().await;
        if self.telemetry.is_connected() {
            debug!("[LINK] Already connected, nothing to do");
            return Ok(());
        }

        info!("[LINK] Connecting to {}", address);
        let mut state = self.autopilot.connection_state();
        self.autopilot.connect(address).await.map_err(|e| {
            warn!("[LINK] Connection request failed: {}", e);
            FlightError::Link(e)
        })?;

        let came_up = async {
            while let Some(connected) = state.next().await {
                if connected {
                    return true;
                }
            }
            false
        };

        match tokio::time::timeout(timeout, came_up).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("[LINK] Connection state stream ended before the link came up");
                return Err(FlightError::LinkLost);
            }
            Err(_) => {
                warn!(
                    "[LINK] No heartbeat from {} within {}s",
                    address,
                    timeout.as_secs()
                );
                return Err(FlightError::ConnectionTimeout {
                    address: address.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        }

        info!("[LINK] Connected to {}", address);
        self.telemetry.start(&self.autopilot);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.telemetry.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autopilot::sim::{AutopilotCall, SimConfig, SimulatedAutopilot};

    fn manager(config: SimConfig) -> (Arc<SimulatedAutopilot>, Arc<TelemetryAggregator>, ConnectionManager) {
        let sim = Arc::new(SimulatedAutopilot::new(config));
        let telemetry = Arc::new(TelemetryAggregator::new());
        let manager = ConnectionManager::new(sim.clone(), telemetry.clone());
        (sim, telemetry, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_starts_telemetry_once() {
        let (sim, telemetry, manager) = manager(SimConfig::default());
        manager.connect("udp://:14540", Duration::from_secs(10)).await.unwrap();
        manager.connect("udp://:14540", Duration::from_secs(10)).await.unwrap();

        assert_eq!(telemetry.sessions_started(), 1);
        assert_eq!(sim.subscriptions("armed"), 1);
        let connects = sim
            .calls()
            .into_iter()
            .filter(|call| matches!(call, AutopilotCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_autopilot_times_out() {
        let config = SimConfig {
            refuse_connection: true,
            ..SimConfig::default()
        };
        let (_sim, telemetry, manager) = manager(config);
        let err = manager
            .connect("udp://:14540", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FlightError::ConnectionTimeout {
                address: "udp://:14540".into(),
                timeout_secs: 5
            }
        );
        assert!(!telemetry.is_connected());
        assert_eq!(telemetry.sessions_started(), 0);
    }
}
