//! Telemetry Aggregator
//!
//! Keeps the latest known vehicle state. Every telemetry channel is pumped by
//! its own task into its own watch cell, so a silent channel never holds back
//! the others. Each cell has exactly one writer; readers take a snapshot
//! without blocking any loop.
//!
//! The loops end when the link goes away. Reconnecting is the connection
//! manager's job, never this module's.

use chrono::{DateTime, Utc};
use skylane_common::{FlightMode, Health, Ned, PositionSource, VehicleState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::autopilot::{Autopilot, TelemetryStream};
use crate::lock;

/// Rich position older than the basic channel by this much is ignored.
const RICH_STALE_AFTER: Duration = Duration::from_secs(1);

/// A sample with its arrival time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub at: Instant,
    pub wall: DateTime<Utc>,
}

impl<T> Stamped<T> {
    fn now(value: T) -> Self {
        Self {
            value,
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

type Cell<T> = watch::Sender<Option<Stamped<T>>>;

pub struct TelemetryAggregator {
    rich: Cell<Ned>,
    basic: Cell<f32>,
    armed: Cell<bool>,
    in_air: Cell<bool>,
    flight_mode: Cell<FlightMode>,
    battery: Cell<f32>,
    health: Cell<Health>,
    connected: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    sessions: AtomicUsize,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self {
            rich: watch::channel(None).0,
            basic: watch::channel(None).0,
            armed: watch::channel(None).0,
            in_air: watch::channel(None).0,
            flight_mode: watch::channel(None).0,
            battery: watch::channel(None).0,
            health: watch::channel(None).0,
            connected: watch::channel(false).0,
            loops: Mutex::new(Vec::new()),
            sessions: AtomicUsize::new(0),
        }
    }

    /// Start one subscription loop per channel plus the link watcher.
    ///
    /// Called once per established connection.
    pub fn start(self: &Arc<Self>, autopilot: &Arc<dyn Autopilot>) {
        let mut loops = lock(&self.loops);
        for stale in loops.drain(..) {
            stale.abort();
        }

        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.send_replace(true);

        let rich = autopilot.position_velocity_ned();
        if rich.is_none() {
            warn!("[TELEMETRY] Rich position unavailable, using relative altitude only");
        }

        loops.push(tokio::spawn(
            self.clone().pump_position(rich, autopilot.position()),
        ));
        loops.push(tokio::spawn(
            self.clone().pump("armed", autopilot.armed(), |t| &t.armed),
        ));
        loops.push(tokio::spawn(
            self.clone().pump("in_air", autopilot.in_air(), |t| &t.in_air),
        ));
        loops.push(tokio::spawn(self.clone().pump(
            "flight_mode",
            autopilot.flight_mode(),
            |t| &t.flight_mode,
        )));
        loops.push(tokio::spawn(
            self.clone().pump("battery", autopilot.battery(), |t| &t.battery),
        ));
        loops.push(tokio::spawn(
            self.clone().pump("health", autopilot.health(), |t| &t.health),
        ));
        loops.push(tokio::spawn(
            self.clone().watch_link(autopilot.connection_state()),
        ));

        info!("[TELEMETRY] Session {} started ({} loops)", session, loops.len());
    }

    async fn pump<T, F>(self: Arc<Self>, channel: &'static str, mut stream: TelemetryStream<T>, cell: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Self) -> &Cell<T> + Send + 'static,
    {
        while let Some(value) = stream.next().await {
            cell(&self).send_replace(Some(Stamped::now(value)));
            tokio::task::yield_now().await;
        }
        debug!("[TELEMETRY] {} stream ended", channel);
    }

    async fn pump_position(
        self: Arc<Self>,
        mut rich: Option<TelemetryStream<Ned>>,
        mut basic: TelemetryStream<f32>,
    ) {
        loop {
            tokio::select! {
                sample = next_or_pending(&mut rich) => match sample {
                    Some(ned) => {
                        self.rich.send_replace(Some(Stamped::now(ned)));
                    }
                    None => {
                        debug!("[TELEMETRY] Rich position stream ended");
                        rich = None;
                    }
                },
                sample = basic.next() => match sample {
                    Some(altitude) => {
                        self.basic.send_replace(Some(Stamped::now(altitude)));
                    }
                    None => break,
                },
            }
            tokio::task::yield_now().await;
        }
        debug!("[TELEMETRY] position stream ended");
    }

    async fn watch_link(self: Arc<Self>, mut state: TelemetryStream<bool>) {
        let mut seen_up = false;
        while let Some(connected) = state.next().await {
            if connected {
                seen_up = true;
            } else if seen_up {
                break;
            }
        }

        self.connected.send_replace(false);
        warn!("[TELEMETRY] Link lost, stopping telemetry loops");
        for handle in lock(&self.loops).drain(..) {
            handle.abort();
        }
    }

    /// Non-blocking snapshot. Fields may differ in age.
    pub fn current_state(&self) -> VehicleState {
        let rich = *self.rich.borrow();
        let basic = *self.basic.borrow();
        let armed = *self.armed.borrow();
        let in_air = *self.in_air.borrow();
        let flight_mode = *self.flight_mode.borrow();
        let battery = *self.battery.borrow();

        let position = match (rich, basic) {
            (Some(r), Some(b)) if b.at.saturating_duration_since(r.at) > RICH_STALE_AFTER => {
                Some(PositionSource::Basic {
                    relative_altitude_m: b.value,
                })
            }
            (Some(r), _) => Some(PositionSource::Rich(r.value)),
            (None, Some(b)) => Some(PositionSource::Basic {
                relative_altitude_m: b.value,
            }),
            (None, None) => None,
        };

        let last_update = [
            rich.map(|s| s.wall),
            basic.map(|s| s.wall),
            armed.map(|s| s.wall),
            in_air.map(|s| s.wall),
            flight_mode.map(|s| s.wall),
            battery.map(|s| s.wall),
        ]
        .into_iter()
        .flatten()
        .max();

        VehicleState {
            position,
            armed: armed.map_or(false, |s| s.value),
            in_air: in_air.map_or(false, |s| s.value),
            flight_mode: flight_mode.map(|s| s.value).unwrap_or_default(),
            battery_percent: battery.map(|s| s.value),
            connected: self.is_connected(),
            last_update,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn health(&self) -> Option<Health> {
        self.health.borrow().map(|s| s.value)
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn subscribe_armed(&self) -> watch::Receiver<Option<Stamped<bool>>> {
        self.armed.subscribe()
    }

    pub fn subscribe_in_air(&self) -> watch::Receiver<Option<Stamped<bool>>> {
        self.in_air.subscribe()
    }

    pub fn subscribe_flight_mode(&self) -> watch::Receiver<Option<Stamped<FlightMode>>> {
        self.flight_mode.subscribe()
    }

    /// Loops of the current session that are still running.
    pub fn active_loops(&self) -> usize {
        lock(&self.loops)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new()
    }
}

async fn next_or_pending<T>(stream: &mut Option<TelemetryStream<T>>) -> Option<T> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autopilot::sim::{SimConfig, SimulatedAutopilot};
    use approx::assert_relative_eq;

    async fn started(config: SimConfig) -> (Arc<SimulatedAutopilot>, Arc<TelemetryAggregator>) {
        let sim = Arc::new(SimulatedAutopilot::new(config));
        let autopilot: Arc<dyn Autopilot> = sim.clone();
        autopilot.connect("sim").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let telemetry = Arc::new(TelemetryAggregator::new());
        telemetry.start(&autopilot);
        tokio::time::sleep(Duration::from_millis(200)).await;
        (sim, telemetry)
    }

    #[test]
    fn test_empty_snapshot() {
        let telemetry = TelemetryAggregator::new();
        let state = telemetry.current_state();
        assert!(state.position.is_none());
        assert!(!state.connected);
        assert!(state.last_update.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_populate() {
        let (_sim, telemetry) = started(SimConfig::default()).await;
        let state = telemetry.current_state();
        assert!(state.connected);
        assert!(matches!(state.position, Some(PositionSource::Rich(_))));
        assert_eq!(state.flight_mode, FlightMode::Ready);
        assert_eq!(state.battery_percent, Some(100.0));
        assert!(state.last_update.is_some());
        assert_eq!(telemetry.active_loops(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_basic_position_without_rich_channel() {
        let config = SimConfig {
            rich_position: false,
            ..SimConfig::default()
        };
        let (_sim, telemetry) = started(config).await;
        let state = telemetry.current_state();
        match state.position {
            Some(PositionSource::Basic { relative_altitude_m }) => {
                assert_relative_eq!(relative_altitude_m, 0.0)
            }
            other => panic!("expected basic position, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_does_not_hold_back_position() {
        let config = SimConfig {
            silent_channels: vec!["battery"],
            ..SimConfig::default()
        };
        let (sim, telemetry) = started(config).await;
        assert_eq!(sim.subscriptions("battery"), 1);

        sim.arm().await.unwrap();
        sim.set_takeoff_altitude(2.0).await.unwrap();
        sim.takeoff().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let early = telemetry.current_state().altitude();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let state = telemetry.current_state();

        assert!(early > 0.2, "altitude {} after 500ms", early);
        assert!(state.altitude() > early + 0.3);
        assert!(state.in_air);
        assert_eq!(state.battery_percent, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_stop_on_link_loss() {
        let (sim, telemetry) = started(SimConfig::default()).await;
        sim.drop_link();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!telemetry.is_connected());
        assert_eq!(telemetry.active_loops(), 0);
        assert_eq!(telemetry.sessions_started(), 1);
    }
}
