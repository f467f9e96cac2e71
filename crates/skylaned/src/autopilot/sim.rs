//! Simulated PX4 vehicle.
//!
//! A deterministic double for the [`Autopilot`] trait. A physics task steps a
//! point-mass vehicle at a fixed period and publishes each channel through its
//! own watch cell. All timing comes from tokio's clock, so scenarios run under
//! `start_paused` tests in virtual time.
//!
//! Every command is recorded with its timestamp so tests can assert ordering,
//! e.g. that setpoints were streamed before `start_offboard`.

use async_trait::async_trait;
use skylane_common::{FlightMode, Health, Ned, PositionNedYaw, RejectCode, Rejection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::{Autopilot, CommandResult, TelemetryStream};
use crate::lock;

/// Vehicle and link behaviour of the simulation.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay between the connect request and the first heartbeat.
    pub connect_delay: Duration,
    /// Accept the connect request but never come up.
    pub refuse_connection: bool,
    /// Whether the rich position channel exists at all.
    pub rich_position: bool,
    /// Health checks turn green this long after connecting. `None` = never.
    pub armable_after: Option<Duration>,
    pub arm_rejection: Option<Rejection>,
    pub offboard_rejection: Option<Rejection>,
    pub kill_rejection: Option<Rejection>,
    /// Time the kill command takes to be acknowledged.
    pub kill_delay: Duration,
    /// Telemetry channels that never deliver a sample.
    pub silent_channels: Vec<&'static str>,
    /// m/s
    pub horizontal_speed: f32,
    /// m/s, climb and offboard vertical moves
    pub vertical_speed: f32,
    /// m/s
    pub landing_speed: f32,
    /// Altitude hold tops out here instead of the commanded takeoff altitude.
    pub altitude_plateau: Option<f32>,
    /// Peak-to-peak oscillation while holding after takeoff.
    pub altitude_jitter: f32,
    pub physics_period: Duration,
    /// Offboard falls back to Hold when no setpoint arrived for this long.
    pub setpoint_loss_timeout: Duration,
    /// Percent per second while armed.
    pub battery_drain: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_millis(100),
            refuse_connection: false,
            rich_position: true,
            armable_after: Some(Duration::ZERO),
            arm_rejection: None,
            offboard_rejection: None,
            kill_rejection: None,
            kill_delay: Duration::ZERO,
            silent_channels: Vec::new(),
            horizontal_speed: 1.0,
            vertical_speed: 1.0,
            landing_speed: 1.0,
            altitude_plateau: None,
            altitude_jitter: 0.0,
            physics_period: Duration::from_millis(50),
            setpoint_loss_timeout: Duration::from_secs(1),
            battery_drain: 0.05,
        }
    }
}

impl SimConfig {
    /// Quick vehicle for wall-clock runs (`skylaned --sim`, facade tests).
    pub fn fast() -> Self {
        Self {
            connect_delay: Duration::from_millis(20),
            horizontal_speed: 5.0,
            vertical_speed: 5.0,
            landing_speed: 5.0,
            physics_period: Duration::from_millis(20),
            ..Self::default()
        }
    }

    pub fn with_plateau(mut self, altitude_m: f32, jitter_m: f32) -> Self {
        self.altitude_plateau = Some(altitude_m);
        self.altitude_jitter = jitter_m;
        self
    }
}

/// A command as it reached the simulated autopilot.
#[derive(Debug, Clone, PartialEq)]
pub enum AutopilotCall {
    Connect(String),
    Arm,
    SetTakeoffAltitude(f32),
    Takeoff,
    Land,
    Kill,
    SetPositionNed(PositionNedYaw),
    StartOffboard,
    StopOffboard,
}

impl AutopilotCall {
    pub fn is_setpoint(&self) -> bool {
        matches!(self, AutopilotCall::SetPositionNed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub at: Instant,
    pub call: AutopilotCall,
}

// ============================================================================
// Vehicle model
// ============================================================================

#[derive(Debug, Clone)]
struct Vehicle {
    position: Ned,
    armed: bool,
    in_air: bool,
    mode: FlightMode,
    battery: f32,
    health: Health,
    takeoff_altitude: f32,
    climb_to: Option<f32>,
    hover_altitude: Option<f32>,
    jitter_sign: f32,
    setpoint: Option<PositionNedYaw>,
    last_setpoint: Option<Instant>,
}

impl Default for Vehicle {
    fn default() -> Self {
        Self {
            position: Ned::default(),
            armed: false,
            in_air: false,
            mode: FlightMode::Ready,
            battery: 100.0,
            health: Health::default(),
            takeoff_altitude: 2.5,
            climb_to: None,
            hover_altitude: None,
            jitter_sign: 1.0,
            setpoint: None,
            last_setpoint: None,
        }
    }
}

impl Vehicle {
    fn setpoint_fresh(&self, now: Instant, timeout: Duration) -> bool {
        self.last_setpoint
            .map_or(false, |at| now.duration_since(at) <= timeout)
    }

    fn hold_here(&mut self) {
        self.mode = FlightMode::Hold;
        self.hover_altitude = Some(self.position.altitude());
    }

    fn step(&mut self, config: &SimConfig, now: Instant, health_ready: bool) {
        let dt = config.physics_period.as_secs_f32();

        self.health = if health_ready {
            Health::ready()
        } else {
            Health {
                global_position_ok: false,
                home_position_ok: false,
                armable: false,
                ..Health::ready()
            }
        };

        if self.armed {
            self.battery = (self.battery - config.battery_drain * dt).max(0.0);
        }

        match self.mode {
            FlightMode::Takeoff => {
                let target = self.climb_to.unwrap_or(self.takeoff_altitude);
                let next = (self.position.altitude() + config.vertical_speed * dt).min(target);
                self.position.down = -next;
                if next >= target {
                    self.hold_here();
                }
            }
            FlightMode::Hold => {
                if let Some(hover) = self.hover_altitude {
                    if config.altitude_jitter > 0.0 && self.in_air {
                        self.position.down =
                            -(hover + self.jitter_sign * config.altitude_jitter / 2.0);
                        self.jitter_sign = -self.jitter_sign;
                    }
                }
            }
            FlightMode::Offboard => {
                if !self.setpoint_fresh(now, config.setpoint_loss_timeout) {
                    info!("[SIM] Setpoint stream lost, falling back to HOLD");
                    self.hold_here();
                } else if let (true, Some(setpoint)) = (self.armed, self.setpoint) {
                    self.move_toward(setpoint.position, config, dt);
                    self.in_air = self.position.altitude() > 0.05;
                }
            }
            FlightMode::Land => {
                let next = (self.position.altitude() - config.landing_speed * dt).max(0.0);
                self.position.down = -next;
                if next <= 0.0 {
                    self.position.down = 0.0;
                    self.in_air = false;
                    self.armed = false;
                    self.hover_altitude = None;
                }
            }
            _ => {}
        }
    }

    fn move_toward(&mut self, target: Ned, config: &SimConfig, dt: f32) {
        let dn = target.north - self.position.north;
        let de = target.east - self.position.east;
        let planar = dn.hypot(de);
        let reach = config.horizontal_speed * dt;
        if planar <= reach {
            self.position.north = target.north;
            self.position.east = target.east;
        } else {
            self.position.north += dn / planar * reach;
            self.position.east += de / planar * reach;
        }

        let dd = target.down - self.position.down;
        let climb = config.vertical_speed * dt;
        if dd.abs() <= climb {
            self.position.down = target.down;
        } else {
            self.position.down += dd.signum() * climb;
        }
    }
}

// ============================================================================
// Channels
// ============================================================================

struct Channels {
    connected: watch::Sender<bool>,
    ned: watch::Sender<Option<Ned>>,
    altitude: watch::Sender<Option<f32>>,
    armed: watch::Sender<Option<bool>>,
    in_air: watch::Sender<Option<bool>>,
    mode: watch::Sender<Option<FlightMode>>,
    battery: watch::Sender<Option<f32>>,
    health: watch::Sender<Option<Health>>,
}

impl Channels {
    fn new() -> Self {
        Self {
            connected: watch::channel(false).0,
            ned: watch::channel(None).0,
            altitude: watch::channel(None).0,
            armed: watch::channel(None).0,
            in_air: watch::channel(None).0,
            mode: watch::channel(None).0,
            battery: watch::channel(None).0,
            health: watch::channel(None).0,
        }
    }

    fn publish(&self, vehicle: &Vehicle, rich_position: bool) {
        if rich_position {
            self.ned.send_replace(Some(vehicle.position));
        }
        self.altitude.send_replace(Some(vehicle.position.altitude()));
        self.battery.send_replace(Some(vehicle.battery));
        self.armed
            .send_if_modified(|slot| replace_changed(slot, Some(vehicle.armed)));
        self.in_air
            .send_if_modified(|slot| replace_changed(slot, Some(vehicle.in_air)));
        self.mode
            .send_if_modified(|slot| replace_changed(slot, Some(vehicle.mode)));
        self.health
            .send_if_modified(|slot| replace_changed(slot, Some(vehicle.health)));
    }
}

fn replace_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

// ============================================================================
// Simulated Autopilot
// ============================================================================

struct Inner {
    config: SimConfig,
    vehicle: Mutex<Vehicle>,
    channels: Mutex<Channels>,
    physics: Mutex<Option<JoinHandle<()>>>,
    trace: Mutex<Vec<TraceEntry>>,
    subscriptions: Mutex<HashMap<&'static str, usize>>,
}

pub struct SimulatedAutopilot {
    inner: Arc<Inner>,
}

impl SimulatedAutopilot {
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                vehicle: Mutex::new(Vehicle::default()),
                channels: Mutex::new(Channels::new()),
                physics: Mutex::new(None),
                trace: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Every command received so far, oldest first.
    pub fn trace(&self) -> Vec<TraceEntry> {
        lock(&self.inner.trace).clone()
    }

    pub fn calls(&self) -> Vec<AutopilotCall> {
        self.trace().into_iter().map(|entry| entry.call).collect()
    }

    /// How many times a telemetry channel was subscribed.
    pub fn subscriptions(&self, channel: &str) -> usize {
        lock(&self.inner.subscriptions)
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Ground-truth position of the simulated vehicle.
    pub fn vehicle_position(&self) -> Ned {
        lock(&self.inner.vehicle).position
    }

    /// Mode change not requested by the core (RC override, failsafe).
    pub fn override_mode(&self, mode: FlightMode) {
        let mut vehicle = lock(&self.inner.vehicle);
        if mode == FlightMode::Hold {
            vehicle.hold_here();
        } else {
            vehicle.mode = mode;
        }
        info!("[SIM] Mode overridden to {}", mode);
    }

    /// Sever the link: the physics task stops, `connection_state` reports
    /// `false` and every open stream ends. A later `connect` starts over.
    pub fn drop_link(&self) {
        if let Some(handle) = lock(&self.inner.physics).take() {
            handle.abort();
        }
        let old = std::mem::replace(&mut *lock(&self.inner.channels), Channels::new());
        old.connected.send_replace(false);
        info!("[SIM] Link dropped");
    }

    fn record(&self, call: AutopilotCall) {
        debug!("[SIM] {:?}", call);
        lock(&self.inner.trace).push(TraceEntry {
            at: Instant::now(),
            call,
        });
    }

    fn is_connected(&self) -> bool {
        *lock(&self.inner.channels).connected.borrow()
    }

    fn require_link(&self) -> CommandResult {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Rejection::new(RejectCode::ConnectionError, "no link"))
        }
    }

    fn subscribe<T>(
        &self,
        channel: &'static str,
        pick: impl FnOnce(&Channels) -> watch::Receiver<Option<T>>,
    ) -> TelemetryStream<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        *lock(&self.inner.subscriptions).entry(channel).or_insert(0) += 1;
        if self.inner.config.silent_channels.contains(&channel) {
            debug!("[SIM] Channel {} stays silent", channel);
            return Box::pin(tokio_stream::pending());
        }
        let rx = pick(&*lock(&self.inner.channels));
        Box::pin(WatchStream::new(rx).filter_map(|sample| sample))
    }
}

impl Default for SimulatedAutopilot {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl Drop for SimulatedAutopilot {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inner.physics).take() {
            handle.abort();
        }
    }
}

async fn run_physics(inner: Arc<Inner>) {
    time::sleep(inner.config.connect_delay).await;
    if inner.config.refuse_connection {
        debug!("[SIM] Staying silent");
        return;
    }

    let connected_at = Instant::now();
    let mut ticker = time::interval(inner.config.physics_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut announced = false;

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let health_ready = inner
            .config
            .armable_after
            .map_or(false, |after| now.duration_since(connected_at) >= after);

        let sample = {
            let mut vehicle = lock(&inner.vehicle);
            vehicle.step(&inner.config, now, health_ready);
            vehicle.clone()
        };

        let channels = lock(&inner.channels);
        channels.publish(&sample, inner.config.rich_position);
        if !announced {
            channels.connected.send_replace(true);
            announced = true;
        }
    }
}

#[async_trait]
impl Autopilot for SimulatedAutopilot {
    async fn connect(&self, address: &str) -> Result<(), String> {
        self.record(AutopilotCall::Connect(address.to_string()));
        let mut physics = lock(&self.inner.physics);
        if physics.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return Ok(());
        }
        *physics = Some(tokio::spawn(run_physics(self.inner.clone())));
        Ok(())
    }

    fn connection_state(&self) -> TelemetryStream<bool> {
        *lock(&self.inner.subscriptions)
            .entry("connection_state")
            .or_insert(0) += 1;
        let rx = lock(&self.inner.channels).connected.subscribe();
        Box::pin(WatchStream::new(rx))
    }

    fn position_velocity_ned(&self) -> Option<TelemetryStream<Ned>> {
        if !self.inner.config.rich_position {
            return None;
        }
        Some(self.subscribe("position_velocity_ned", |ch| ch.ned.subscribe()))
    }

    fn position(&self) -> TelemetryStream<f32> {
        self.subscribe("position", |ch| ch.altitude.subscribe())
    }

    fn armed(&self) -> TelemetryStream<bool> {
        self.subscribe("armed", |ch| ch.armed.subscribe())
    }

    fn in_air(&self) -> TelemetryStream<bool> {
        self.subscribe("in_air", |ch| ch.in_air.subscribe())
    }

    fn flight_mode(&self) -> TelemetryStream<FlightMode> {
        self.subscribe("flight_mode", |ch| ch.mode.subscribe())
    }

    fn battery(&self) -> TelemetryStream<f32> {
        self.subscribe("battery", |ch| ch.battery.subscribe())
    }

    fn health(&self) -> TelemetryStream<Health> {
        self.subscribe("health", |ch| ch.health.subscribe())
    }

    async fn arm(&self) -> CommandResult {
        self.record(AutopilotCall::Arm);
        self.require_link()?;
        if let Some(rejection) = &self.inner.config.arm_rejection {
            return Err(rejection.clone());
        }
        let mut vehicle = lock(&self.inner.vehicle);
        if !vehicle.health.armable {
            return Err(Rejection::denied("Arming denied: vehicle not armable"));
        }
        vehicle.armed = true;
        Ok(())
    }

    async fn set_takeoff_altitude(&self, altitude_m: f32) -> CommandResult {
        self.record(AutopilotCall::SetTakeoffAltitude(altitude_m));
        self.require_link()?;
        lock(&self.inner.vehicle).takeoff_altitude = altitude_m;
        Ok(())
    }

    async fn takeoff(&self) -> CommandResult {
        self.record(AutopilotCall::Takeoff);
        self.require_link()?;
        let mut vehicle = lock(&self.inner.vehicle);
        if !vehicle.armed {
            return Err(Rejection::denied("Takeoff denied: not armed"));
        }
        let target = match self.inner.config.altitude_plateau {
            Some(plateau) => vehicle.takeoff_altitude.min(plateau),
            None => vehicle.takeoff_altitude,
        };
        vehicle.mode = FlightMode::Takeoff;
        vehicle.in_air = true;
        vehicle.climb_to = Some(target);
        vehicle.hover_altitude = None;
        Ok(())
    }

    async fn land(&self) -> CommandResult {
        self.record(AutopilotCall::Land);
        self.require_link()?;
        lock(&self.inner.vehicle).mode = FlightMode::Land;
        Ok(())
    }

    async fn kill(&self) -> CommandResult {
        self.record(AutopilotCall::Kill);
        if !self.inner.config.kill_delay.is_zero() {
            time::sleep(self.inner.config.kill_delay).await;
        }
        self.require_link()?;
        if let Some(rejection) = &self.inner.config.kill_rejection {
            return Err(rejection.clone());
        }
        let mut vehicle = lock(&self.inner.vehicle);
        vehicle.armed = false;
        vehicle.in_air = false;
        vehicle.position.down = 0.0;
        vehicle.setpoint = None;
        vehicle.hover_altitude = None;
        vehicle.mode = FlightMode::Manual;
        Ok(())
    }

    async fn set_position_ned(&self, setpoint: PositionNedYaw) -> CommandResult {
        self.record(AutopilotCall::SetPositionNed(setpoint));
        self.require_link()?;
        let mut vehicle = lock(&self.inner.vehicle);
        vehicle.setpoint = Some(setpoint);
        vehicle.last_setpoint = Some(Instant::now());
        Ok(())
    }

    async fn start_offboard(&self) -> CommandResult {
        self.record(AutopilotCall::StartOffboard);
        self.require_link()?;
        if let Some(rejection) = &self.inner.config.offboard_rejection {
            return Err(rejection.clone());
        }
        let mut vehicle = lock(&self.inner.vehicle);
        if !vehicle.setpoint_fresh(Instant::now(), self.inner.config.setpoint_loss_timeout) {
            return Err(Rejection::new(
                RejectCode::NoSetpoint,
                "Offboard denied: no recent setpoint",
            ));
        }
        vehicle.mode = FlightMode::Offboard;
        vehicle.hover_altitude = None;
        Ok(())
    }

    async fn stop_offboard(&self) -> CommandResult {
        self.record(AutopilotCall::StopOffboard);
        self.require_link()?;
        let mut vehicle = lock(&self.inner.vehicle);
        if vehicle.mode == FlightMode::Offboard {
            vehicle.hold_here();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[tokio::test(start_paused = true)]
    async fn test_connects_after_delay() {
        let sim = SimulatedAutopilot::default();
        let mut state = sim.connection_state();
        assert_eq!(state.next().await, Some(false));

        sim.connect("udp://:14540").await.unwrap();
        assert_eq!(state.next().await, Some(true));
        assert_eq!(sim.calls(), vec![AutopilotCall::Connect("udp://:14540".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offboard_requires_recent_setpoint() {
        let sim = SimulatedAutopilot::default();
        sim.connect("sim").await.unwrap();
        time::sleep(Duration::from_millis(300)).await;

        let err = sim.start_offboard().await.unwrap_err();
        assert_eq!(err.code, RejectCode::NoSetpoint);

        sim.set_position_ned(PositionNedYaw::default()).await.unwrap();
        assert!(sim.start_offboard().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeoff_climbs_to_plateau() {
        let sim = SimulatedAutopilot::new(SimConfig::default().with_plateau(1.2, 0.0));
        sim.connect("sim").await.unwrap();
        time::sleep(Duration::from_millis(300)).await;

        sim.arm().await.unwrap();
        sim.set_takeoff_altitude(2.0).await.unwrap();
        sim.takeoff().await.unwrap();
        time::sleep(Duration::from_secs(3)).await;

        assert_relative_eq!(sim.vehicle_position().altitude(), 1.2, epsilon = 1e-4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_link_ends_streams() {
        let sim = SimulatedAutopilot::default();
        sim.connect("sim").await.unwrap();
        let mut armed = sim.armed();
        assert_eq!(armed.next().await, Some(false));

        sim.drop_link();
        assert_eq!(armed.next().await, None);
        assert!(sim.arm().await.is_err());
    }
}
