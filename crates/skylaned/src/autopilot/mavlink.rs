//! PX4 over MAVLink
//!
//! A blocking reader thread decodes incoming messages into watch cells; the
//! async side only reads cells and sends. A second thread emits the 1 Hz GCS
//! heartbeat and reports the link down when the vehicle's heartbeat goes
//! silent.
//!
//! Addresses use the MAVSDK form (`udp://:14540`, `tcp://host:port`,
//! `serial:///dev/ttyACM0:57600`).

use async_trait::async_trait;
use ::mavlink::common::{
    MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavModeFlag, MavResult, MavState,
    MavSysStatusSensor, MavType, PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA,
    SET_POSITION_TARGET_LOCAL_NED_DATA, SYS_STATUS_DATA,
};
use ::mavlink::{MavConnection, MavHeader};
use skylane_common::{FlightMode, Health, Ned, PositionNedYaw, RejectCode, Rejection};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{Autopilot, CommandResult, TelemetryStream};
use crate::lock;

const GCS_SYSTEM_ID: u8 = 255;
const GCS_COMPONENT_ID: u8 = 190;
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
/// The link counts as lost after this long without a vehicle heartbeat.
const HEARTBEAT_SILENCE: Duration = Duration::from_secs(3);
const ACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Magic param2 of ARM_DISARM that forces a disarm in flight.
const FORCE_DISARM: f32 = 21196.0;

const PX4_MAIN_MODE_AUTO: f32 = 4.0;
const PX4_MAIN_MODE_OFFBOARD: f32 = 6.0;
const PX4_AUTO_LOITER: f32 = 3.0;

type Connection = Arc<Box<dyn MavConnection<MavMessage> + Send + Sync>>;

/// An open connection and the liveness flag its threads run on.
struct Link {
    connection: Connection,
    alive: Arc<AtomicBool>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// Translate a MAVSDK-style address into a mavlink connection string.
pub fn connection_string(address: &str) -> Result<String, String> {
    if let Some(rest) = address.strip_prefix("udp://") {
        let (host, port) = split_host_port(rest)?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        return Ok(format!("udpin:{}:{}", host, port));
    }
    if let Some(rest) = address.strip_prefix("tcp://") {
        let (host, port) = split_host_port(rest)?;
        if host.is_empty() {
            return Err(format!("tcp address needs a host: {}", address));
        }
        return Ok(format!("tcpout:{}:{}", host, port));
    }
    if let Some(rest) = address.strip_prefix("serial://") {
        let (device, baud) = split_host_port(rest)?;
        return Ok(format!("serial:{}:{}", device, baud));
    }
    Err(format!("unsupported address scheme: {}", address))
}

fn split_host_port(rest: &str) -> Result<(&str, u32), String> {
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in '{}'", rest))?;
    let port = port
        .parse::<u32>()
        .map_err(|e| format!("invalid port '{}': {}", port, e))?;
    Ok((host, port))
}

/// Decode PX4's custom mode field.
pub fn px4_flight_mode(custom_mode: u32) -> FlightMode {
    let main = (custom_mode >> 16) & 0xFF;
    let sub = (custom_mode >> 24) & 0xFF;
    match (main, sub) {
        (1, _) => FlightMode::Manual,
        (2, _) => FlightMode::Altctl,
        (3, _) => FlightMode::Posctl,
        (4, 1) => FlightMode::Ready,
        (4, 2) => FlightMode::Takeoff,
        (4, 3) => FlightMode::Hold,
        (4, 4) => FlightMode::Mission,
        (4, 5) => FlightMode::ReturnToLaunch,
        (4, 6) => FlightMode::Land,
        (4, 8) => FlightMode::FollowMe,
        (5, _) => FlightMode::Acro,
        (6, _) => FlightMode::Offboard,
        (7, _) => FlightMode::Stabilized,
        (8, _) => FlightMode::Rattitude,
        _ => FlightMode::Unknown,
    }
}

fn rejection_for(result: MavResult) -> Rejection {
    let code = match result {
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => RejectCode::Busy,
        MavResult::MAV_RESULT_DENIED => RejectCode::Denied,
        MavResult::MAV_RESULT_UNSUPPORTED => RejectCode::Unsupported,
        _ => RejectCode::Failed,
    };
    Rejection::new(code, format!("{:?}", result))
}

// ============================================================================
// Decoded state
// ============================================================================

struct Cells {
    connected: watch::Sender<bool>,
    ned: watch::Sender<Option<Ned>>,
    altitude: watch::Sender<Option<f32>>,
    armed: watch::Sender<Option<bool>>,
    in_air: watch::Sender<Option<bool>>,
    mode: watch::Sender<Option<FlightMode>>,
    battery: watch::Sender<Option<f32>>,
    health: watch::Sender<Option<Health>>,
    acks: broadcast::Sender<(MavCmd, MavResult)>,
    last_heartbeat: Mutex<Option<Instant>>,
    home_amsl_m: Mutex<Option<f32>>,
    home_seen: AtomicBool,
    local_seen: AtomicBool,
    target_system: AtomicU8,
}

impl Cells {
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
            acks: broadcast::channel(16).0,
            last_heartbeat: Mutex::new(None),
            home_amsl_m: Mutex::new(None),
            home_seen: AtomicBool::new(false),
            local_seen: AtomicBool::new(false),
            target_system: AtomicU8::new(1),
        }
    }

    fn ingest(&self, header: MavHeader, message: MavMessage) {
        match message {
            MavMessage::HEARTBEAT(heartbeat) => {
                if heartbeat.mavtype == MavType::MAV_TYPE_GCS {
                    return;
                }
                self.target_system.store(header.system_id, Ordering::Relaxed);
                *lock(&self.last_heartbeat) = Some(Instant::now());
                if !*self.connected.borrow() {
                    info!("[LINK] Heartbeat from system {}", header.system_id);
                    self.connected.send_replace(true);
                }
                let armed = heartbeat
                    .base_mode
                    .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                self.armed.send_replace(Some(armed));
                self.mode
                    .send_replace(Some(px4_flight_mode(heartbeat.custom_mode)));
            }
            MavMessage::LOCAL_POSITION_NED(local) => {
                self.local_seen.store(true, Ordering::Relaxed);
                self.ned.send_replace(Some(Ned::new(local.x, local.y, local.z)));
            }
            MavMessage::GLOBAL_POSITION_INT(global) => {
                let relative_m = global.relative_alt as f32 / 1000.0;
                let amsl_m = global.alt as f32 / 1000.0;
                *lock(&self.home_amsl_m) = Some(amsl_m - relative_m);
                self.altitude.send_replace(Some(relative_m));
            }
            MavMessage::HOME_POSITION(_) => {
                self.home_seen.store(true, Ordering::Relaxed);
            }
            MavMessage::EXTENDED_SYS_STATE(state) => {
                let in_air = matches!(
                    state.landed_state,
                    MavLandedState::MAV_LANDED_STATE_IN_AIR
                        | MavLandedState::MAV_LANDED_STATE_TAKEOFF
                        | MavLandedState::MAV_LANDED_STATE_LANDING
                );
                self.in_air.send_replace(Some(in_air));
            }
            MavMessage::SYS_STATUS(status) => {
                if status.battery_remaining >= 0 {
                    self.battery
                        .send_replace(Some(status.battery_remaining as f32));
                }
                self.health.send_replace(Some(self.health_from(&status)));
            }
            MavMessage::COMMAND_ACK(ack) => {
                let _ = self.acks.send((ack.command, ack.result));
            }
            _ => {}
        }
    }

    fn health_from(&self, status: &SYS_STATUS_DATA) -> Health {
        let present = status.onboard_control_sensors_present;
        let healthy = status.onboard_control_sensors_health;
        let ok = |sensor: MavSysStatusSensor| !present.contains(sensor) || healthy.contains(sensor);

        Health {
            gyrometer_calibration_ok: ok(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO),
            accelerometer_calibration_ok: ok(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL),
            magnetometer_calibration_ok: ok(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_MAG),
            local_position_ok: self.local_seen.load(Ordering::Relaxed),
            global_position_ok: present.contains(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_GPS)
                && healthy.contains(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_GPS),
            home_position_ok: self.home_seen.load(Ordering::Relaxed),
            armable: healthy.contains(MavSysStatusSensor::MAV_SYS_STATUS_PREARM_CHECK),
        }
    }

    fn heartbeat_silent(&self) -> bool {
        lock(&self.last_heartbeat).map_or(false, |at| at.elapsed() > HEARTBEAT_SILENCE)
    }
}

// ============================================================================
// MAVLink Autopilot
// ============================================================================

pub struct MavlinkAutopilot {
    cells: Arc<Cells>,
    link: Mutex<Option<Link>>,
    takeoff_altitude_m: Mutex<f32>,
    started: Instant,
}

impl MavlinkAutopilot {
    pub fn new() -> Self {
        Self {
            cells: Arc::new(Cells::new()),
            link: Mutex::new(None),
            takeoff_altitude_m: Mutex::new(2.5),
            started: Instant::now(),
        }
    }

    fn header() -> MavHeader {
        MavHeader {
            system_id: GCS_SYSTEM_ID,
            component_id: GCS_COMPONENT_ID,
            sequence: 0,
        }
    }

    fn send(&self, message: &MavMessage) -> CommandResult {
        let connection = lock(&self.link)
            .as_ref()
            .map(|link| link.connection.clone())
            .ok_or_else(|| Rejection::new(RejectCode::ConnectionError, "not connected"))?;
        connection
            .send(&Self::header(), message)
            .map(|_| ())
            .map_err(|e| Rejection::new(RejectCode::ConnectionError, e.to_string()))
    }

    async fn command_long(&self, command: MavCmd, params: [f32; 7]) -> CommandResult {
        let mut acks = self.cells.acks.subscribe();
        self.send(&MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
            command,
            target_system: self.cells.target_system.load(Ordering::Relaxed),
            target_component: 1,
            confirmation: 0,
        }))?;

        let acked = async {
            loop {
                match acks.recv().await {
                    Ok((acked, MavResult::MAV_RESULT_IN_PROGRESS)) if acked == command => continue,
                    Ok((acked, result)) if acked == command => return Some(result),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(ACK_TIMEOUT, acked).await {
            Ok(Some(MavResult::MAV_RESULT_ACCEPTED)) => Ok(()),
            Ok(Some(result)) => Err(rejection_for(result)),
            Ok(None) => Err(Rejection::new(RejectCode::ConnectionError, "link closed")),
            Err(_) => Err(Rejection::new(
                RejectCode::Timeout,
                format!("no ack for {:?}", command),
            )),
        }
    }

    fn spawn_reader(&self, connection: Connection, alive: Arc<AtomicBool>) -> Result<(), String> {
        let cells = self.cells.clone();
        thread::Builder::new()
            .name("mavlink-reader".to_string())
            .spawn(move || {
                while alive.load(Ordering::Relaxed) {
                    match connection.recv() {
                        Ok((header, message)) => cells.ingest(header, message),
                        Err(::mavlink::error::MessageReadError::Io(e))
                            if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(::mavlink::error::MessageReadError::Io(e)) => {
                            warn!("[LINK] Read failed: {}", e);
                            alive.store(false, Ordering::Relaxed);
                            cells.connected.send_replace(false);
                            break;
                        }
                        Err(e) => debug!("[LINK] Skipping undecodable message: {}", e),
                    }
                }
            })
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn spawn_heartbeat(&self, connection: Connection, alive: Arc<AtomicBool>) -> Result<(), String> {
        let cells = self.cells.clone();
        let heartbeat = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        thread::Builder::new()
            .name("mavlink-heartbeat".to_string())
            .spawn(move || {
                while alive.load(Ordering::Relaxed) {
                    if let Err(e) = connection.send(&Self::header(), &heartbeat) {
                        debug!("[LINK] Heartbeat send failed: {}", e);
                    }
                    if *cells.connected.borrow() && cells.heartbeat_silent() {
                        warn!(
                            "[LINK] No heartbeat for {}s, link lost",
                            HEARTBEAT_SILENCE.as_secs()
                        );
                        cells.connected.send_replace(false);
                    }
                    thread::sleep(HEARTBEAT_PERIOD);
                }
            })
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn watch<T>(&self, pick: impl FnOnce(&Cells) -> watch::Receiver<Option<T>>) -> TelemetryStream<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        Box::pin(WatchStream::new(pick(&self.cells)).filter_map(|sample| sample))
    }
}

impl Default for MavlinkAutopilot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MavlinkAutopilot {
    fn drop(&mut self) {
        if let Some(link) = lock(&self.link).take() {
            link.close();
        }
    }
}

#[async_trait]
impl Autopilot for MavlinkAutopilot {
    async fn connect(&self, address: &str) -> Result<(), String> {
        {
            let mut link = lock(&self.link);
            if link.as_ref().map_or(false, Link::is_alive) {
                return Ok(());
            }
            if link.take().is_some() {
                info!("[LINK] Previous connection closed, reopening");
            }
        }
        let target = connection_string(address)?;
        info!("[LINK] Opening {}", target);

        let connection = tokio::task::spawn_blocking(move || ::mavlink::connect::<MavMessage>(&target))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        let connection: Connection = Arc::new(connection);

        let alive = Arc::new(AtomicBool::new(true));
        let link = Link {
            connection: connection.clone(),
            alive: alive.clone(),
        };
        if let Err(e) = self
            .spawn_reader(connection.clone(), alive.clone())
            .and_then(|_| self.spawn_heartbeat(connection, alive))
        {
            link.close();
            return Err(e);
        }
        *lock(&self.link) = Some(link);
        Ok(())
    }

    fn connection_state(&self) -> TelemetryStream<bool> {
        Box::pin(WatchStream::new(self.cells.connected.subscribe()))
    }

    fn position_velocity_ned(&self) -> Option<TelemetryStream<Ned>> {
        Some(self.watch(|cells| cells.ned.subscribe()))
    }

    fn position(&self) -> TelemetryStream<f32> {
        self.watch(|cells| cells.altitude.subscribe())
    }

    fn armed(&self) -> TelemetryStream<bool> {
        self.watch(|cells| cells.armed.subscribe())
    }

    fn in_air(&self) -> TelemetryStream<bool> {
        self.watch(|cells| cells.in_air.subscribe())
    }

    fn flight_mode(&self) -> TelemetryStream<FlightMode> {
        self.watch(|cells| cells.mode.subscribe())
    }

    fn battery(&self) -> TelemetryStream<f32> {
        self.watch(|cells| cells.battery.subscribe())
    }

    fn health(&self) -> TelemetryStream<Health> {
        self.watch(|cells| cells.health.subscribe())
    }

    async fn arm(&self) -> CommandResult {
        self.command_long(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn set_takeoff_altitude(&self, altitude_m: f32) -> CommandResult {
        *lock(&self.takeoff_altitude_m) = altitude_m;
        Ok(())
    }

    async fn takeoff(&self) -> CommandResult {
        let altitude_m = *lock(&self.takeoff_altitude_m);
        let amsl = match *lock(&self.cells.home_amsl_m) {
            Some(home) => home + altitude_m,
            None => {
                warn!("[LINK] Home altitude unknown, PX4 uses its default takeoff altitude");
                f32::NAN
            }
        };
        self.command_long(
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, amsl],
        )
        .await
    }

    async fn land(&self) -> CommandResult {
        self.command_long(
            MavCmd::MAV_CMD_NAV_LAND,
            [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN],
        )
        .await
    }

    async fn kill(&self) -> CommandResult {
        self.command_long(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [0.0, FORCE_DISARM, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn set_position_ned(&self, setpoint: PositionNedYaw) -> CommandResult {
        let ignore = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;

        self.send(&MavMessage::SET_POSITION_TARGET_LOCAL_NED(
            SET_POSITION_TARGET_LOCAL_NED_DATA {
                time_boot_ms: self.started.elapsed().as_millis() as u32,
                x: setpoint.position.north,
                y: setpoint.position.east,
                z: setpoint.position.down,
                vx: 0.0,
                vy: 0.0,
                vz: 0.0,
                afx: 0.0,
                afy: 0.0,
                afz: 0.0,
                yaw: setpoint.yaw_deg.to_radians(),
                yaw_rate: 0.0,
                type_mask: ignore,
                target_system: self.cells.target_system.load(Ordering::Relaxed),
                target_component: 1,
                coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            },
        ))
    }

    async fn start_offboard(&self) -> CommandResult {
        let custom = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            [custom, PX4_MAIN_MODE_OFFBOARD, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn stop_offboard(&self) -> CommandResult {
        let custom = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            [custom, PX4_MAIN_MODE_AUTO, PX4_AUTO_LOITER, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }
}
