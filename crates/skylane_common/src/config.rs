//! Configuration for skylaned.
//!
//! Loads settings from /etc/skylane/config.toml or uses defaults. Every field
//! has a default so a partial file is always valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/skylane/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/skylane/config.toml";

/// PX4 refuses offboard mode unless setpoints were streamed at least this long.
pub const MIN_PRE_STREAM_MS: u64 = 2_000;

/// Autopilot link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Connection string, e.g. `udp://:14540` or `tcp://192.168.56.101:5760`
    #[serde(default = "default_address")]
    pub address: String,

    /// How long to wait for the first "connected" event
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_address() -> String {
    "udp://:14540".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Offboard setpoint streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffboardConfig {
    /// Setpoint cadence (200ms = 5 Hz)
    #[serde(default = "default_setpoint_period")]
    pub setpoint_period_ms: u64,

    /// Dwell time of the pre-stream before requesting offboard mode
    #[serde(default = "default_pre_stream")]
    pub pre_stream_ms: u64,
}

fn default_setpoint_period() -> u64 {
    200
}

fn default_pre_stream() -> u64 {
    MIN_PRE_STREAM_MS
}

impl Default for OffboardConfig {
    fn default() -> Self {
        Self {
            setpoint_period_ms: default_setpoint_period(),
            pre_stream_ms: default_pre_stream(),
        }
    }
}

impl OffboardConfig {
    pub fn setpoint_period(&self) -> Duration {
        Duration::from_millis(self.setpoint_period_ms)
    }

    pub fn pre_stream(&self) -> Duration {
        Duration::from_millis(self.pre_stream_ms)
    }

    /// Number of pre-stream setpoints (10 at the defaults).
    pub fn pre_stream_samples(&self) -> u64 {
        if self.setpoint_period_ms == 0 {
            return 0;
        }
        self.pre_stream_ms.div_ceil(self.setpoint_period_ms)
    }
}

/// Takeoff monitoring
///
/// The settle parameters accept an altitude short of the target once it has
/// stopped changing. They are empirical and still need calibration per airframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoffConfig {
    #[serde(default = "default_takeoff_altitude")]
    pub default_altitude_m: f32,

    /// Reached once altitude >= target - tolerance
    #[serde(default = "default_reach_tolerance")]
    pub reach_tolerance_m: f32,

    /// Minimum fraction of the target for a settled altitude to count
    #[serde(default = "default_settle_ratio")]
    pub settle_ratio: f32,

    /// Maximum change between consecutive samples to count as stable
    #[serde(default = "default_settle_jitter")]
    pub settle_jitter_m: f32,

    /// Consecutive stable samples required
    #[serde(default = "default_settle_samples")]
    pub settle_samples: u32,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_takeoff_timeout")]
    pub timeout_secs: u64,
}

fn default_takeoff_altitude() -> f32 {
    2.0
}

fn default_reach_tolerance() -> f32 {
    0.3
}

fn default_settle_ratio() -> f32 {
    0.8
}

fn default_settle_jitter() -> f32 {
    0.05
}

fn default_settle_samples() -> u32 {
    20
}

fn default_sample_interval() -> u64 {
    100
}

fn default_takeoff_timeout() -> u64 {
    60
}

impl Default for TakeoffConfig {
    fn default() -> Self {
        Self {
            default_altitude_m: default_takeoff_altitude(),
            reach_tolerance_m: default_reach_tolerance(),
            settle_ratio: default_settle_ratio(),
            settle_jitter_m: default_settle_jitter(),
            settle_samples: default_settle_samples(),
            sample_interval_ms: default_sample_interval(),
            timeout_secs: default_takeoff_timeout(),
        }
    }
}

impl TakeoffConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Waypoint arrival policy defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationConfig {
    #[serde(default = "default_arrival_threshold")]
    pub arrival_threshold_m: f32,

    #[serde(default = "default_navigation_timeout")]
    pub timeout_secs: u64,

    /// Hold between consecutive route waypoints
    #[serde(default = "default_settle_pause")]
    pub settle_pause_ms: u64,
}

fn default_arrival_threshold() -> f32 {
    crate::waypoint::DEFAULT_ARRIVAL_THRESHOLD_M
}

fn default_navigation_timeout() -> u64 {
    30
}

fn default_settle_pause() -> u64 {
    2_000
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            arrival_threshold_m: default_arrival_threshold(),
            timeout_secs: default_navigation_timeout(),
            settle_pause_ms: default_settle_pause(),
        }
    }
}

impl NavigationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle_pause(&self) -> Duration {
        Duration::from_millis(self.settle_pause_ms)
    }

    /// A waypoint carrying this arrival policy.
    pub fn waypoint(&self, north: f32, east: f32, altitude: f32) -> crate::waypoint::Waypoint {
        crate::waypoint::Waypoint::new(north, east, altitude)
            .with_threshold(self.arrival_threshold_m)
            .with_timeout(self.timeout())
    }
}

/// Arming waits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmingConfig {
    /// Wait for the armed flag after the arm command is accepted
    #[serde(default = "default_arm_confirm_timeout")]
    pub confirm_timeout_secs: u64,

    #[serde(default = "default_armable_timeout")]
    pub armable_timeout_secs: u64,

    #[serde(default = "default_armable_poll")]
    pub armable_poll_secs: u64,
}

fn default_arm_confirm_timeout() -> u64 {
    10
}

fn default_armable_timeout() -> u64 {
    30
}

fn default_armable_poll() -> u64 {
    3
}

impl Default for ArmingConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: default_arm_confirm_timeout(),
            armable_timeout_secs: default_armable_timeout(),
            armable_poll_secs: default_armable_poll(),
        }
    }
}

impl ArmingConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn armable_timeout(&self) -> Duration {
        Duration::from_secs(self.armable_timeout_secs)
    }

    pub fn armable_poll(&self) -> Duration {
        Duration::from_secs(self.armable_poll_secs)
    }
}

/// Landing wait
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingConfig {
    #[serde(default = "default_landing_timeout")]
    pub timeout_secs: u64,
}

fn default_landing_timeout() -> u64 {
    60
}

impl Default for LandingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_landing_timeout(),
        }
    }
}

impl LandingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Background execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Bound of the command queue between the facade and the core
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    16
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkylaneConfig {
    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub offboard: OffboardConfig,

    #[serde(default)]
    pub takeoff: TakeoffConfig,

    #[serde(default)]
    pub navigation: NavigationConfig,

    #[serde(default)]
    pub arming: ArmingConfig,

    #[serde(default)]
    pub landing: LandingConfig,

    #[serde(default)]
    pub core: CoreConfig,
}

impl SkylaneConfig {
    /// Load config from the system paths, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path(Path::new(CONFIG_PATH))
            .or_else(|_| Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH)))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                SkylaneConfig::default()
            })
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: SkylaneConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject settings the autopilot or the core cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.offboard.setpoint_period_ms == 0 {
            bail!("offboard.setpoint_period_ms must be greater than zero");
        }
        if self.offboard.pre_stream_ms < MIN_PRE_STREAM_MS {
            bail!(
                "offboard.pre_stream_ms must be at least {} (got {})",
                MIN_PRE_STREAM_MS,
                self.offboard.pre_stream_ms
            );
        }
        if !(self.takeoff.settle_ratio > 0.0 && self.takeoff.settle_ratio <= 1.0) {
            bail!(
                "takeoff.settle_ratio must be in (0, 1] (got {})",
                self.takeoff.settle_ratio
            );
        }
        if self.takeoff.sample_interval_ms == 0 {
            bail!("takeoff.sample_interval_ms must be greater than zero");
        }
        if self.core.queue_capacity == 0 {
            bail!("core.queue_capacity must be greater than zero");
        }
        Ok(())
    }
}
