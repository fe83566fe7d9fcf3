//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (optional; missing sections and keys fall back to defaults)
//! 2. environment variables prefixed with `POLAR_DAQ_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! POLAR_DAQ_OBSERVATION__VELOCITY=-45
//! POLAR_DAQ_CAMERA__TARGET_TEMPERATURE=0.0
//! POLAR_DAQ_PROCESS__ROLE=slave
//! POLAR_DAQ_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use polar_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/polar_daq.toml")?;
//! let plan = settings.plan()?;
//! println!("{} frames, {}", plan.total_images, plan.direction);
//! # Ok::<(), polar_daq::error::DaqError>(())
//! ```

use crate::data::metadata::ExposureKind;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::plan::AcquisitionPlan;
use crate::sync::Role;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shortest exposure accepted in the settings, seconds.
pub const MIN_EXPOSURE: f64 = 0.00001;
/// Longest exposure accepted in the settings, seconds.
pub const MAX_EXPOSURE: f64 = 30.0;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// What to observe.
    #[serde(default)]
    pub observation: ObservationConfig,
    /// Camera readout and cooling.
    #[serde(default)]
    pub camera: CameraConfig,
    /// Rotation stage link and trigger output.
    #[serde(default)]
    pub rotator: RotatorConfig,
    /// Role of this process and the sync channel.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Bounded waits and retry counts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Frame output.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Marker for `exposure = "auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoExposure {
    /// Fill the trigger interval.
    Auto,
}

/// Exposure time: a fixed number of seconds or `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExposureSetting {
    /// Fixed exposure in seconds.
    Seconds(f64),
    /// Derived from the trigger interval and readout time.
    Auto(AutoExposure),
}

impl Default for ExposureSetting {
    fn default() -> Self {
        Self::Auto(AutoExposure::Auto)
    }
}

/// Observation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Exposure time.
    #[serde(default)]
    pub exposure: ExposureSetting,
    /// Exposure used when `auto` cannot be resolved, seconds.
    #[serde(default = "default_fallback_exposure")]
    pub fallback_exposure: f64,
    /// Frame type, drives file naming and bias handling.
    #[serde(default)]
    pub kind: ExposureKind,
    /// Frames per rotation: 8 or 16.
    #[serde(default = "default_images_per_cycle")]
    pub images_per_cycle: usize,
    /// Number of rotations.
    #[serde(default = "default_cycles")]
    pub cycles: usize,
    /// Signed rotator velocity, degrees per second. 0 selects static mode.
    #[serde(default = "default_velocity")]
    pub velocity: f64,
    /// Observe at this single angle instead of rotating.
    #[serde(default)]
    pub fixed_angle: Option<f64>,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            exposure: ExposureSetting::default(),
            fallback_exposure: default_fallback_exposure(),
            kind: ExposureKind::default(),
            images_per_cycle: default_images_per_cycle(),
            cycles: default_cycles(),
            velocity: default_velocity(),
            fixed_angle: None,
        }
    }
}

/// AOI binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Binning {
    /// Full resolution.
    #[default]
    #[serde(rename = "1x1")]
    X1,
    /// 2x2.
    #[serde(rename = "2x2")]
    X2,
    /// 3x3.
    #[serde(rename = "3x3")]
    X3,
    /// 4x4.
    #[serde(rename = "4x4")]
    X4,
    /// 8x8.
    #[serde(rename = "8x8")]
    X8,
}

impl Binning {
    /// Pixels combined along each axis.
    pub fn factor(self) -> i64 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X3 => 3,
            Self::X4 => 4,
            Self::X8 => 8,
        }
    }

    /// Library enumeration string.
    pub fn as_feature_value(self) -> &'static str {
        match self {
            Self::X1 => "1x1",
            Self::X2 => "2x2",
            Self::X3 => "3x3",
            Self::X4 => "4x4",
            Self::X8 => "8x8",
        }
    }
}

/// Pixel readout rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadoutRate {
    /// 100 MHz, lower noise.
    #[default]
    #[serde(rename = "100")]
    Mhz100,
    /// 270 MHz, faster readout.
    #[serde(rename = "270")]
    Mhz270,
}

impl ReadoutRate {
    /// Library enumeration string.
    pub fn as_feature_value(self) -> &'static str {
        match self {
            Self::Mhz100 => "100 MHz",
            Self::Mhz270 => "270 MHz",
        }
    }
}

/// Pre-amplifier gain mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AmplifierMode {
    /// 16-bit, low noise and high well capacity.
    #[default]
    #[serde(rename = "16L")]
    Bit16LowNoise,
    /// 12-bit, low noise.
    #[serde(rename = "12L")]
    Bit12LowNoise,
    /// 12-bit, high well capacity.
    #[serde(rename = "12H")]
    Bit12HighWell,
}

impl AmplifierMode {
    /// Library enumeration string.
    pub fn as_feature_value(self) -> &'static str {
        match self {
            Self::Bit16LowNoise => "16-bit (low noise & high well capacity)",
            Self::Bit12LowNoise => "12-bit (low noise)",
            Self::Bit12HighWell => "12-bit (high well capacity)",
        }
    }
}

/// Transfer pixel encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelEncoding {
    /// 12 bits in 16-bit words.
    #[serde(rename = "12")]
    Mono12,
    /// 12 bits packed, 1.5 bytes per pixel.
    #[serde(rename = "12PACK")]
    Mono12Packed,
    /// 16 bits.
    #[default]
    #[serde(rename = "16")]
    Mono16,
}

impl PixelEncoding {
    /// Library enumeration string.
    pub fn as_feature_value(self) -> &'static str {
        match self {
            Self::Mono12 => "Mono12",
            Self::Mono12Packed => "Mono12Packed",
            Self::Mono16 => "Mono16",
        }
    }
}

/// Rolling shutter read direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadDirection {
    /// Bottom up, sequential.
    BuSeq,
    /// Bottom up, simultaneous.
    BuSim,
    /// Centre out, simultaneous.
    CoSim,
    /// Outside in, simultaneous.
    #[default]
    OiSim,
    /// Top down, sequential.
    TdSeq,
    /// Top down, simultaneous.
    TdSim,
}

impl ReadDirection {
    /// Library enumeration string.
    pub fn as_feature_value(self) -> &'static str {
        match self {
            Self::BuSeq => "Bottom Up Sequential",
            Self::BuSim => "Bottom Up Simultaneous",
            Self::CoSim => "Centre Out Simultaneous",
            Self::OiSim => "Outside In Simultaneous",
            Self::TdSeq => "Top Down Sequential",
            Self::TdSim => "Top Down Simultaneous",
        }
    }
}

/// Camera settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Cooling target, degrees Celsius.
    #[serde(default = "default_target_temperature")]
    pub target_temperature: f64,
    /// Skip waiting for the `Stabilised` status and only wait for the target.
    #[serde(default = "default_true")]
    pub quick_start: bool,
    /// AOI binning.
    #[serde(default)]
    pub binning: Binning,
    /// Pixel readout rate.
    #[serde(default)]
    pub readout_rate: ReadoutRate,
    /// Pre-amplifier gain mode.
    #[serde(default)]
    pub amplifier: AmplifierMode,
    /// Transfer encoding.
    #[serde(default)]
    pub encoding: PixelEncoding,
    /// Rolling shutter read direction.
    #[serde(default)]
    pub read_direction: ReadDirection,
    /// Serial numbers expected at each camera index; a mismatch is logged.
    #[serde(default)]
    pub expected_serials: Vec<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            target_temperature: default_target_temperature(),
            quick_start: true,
            binning: Binning::default(),
            readout_rate: ReadoutRate::default(),
            amplifier: AmplifierMode::default(),
            encoding: PixelEncoding::default(),
            read_direction: ReadDirection::default(),
            expected_serials: Vec::new(),
        }
    }
}

/// Rotation stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotatorConfig {
    /// Serial device.
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Trigger output active high.
    #[serde(default = "default_true")]
    pub trigger_active_high: bool,
    /// On-target tolerance, degrees.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Reply timeout for one query, milliseconds.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            trigger_active_high: true,
            tolerance: default_tolerance(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

/// Sync channel implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncBackend {
    /// File-backed shared memory, for separate processes.
    #[default]
    SharedMemory,
    /// Named semaphores, for tasks in one process.
    Semaphore,
}

/// Process role and sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Master drives the rotator, slave follows.
    #[serde(default = "default_role")]
    pub role: Role,
    /// Run one camera without a peer process.
    #[serde(default)]
    pub single_camera: bool,
    /// Camera USB index; defaults to 0 for the master and 1 for the slave.
    #[serde(default)]
    pub camera_index: Option<usize>,
    /// Sync channel implementation.
    #[serde(default)]
    pub sync_backend: SyncBackend,
    /// Shared memory file or semaphore namespace.
    #[serde(default = "default_sync_name")]
    pub sync_name: String,
    /// Directory holding the shared memory file.
    #[serde(default = "default_sync_dir")]
    pub sync_dir: PathBuf,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            single_camera: false,
            camera_index: None,
            sync_backend: SyncBackend::default(),
            sync_name: default_sync_name(),
            sync_dir: default_sync_dir(),
        }
    }
}

impl ProcessConfig {
    /// Camera index used by this process.
    pub fn camera_index(&self) -> usize {
        self.camera_index.unwrap_or(self.role.index())
    }

    /// Whether this process waits for and signals a peer.
    pub fn paired(&self) -> bool {
        !self.single_camera
    }

    /// Role actually played: a single camera always acts as master.
    pub fn effective_role(&self) -> Role {
        if self.single_camera {
            Role::Master
        } else {
            self.role
        }
    }
}

/// Bounded waits and retry counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Rotator moves and the start signal, seconds.
    #[serde(default = "default_rotate_secs")]
    pub rotate_secs: f64,
    /// Temperature stabilisation and the peer's ready signal, seconds.
    #[serde(default = "default_stable_secs")]
    pub stable_secs: f64,
    /// Static-mode trigger signal, seconds.
    #[serde(default = "default_trigger_secs")]
    pub trigger_secs: f64,
    /// Margin on top of the exposure when waiting for a frame, milliseconds.
    #[serde(default = "default_transfer_ms")]
    pub transfer_ms: u64,
    /// Attempts per camera library call.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between camera library attempts, milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Attempts to open the rotator link.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rotate_secs: default_rotate_secs(),
            stable_secs: default_stable_secs(),
            trigger_secs: default_trigger_secs(),
            transfer_ms: default_transfer_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

impl TimeoutConfig {
    /// Rotator move budget.
    pub fn rotate(&self) -> Duration {
        Duration::from_secs_f64(self.rotate_secs)
    }

    /// Stabilisation budget.
    pub fn stable(&self) -> Duration {
        Duration::from_secs_f64(self.stable_secs)
    }

    /// Static trigger budget.
    pub fn trigger(&self) -> Duration {
        Duration::from_secs_f64(self.trigger_secs)
    }

    /// Frame transfer margin.
    pub fn transfer(&self) -> Duration {
        Duration::from_millis(self.transfer_ms)
    }

    /// Retry policy for camera library calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            backoff_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    /// Retry policy for opening the rotator link.
    pub fn connection_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts,
            ..RetryPolicy::connection()
        }
    }
}

/// Frame output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for frame files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Write frames to disk; when false frames are only logged.
    #[serde(default = "default_true")]
    pub write_frames: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            write_frames: true,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_fallback_exposure() -> f64 {
    0.45
}

fn default_images_per_cycle() -> usize {
    16
}

fn default_cycles() -> usize {
    3
}

fn default_velocity() -> f64 {
    45.0
}

fn default_target_temperature() -> f64 {
    4.0
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_tolerance() -> f64 {
    0.004
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_role() -> Role {
    Role::Master
}

fn default_sync_name() -> String {
    "polar_daq_sync".to_string()
}

fn default_sync_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_rotate_secs() -> f64 {
    30.0
}

fn default_stable_secs() -> f64 {
    60.0
}

fn default_trigger_secs() -> f64 {
    45.0
}

fn default_transfer_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Figment layering the TOML file at `path` under `POLAR_DAQ_` variables.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("POLAR_DAQ_").split("__"))
    }

    /// Load settings from a file and the environment, then validate them.
    ///
    /// A missing file is not an error; every value has a default.
    ///
    /// # Errors
    /// - [`DaqError::Config`] if a value has the wrong type.
    /// - [`DaqError::Configuration`] if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(Self::figment(path))
    }

    /// Extract and validate settings from an arbitrary figment.
    ///
    /// # Errors
    /// Same as [`Settings::load_from`].
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values that deserialize fine but cannot be run.
    ///
    /// # Errors
    /// Returns [`DaqError::Configuration`] with a descriptive message.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let exposures = [
            match self.observation.exposure {
                ExposureSetting::Seconds(s) => Some(("exposure", s)),
                ExposureSetting::Auto(_) => None,
            },
            Some(("fallback_exposure", self.observation.fallback_exposure)),
        ];
        for (name, seconds) in exposures.into_iter().flatten() {
            if !(MIN_EXPOSURE..=MAX_EXPOSURE).contains(&seconds) {
                return invalid(format!(
                    "{name} {seconds}s outside {MIN_EXPOSURE}-{MAX_EXPOSURE}s"
                ));
            }
        }

        if let Some(angle) = self.observation.fixed_angle {
            if !angle.is_finite() {
                return invalid(format!("fixed angle must be finite, got {angle}"));
            }
        }

        if !(self.rotator.tolerance > 0.0 && self.rotator.tolerance < 1.0) {
            return invalid(format!(
                "rotator tolerance {} must be between 0 and 1 degree",
                self.rotator.tolerance
            ));
        }

        let t = &self.timeouts;
        for (name, secs) in [
            ("rotate_secs", t.rotate_secs),
            ("stable_secs", t.stable_secs),
            ("trigger_secs", t.trigger_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return invalid(format!("timeout {name} must be positive, got {secs}"));
            }
        }
        if t.retry_attempts == 0 || t.connect_attempts == 0 {
            return invalid("retry and connect attempts must be at least 1".to_string());
        }

        if self.process.sync_name.trim().is_empty() {
            return invalid("sync_name must not be empty".to_string());
        }
        if self.process.camera_index() > 1 {
            return invalid(format!(
                "camera index {} not supported, use 0 or 1",
                self.process.camera_index()
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        self.plan().map(|_| ())
    }

    /// Acquisition plan for these settings.
    ///
    /// # Errors
    /// Returns [`DaqError::Configuration`] for an unsupported frame count.
    pub fn plan(&self) -> AppResult<AcquisitionPlan> {
        AcquisitionPlan::from_observation(&self.observation, self.rotator.tolerance)
    }

    /// Serial number expected for the camera at `index`, if configured.
    pub fn expected_serial(&self, index: usize) -> Option<&str> {
        self.camera
            .expected_serials
            .get(index)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Serialized;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.observation.exposure, ExposureSetting::Auto(AutoExposure::Auto));
        assert_eq!(settings.process.camera_index(), 0);
        assert_eq!(settings.timeouts.transfer(), Duration::from_secs(30));
        assert_eq!(settings.plan().unwrap().total_images, 48);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[observation]
exposure = 0.2
kind = "bias"
images_per_cycle = 8
cycles = 2
velocity = -30.0

[camera]
binning = "2x2"
readout_rate = "270"
amplifier = "12H"
read_direction = "TDSIM"
expected_serials = ["VSC-04181", "VSC-04190"]

[process]
role = "slave"
sync_backend = "semaphore"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.observation.exposure, ExposureSetting::Seconds(0.2));
        assert_eq!(settings.observation.kind, ExposureKind::Bias);
        assert_eq!(settings.camera.binning.factor(), 2);
        assert_eq!(settings.camera.readout_rate.as_feature_value(), "270 MHz");
        assert_eq!(
            settings.camera.amplifier.as_feature_value(),
            "12-bit (high well capacity)"
        );
        assert_eq!(
            settings.camera.read_direction.as_feature_value(),
            "Top Down Simultaneous"
        );
        assert_eq!(settings.process.role, Role::Slave);
        assert_eq!(settings.process.camera_index(), 1);
        assert_eq!(settings.expected_serial(1), Some("VSC-04190"));
        assert_eq!(settings.process.sync_backend, SyncBackend::Semaphore);
        // untouched sections keep their defaults
        assert_eq!(settings.rotator.baud_rate, 115_200);

        let plan = settings.plan().unwrap();
        assert_eq!(plan.total_images, 16);
        assert_eq!(plan.step, -45.0);
    }

    #[test]
    fn test_auto_exposure_parses() {
        let settings = Settings::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::string("[observation]\nexposure = \"auto\"")),
        )
        .unwrap();
        assert_eq!(settings.observation.exposure, ExposureSetting::Auto(AutoExposure::Auto));
    }

    #[test]
    fn test_wrong_type_is_a_load_error() {
        let result = Settings::from_figment(
            Figment::new().merge(Toml::string("[observation]\ncycles = \"many\"")),
        );
        assert!(matches!(result, Err(DaqError::Config(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut settings = Settings::default();
        settings.observation.exposure = ExposureSetting::Seconds(31.0);
        assert!(matches!(settings.validate(), Err(DaqError::Configuration(_))));

        let mut settings = Settings::default();
        settings.observation.images_per_cycle = 32;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.level = "verbose".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));

        let mut settings = Settings::default();
        settings.timeouts.retry_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_single_camera_acts_as_master() {
        let process = ProcessConfig {
            role: Role::Slave,
            single_camera: true,
            ..ProcessConfig::default()
        };
        assert_eq!(process.effective_role(), Role::Master);
        assert!(!process.paired());
        assert_eq!(process.camera_index(), 1);
    }
}
