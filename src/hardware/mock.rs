//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep)
//! and `tokio::time::Instant`, so tests on a paused clock run instantly and
//! deterministically.
//!
//! # Available Mocks
//!
//! - `MockCameraSdk` - Simulated sCMOS camera library with cooling, buffer queue,
//!   software/external triggering, metadata timestamps and failure injection
//! - `MockGcsLink` - Simulated PI rotation stage speaking the GCS command set, with
//!   time-based motion at the commanded velocity
//!
//! Both mocks are cheap to clone; clones share state, so a test can keep a handle
//! for inspection after moving the device into a controller.

use crate::data::buffer_pool::BufferPool;
use crate::hardware::andor::{feature, AT_ERR_TIMEDOUT};
use crate::hardware::capabilities::{CameraSdk, GcsLink};
use crate::hardware::operation::{HardwareOperation, OpValue};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

const AT_ERR_NOTIMPLEMENTED: i32 = 2;
const AT_ERR_OUTOFRANGE: i32 = 6;
const AT_ERR_INDEXNOTAVAILABLE: i32 = 7;
const AT_ERR_INVALIDHANDLE: i32 = 12;
const AT_ERR_INVALIDSIZE: i32 = 15;

/// Metadata bytes appended after the pixels: three (data, id, length) fields.
pub const MOCK_TRAILER_LEN: usize = 8 + (8 + 8) + (8 + 8);

const TEMPERATURE_STATUSES: [&str; 6] = [
    "Cooler Off",
    "Stabilised",
    "Cooling",
    "Drift",
    "Not Stabilised",
    "Fault",
];

// =============================================================================
// MockCameraSdk - Simulated camera library
// =============================================================================

#[derive(Debug)]
struct CameraState {
    open: bool,
    serial: String,
    sensor: (i64, i64),
    bytes_per_pixel: f64,
    readout_time: f64,
    clock_hz: i64,
    exposure: f64,
    exposure_range: (f64, f64),
    bools: HashMap<&'static str, bool>,
    enums: HashMap<&'static str, String>,
    temperature: f64,
    cooling_floor: f64,
    cooling_step: f64,
    acquiring: bool,
    clock_epoch: Instant,
    queue: VecDeque<usize>,
    queue_history: Vec<usize>,
    software_triggers: usize,
    trigger_interval: Option<Duration>,
    stall_after: Option<usize>,
    frames_delivered: usize,
    failures_left: usize,
    failure_code: i32,
    calls: HashMap<String, usize>,
    total_calls: usize,
    commands: Vec<String>,
}

impl CameraState {
    fn binning(&self) -> i64 {
        self.enums
            .get(feature::AOI_BINNING)
            .and_then(|b| b.split('x').next())
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(1)
    }

    fn pixel_bytes(&self) -> usize {
        let bin = self.binning().max(1);
        let pixels = (self.sensor.0 / bin) * (self.sensor.1 / bin);
        (pixels as f64 * self.bytes_per_pixel).ceil() as usize
    }

    fn image_size(&self) -> usize {
        self.pixel_bytes() + MOCK_TRAILER_LEN
    }

    fn trigger_mode(&self) -> &str {
        self.enums
            .get(feature::TRIGGER_MODE)
            .map(String::as_str)
            .unwrap_or("Internal")
    }

    fn is_stabilised(&self) -> bool {
        self.temperature <= self.cooling_floor
    }

    /// Delay until the next frame lands, or `None` if it never will.
    fn next_delivery(&mut self) -> Option<Duration> {
        if !self.acquiring || self.queue.is_empty() {
            return None;
        }
        if self.stall_after.is_some_and(|n| self.frames_delivered >= n) {
            return None;
        }
        let exposure = Duration::from_secs_f64(self.exposure);
        if self.trigger_mode() == "Software" {
            if self.software_triggers == 0 {
                return None;
            }
            self.software_triggers -= 1;
            return Some(exposure);
        }
        Some(
            self.trigger_interval
                .unwrap_or_else(|| exposure + Duration::from_secs_f64(self.readout_time)),
        )
    }

    fn fill(&mut self, pool: &mut BufferPool) -> Result<usize, i32> {
        let slot = self.queue.pop_front().ok_or(AT_ERR_TIMEDOUT)?;
        let pixel_bytes = self.pixel_bytes();
        let ticks = (self.clock_epoch.elapsed().as_secs_f64() * self.clock_hz as f64) as u64;
        let frame = self.frames_delivered as u64;
        let buf = pool.slot_mut(slot).ok_or(AT_ERR_INVALIDSIZE)?;
        if buf.len() < pixel_bytes + MOCK_TRAILER_LEN {
            return Err(AT_ERR_INVALIDSIZE);
        }
        buf[..8.min(pixel_bytes)].copy_from_slice(&frame.to_le_bytes()[..8.min(pixel_bytes)]);

        // [pixels][id 0][len][ticks][id 1][len][frame info][id 7][len]
        let mut at = pixel_bytes;
        let mut put = |bytes: &[u8]| {
            buf[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&0u32.to_le_bytes());
        put(&(pixel_bytes as u32 + 4).to_le_bytes());
        put(&ticks.to_le_bytes());
        put(&1u32.to_le_bytes());
        put(&12u32.to_le_bytes());
        put(&frame.to_le_bytes());
        put(&7u32.to_le_bytes());
        put(&12u32.to_le_bytes());

        self.frames_delivered += 1;
        Ok(slot)
    }

    fn apply(&mut self, op: &HardwareOperation) -> Result<OpValue, i32> {
        if !self.open && !matches!(op, HardwareOperation::Open { .. }) {
            return Err(AT_ERR_INVALIDHANDLE);
        }
        match op {
            HardwareOperation::Open { .. } => {
                self.open = true;
                Ok(OpValue::Unit)
            }
            HardwareOperation::SetBool { feature: name, value } => {
                self.bools.insert(*name, *value);
                Ok(OpValue::Unit)
            }
            HardwareOperation::SetEnumString { feature: name, value } => {
                self.enums.insert(*name, value.clone());
                Ok(OpValue::Unit)
            }
            HardwareOperation::SetFloat { feature: name, value } => {
                if *name != feature::EXPOSURE_TIME {
                    return Err(AT_ERR_NOTIMPLEMENTED);
                }
                let (min, max) = self.exposure_range;
                if !(min..=max).contains(value) {
                    return Err(AT_ERR_OUTOFRANGE);
                }
                self.exposure = *value;
                Ok(OpValue::Unit)
            }
            HardwareOperation::GetBool(name) => Ok(OpValue::Bool(match *name {
                feature::CAMERA_ACQUIRING => self.acquiring,
                feature::FULL_AOI_CONTROL => true,
                other => self.bools.get(other).copied().unwrap_or(false),
            })),
            HardwareOperation::GetString(name) => match *name {
                feature::SERIAL_NUMBER => Ok(OpValue::Text(self.serial.clone())),
                feature::FIRMWARE_VERSION => Ok(OpValue::Text("11.7.30.0".into())),
                _ => Err(AT_ERR_NOTIMPLEMENTED),
            },
            HardwareOperation::GetFloat(name) => match *name {
                feature::EXPOSURE_TIME => Ok(OpValue::Float(self.exposure)),
                feature::READOUT_TIME => Ok(OpValue::Float(self.readout_time)),
                feature::BYTES_PER_PIXEL => Ok(OpValue::Float(self.bytes_per_pixel)),
                feature::PIXEL_WIDTH | feature::PIXEL_HEIGHT => Ok(OpValue::Float(6.5)),
                feature::SENSOR_TEMPERATURE => {
                    self.temperature = (self.temperature - self.cooling_step).max(self.cooling_floor);
                    Ok(OpValue::Float(self.temperature))
                }
                _ => Err(AT_ERR_NOTIMPLEMENTED),
            },
            HardwareOperation::GetInt(name) => match *name {
                feature::SENSOR_WIDTH => Ok(OpValue::Int(self.sensor.0)),
                feature::SENSOR_HEIGHT => Ok(OpValue::Int(self.sensor.1)),
                feature::CLOCK_FREQUENCY => Ok(OpValue::Int(self.clock_hz)),
                feature::IMAGE_SIZE_BYTES => Ok(OpValue::Int(self.image_size() as i64)),
                _ => Err(AT_ERR_NOTIMPLEMENTED),
            },
            HardwareOperation::GetFloatMin(feature::EXPOSURE_TIME) => {
                Ok(OpValue::Float(self.exposure_range.0))
            }
            HardwareOperation::GetFloatMax(feature::EXPOSURE_TIME) => {
                Ok(OpValue::Float(self.exposure_range.1))
            }
            HardwareOperation::GetFloatMin(_) | HardwareOperation::GetFloatMax(_) => {
                Err(AT_ERR_NOTIMPLEMENTED)
            }
            HardwareOperation::GetEnumIndex(name) => match *name {
                feature::TEMPERATURE_STATUS => {
                    Ok(OpValue::Index(if self.is_stabilised() { 1 } else { 2 }))
                }
                _ => Ok(OpValue::Index(0)),
            },
            HardwareOperation::GetEnumStringByIndex { feature: name, index } => match *name {
                feature::TEMPERATURE_STATUS => TEMPERATURE_STATUSES
                    .get(*index)
                    .map(|s| OpValue::Text((*s).to_string()))
                    .ok_or(AT_ERR_INDEXNOTAVAILABLE),
                _ => Err(AT_ERR_NOTIMPLEMENTED),
            },
            HardwareOperation::IsReadOnly(_) => Ok(OpValue::Bool(false)),
            HardwareOperation::Command(name) => {
                match *name {
                    feature::ACQUISITION_START => self.acquiring = true,
                    feature::ACQUISITION_STOP => self.acquiring = false,
                    feature::CLOCK_RESET => self.clock_epoch = Instant::now(),
                    feature::SOFTWARE_TRIGGER => self.software_triggers += 1,
                    _ => return Err(AT_ERR_NOTIMPLEMENTED),
                }
                self.commands.push((*name).to_string());
                Ok(OpValue::Unit)
            }
            HardwareOperation::Flush => {
                self.queue.clear();
                self.software_triggers = 0;
                Ok(OpValue::Unit)
            }
            HardwareOperation::Close => {
                self.open = false;
                self.acquiring = false;
                Ok(OpValue::Unit)
            }
        }
    }
}

/// Simulated camera library.
///
/// Defaults: a small 64x48 sensor at 2 bytes per pixel, 10 ms readout, 100 MHz
/// timestamp clock, cooling from 20°C in 6°C steps per temperature read down to
/// 0°C where the status reports `Stabilised`.
///
/// # Example
///
/// ```rust,ignore
/// let sdk = MockCameraSdk::new("VSC-04181").stall_after(10);
/// let probe = sdk.clone();
/// let mut camera = CameraController::new(sdk, options);
/// // ... run the camera ...
/// assert_eq!(probe.frames_delivered(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct MockCameraSdk {
    state: Arc<Mutex<CameraState>>,
}

impl Default for MockCameraSdk {
    fn default() -> Self {
        Self::new("VSC-04181")
    }
}

impl MockCameraSdk {
    /// Create a camera reporting `serial`.
    pub fn new(serial: &str) -> Self {
        let state = CameraState {
            open: false,
            serial: serial.to_string(),
            sensor: (64, 48),
            bytes_per_pixel: 2.0,
            readout_time: 0.01,
            clock_hz: 100_000_000,
            exposure: 0.45,
            exposure_range: (0.00001, 30.0),
            bools: HashMap::new(),
            enums: HashMap::new(),
            temperature: 20.0,
            cooling_floor: 0.0,
            cooling_step: 6.0,
            acquiring: false,
            clock_epoch: Instant::now(),
            queue: VecDeque::new(),
            queue_history: Vec::new(),
            software_triggers: 0,
            trigger_interval: None,
            stall_after: None,
            frames_delivered: 0,
            failures_left: 0,
            failure_code: 0,
            calls: HashMap::new(),
            total_calls: 0,
            commands: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Set the sensor size in pixels.
    pub fn with_sensor(self, width: i64, height: i64) -> Self {
        self.state.lock().sensor = (width, height);
        self
    }

    /// Set the readout time in seconds.
    pub fn with_readout_time(self, seconds: f64) -> Self {
        self.state.lock().readout_time = seconds;
        self
    }

    /// Set the interval between externally triggered frames.
    pub fn with_trigger_interval(self, interval: Duration) -> Self {
        self.state.lock().trigger_interval = Some(interval);
        self
    }

    /// Set the cooling curve: start temperature, floor, and drop per read.
    pub fn with_cooling(self, start: f64, floor: f64, step: f64) -> Self {
        {
            let mut s = self.state.lock();
            s.temperature = start;
            s.cooling_floor = floor;
            s.cooling_step = step;
        }
        self
    }

    /// Stop delivering frames after `frames` buffers (a missed trigger).
    pub fn stall_after(self, frames: usize) -> Self {
        self.state.lock().stall_after = Some(frames);
        self
    }

    /// Make the next `count` calls fail with `code`.
    pub fn fail_next(&mut self, count: usize, code: i32) {
        let mut s = self.state.lock();
        s.failures_left = count;
        s.failure_code = code;
    }

    /// Calls made with feature (or operation) name `name`, failures included.
    pub fn calls_to(&self, name: &str) -> usize {
        self.state.lock().calls.get(name).copied().unwrap_or(0)
    }

    /// All calls made through `execute`.
    pub fn total_calls(&self) -> usize {
        self.state.lock().total_calls
    }

    /// Commands that succeeded, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Every slot ever queued, in order.
    pub fn queued_slots(&self) -> Vec<usize> {
        self.state.lock().queue_history.clone()
    }

    /// Buffers filled so far.
    pub fn frames_delivered(&self) -> usize {
        self.state.lock().frames_delivered
    }

    /// Whether acquisition is running.
    pub fn is_acquiring(&self) -> bool {
        self.state.lock().acquiring
    }

    /// Whether the handle is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Current trigger mode string.
    pub fn trigger_mode(&self) -> String {
        self.state.lock().trigger_mode().to_string()
    }

    /// Current exposure in seconds.
    pub fn exposure(&self) -> f64 {
        self.state.lock().exposure
    }
}

#[async_trait]
impl CameraSdk for MockCameraSdk {
    async fn initialise_libraries(&mut self) -> Result<(), i32> {
        debug!("MockCameraSdk: libraries initialised");
        Ok(())
    }

    async fn finalise_libraries(&mut self) -> Result<(), i32> {
        debug!("MockCameraSdk: libraries finalised");
        Ok(())
    }

    async fn execute(&mut self, op: &HardwareOperation) -> Result<OpValue, i32> {
        let mut s = self.state.lock();
        s.total_calls += 1;
        let name = match op.feature() {
            Some(f) => f.to_string(),
            None => match op {
                HardwareOperation::Open { .. } => "Open".to_string(),
                other => other.to_string(),
            },
        };
        *s.calls.entry(name).or_default() += 1;

        if s.failures_left > 0 {
            s.failures_left -= 1;
            return Err(s.failure_code);
        }
        s.apply(op)
    }

    async fn queue_buffer(&mut self, slot: usize, len: usize) -> Result<(), i32> {
        let mut s = self.state.lock();
        if !s.open {
            return Err(AT_ERR_INVALIDHANDLE);
        }
        if len < s.image_size() {
            return Err(AT_ERR_INVALIDSIZE);
        }
        s.queue.push_back(slot);
        s.queue_history.push(slot);
        Ok(())
    }

    async fn wait_buffer(
        &mut self,
        pool: &mut BufferPool,
        timeout: Duration,
    ) -> Result<usize, i32> {
        let delivery = self.state.lock().next_delivery();
        match delivery {
            Some(delay) if delay <= timeout => {
                sleep(delay).await;
                self.state.lock().fill(pool)
            }
            _ => {
                sleep(timeout).await;
                Err(AT_ERR_TIMEDOUT)
            }
        }
    }
}

// =============================================================================
// MockGcsLink - Simulated rotation stage
// =============================================================================

#[derive(Debug)]
struct StageState {
    connected: bool,
    connect_failures_left: usize,
    servo: bool,
    referenced: bool,
    origin: f64,
    target: f64,
    velocity: f64,
    moved_at: Instant,
    trigger_enabled: bool,
    trigger_params: HashMap<u32, f64>,
    commands: Vec<String>,
    reject: Option<String>,
}

impl StageState {
    fn position(&self) -> f64 {
        let distance = self.target - self.origin;
        let travelled = self.velocity * self.moved_at.elapsed().as_secs_f64();
        if travelled >= distance.abs() {
            self.target
        } else {
            self.origin + distance.signum() * travelled
        }
    }

    fn start_move(&mut self, target: f64) {
        self.origin = self.position();
        self.target = target;
        self.moved_at = Instant::now();
    }

    fn on_target(&self) -> bool {
        self.position() == self.target
    }
}

fn axis_args<'a>(cmd: &'a str, expected: usize) -> Result<Vec<&'a str>> {
    let args: Vec<&str> = cmd.split_whitespace().skip(1).collect();
    if args.len() != expected || args.first() != Some(&"1") {
        bail!("malformed GCS command '{cmd}'");
    }
    Ok(args)
}

fn number(cmd: &str, text: &str) -> Result<f64> {
    text.parse()
        .map_err(|_| anyhow!("bad number '{text}' in '{cmd}'"))
}

/// Simulated PI rotation stage.
///
/// Motion is linear at the commanded velocity with no acceleration phase. `MOV`
/// before servo and referencing is rejected, as on the real controller.
#[derive(Debug, Clone)]
pub struct MockGcsLink {
    state: Arc<Mutex<StageState>>,
}

impl Default for MockGcsLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGcsLink {
    /// Create a stage resting at 123.4°.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StageState {
                connected: false,
                connect_failures_left: 0,
                servo: false,
                referenced: false,
                origin: 123.4,
                target: 123.4,
                velocity: 45.0,
                moved_at: Instant::now(),
                trigger_enabled: false,
                trigger_params: HashMap::new(),
                commands: Vec::new(),
                reject: None,
            })),
        }
    }

    /// Fail the first `count` connection attempts.
    pub fn fail_connects(self, count: usize) -> Self {
        self.state.lock().connect_failures_left = count;
        self
    }

    /// Reject any command starting with `prefix`.
    pub fn reject(self, prefix: &str) -> Self {
        self.state.lock().reject = Some(prefix.to_string());
        self
    }

    /// Commands and queries received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Simulated position now.
    pub fn position(&self) -> f64 {
        self.state.lock().position()
    }

    /// Whether trigger output is enabled.
    pub fn trigger_enabled(&self) -> bool {
        self.state.lock().trigger_enabled
    }

    /// Trigger parameter `id` as last set with `CTO 1 <id> <value>`.
    pub fn trigger_param(&self, id: u32) -> Option<f64> {
        self.state.lock().trigger_params.get(&id).copied()
    }

    /// Current velocity in degrees per second.
    pub fn velocity(&self) -> f64 {
        self.state.lock().velocity
    }
}

#[async_trait]
impl GcsLink for MockGcsLink {
    async fn connect(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        if s.connect_failures_left > 0 {
            s.connect_failures_left -= 1;
            bail!("mock stage refused connection");
        }
        s.connected = true;
        Ok(())
    }

    async fn command(&mut self, cmd: &str) -> Result<()> {
        let mut s = self.state.lock();
        if !s.connected {
            bail!("not connected");
        }
        s.commands.push(cmd.to_string());
        if s.reject.as_deref().is_some_and(|p| cmd.starts_with(p)) {
            bail!("controller rejected '{cmd}'");
        }

        let verb = cmd.split_whitespace().next().unwrap_or_default();
        match verb {
            "STP" => {
                let here = s.position();
                s.origin = here;
                s.target = here;
            }
            "SVO" => {
                let args = axis_args(cmd, 2)?;
                s.servo = args[1] == "1";
            }
            "FRF" => {
                axis_args(cmd, 1)?;
                if !s.servo {
                    bail!("FRF with servo off");
                }
                s.referenced = true;
                s.start_move(0.0);
            }
            "VEL" => {
                let args = axis_args(cmd, 2)?;
                let v = number(cmd, args[1])?;
                if v <= 0.0 {
                    bail!("velocity must be positive: '{cmd}'");
                }
                s.velocity = v;
            }
            "MOV" => {
                let args = axis_args(cmd, 2)?;
                if !s.servo || !s.referenced {
                    bail!("MOV before servo and reference");
                }
                let target = number(cmd, args[1])?;
                s.start_move(target);
            }
            "TRO" => {
                let args = axis_args(cmd, 2)?;
                s.trigger_enabled = args[1] == "1";
            }
            "CTO" => {
                let args = axis_args(cmd, 3)?;
                let id: u32 = args[1]
                    .parse()
                    .map_err(|_| anyhow!("bad CTO parameter in '{cmd}'"))?;
                let value = number(cmd, args[2])?;
                s.trigger_params.insert(id, value);
            }
            _ => bail!("unsupported GCS command '{cmd}'"),
        }
        Ok(())
    }

    async fn query(&mut self, cmd: &str) -> Result<String> {
        let mut s = self.state.lock();
        if !s.connected {
            bail!("not connected");
        }
        s.commands.push(cmd.to_string());
        match cmd.split_whitespace().next().unwrap_or_default() {
            "ERR?" => Ok("0".to_string()),
            "POS?" => Ok(format!("1={:.6}", s.position())),
            "ONT?" => Ok(format!("1={}", u8::from(s.on_target()))),
            _ => bail!("unsupported GCS query '{cmd}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stage_moves_at_commanded_velocity() {
        let mut stage = MockGcsLink::new();
        stage.connect().await.unwrap();
        stage.command("SVO 1 1").await.unwrap();
        stage.command("FRF 1").await.unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(stage.query("ONT? 1").await.unwrap(), "1=1");

        stage.command("VEL 1 10").await.unwrap();
        stage.command("MOV 1 20").await.unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!((stage.position() - 10.0).abs() < 1e-9);
        assert_eq!(stage.query("ONT? 1").await.unwrap(), "1=0");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(stage.query("POS? 1").await.unwrap(), "1=20.000000");
    }

    #[tokio::test]
    async fn stage_rejects_motion_before_reference() {
        let mut stage = MockGcsLink::new();
        stage.connect().await.unwrap();
        assert!(stage.command("MOV 1 10").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn camera_times_out_without_software_trigger() {
        let mut sdk = MockCameraSdk::default();
        sdk.execute(&HardwareOperation::Open { index: 0 })
            .await
            .unwrap();
        sdk.execute(&HardwareOperation::SetEnumString {
            feature: feature::TRIGGER_MODE,
            value: "Software".into(),
        })
        .await
        .unwrap();
        let size = match sdk
            .execute(&HardwareOperation::GetInt(feature::IMAGE_SIZE_BYTES))
            .await
            .unwrap()
        {
            OpValue::Int(n) => n as usize,
            other => panic!("unexpected {other:?}"),
        };
        let mut pool = BufferPool::allocate(1, size).unwrap();
        sdk.queue_buffer(0, size).await.unwrap();
        sdk.execute(&HardwareOperation::Command(feature::ACQUISITION_START))
            .await
            .unwrap();

        let start = Instant::now();
        let timeout = Duration::from_secs(2);
        assert_eq!(
            sdk.wait_buffer(&mut pool, timeout).await,
            Err(AT_ERR_TIMEDOUT)
        );
        assert_eq!(start.elapsed(), timeout);

        sdk.execute(&HardwareOperation::Command(feature::SOFTWARE_TRIGGER))
            .await
            .unwrap();
        assert_eq!(sdk.wait_buffer(&mut pool, timeout).await, Ok(0));
    }
}
