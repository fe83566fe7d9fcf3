//! sCMOS camera controller.
//!
//! Drives one camera through its lifecycle:
//!
//! ```text
//! Disconnected -> Configured -> Stabilizing -> BuffersQueued -> Acquiring -> Closed
//! ```
//!
//! Every library call goes through the [`Dispatcher`], so transient vendor errors are
//! retried before they surface. The two acquisition loops share their frame
//! bookkeeping and differ only in how a frame is triggered:
//!
//! - **continuous**: the rotator fires the external trigger every step; the loop only
//!   collects filled buffers.
//! - **static**: the rotator (or the peer process) is put in position first and the
//!   loop fires one software trigger per frame.
//!
//! Buffers are queued once for the whole observation, cycling through a pool whose
//! depth is one rotation's worth of frames.

use crate::config::{CameraConfig, ExposureSetting, ObservationConfig, TimeoutConfig};
use crate::data::buffer_pool::BufferPool;
use crate::data::metadata::{
    exposure_mismatch, extract_ticks, position_in_rotation, rotation_number, wrap_angle,
    ArcMeasurement, ExposureKind, FrameRecord, TickClock,
};
use crate::data::storage::FrameSink;
use crate::error::{AppResult, DaqError};
use crate::hardware::andor::{feature, VendorStatus, TEMPERATURE_STABILISED};
use crate::hardware::capabilities::CameraSdk;
use crate::hardware::dispatch::Dispatcher;
use crate::hardware::operation::HardwareOperation;
use crate::instrument::rotator::RotatorAccess;
use crate::plan::AcquisitionPlan;
use crate::sync::{Role, SyncChannel, SyncState};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Interval between temperature polls while stabilizing.
pub const THERMAL_POLL: Duration = Duration::from_secs(1);

/// Camera lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraState {
    /// Libraries not initialised or camera not open.
    Disconnected,
    /// Opened and configured.
    Configured,
    /// Waiting for the sensor to cool.
    Stabilizing,
    /// Pool allocated and every frame's buffer queued.
    BuffersQueued,
    /// Acquisition enabled.
    Acquiring,
    /// Handle and libraries released.
    Closed,
}

/// Trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerMode {
    /// Free running.
    Internal,
    /// Fired by the rotator trigger output.
    External,
    /// Fired by a `SoftwareTrigger` command.
    Software,
}

impl TriggerMode {
    /// Value of the `TriggerMode` feature.
    pub fn as_feature_value(self) -> &'static str {
        match self {
            Self::Internal => "Internal",
            Self::External => "External",
            Self::Software => "Software",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_feature_value())
    }
}

/// Properties read back from the camera after configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CameraInfo {
    /// Reported serial number.
    pub serial: String,
    /// Firmware version string.
    pub firmware: String,
    /// Whether arbitrary AOIs are supported.
    pub full_aoi_control: bool,
    /// Exposure in effect, seconds.
    pub exposure: f64,
    /// Shortest exposure, seconds.
    pub exposure_min: f64,
    /// Longest exposure, seconds.
    pub exposure_max: f64,
    /// Sensor readout time, seconds.
    pub readout_time: f64,
    /// Bytes per pixel for the selected encoding.
    pub bytes_per_pixel: f64,
    /// Pixel pitch, micrometres.
    pub pixel_width: f64,
    /// Pixel pitch, micrometres.
    pub pixel_height: f64,
    /// Sensor width, pixels.
    pub sensor_width: i64,
    /// Sensor height, pixels.
    pub sensor_height: i64,
    /// Timestamp clock frequency, Hz.
    pub clock_frequency: i64,
    /// Bytes per image including the metadata trailer.
    pub image_size: usize,
    /// Image width after binning.
    pub width: i64,
    /// Image height after binning.
    pub height: i64,
}

/// Controller for one camera.
pub struct CameraController<S: CameraSdk> {
    sdk: S,
    dispatcher: Dispatcher,
    index: usize,
    config: CameraConfig,
    state: CameraState,
    info: CameraInfo,
    /// Exposure chosen at configuration, restored for non-bias frames.
    exposure: f64,
    opened: bool,
    pool: Option<BufferPool>,
}

impl<S: CameraSdk> fmt::Debug for CameraController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraController")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("serial", &self.info.serial)
            .finish_non_exhaustive()
    }
}

impl<S: CameraSdk> CameraController<S> {
    /// Create a controller for the camera at USB `index`. Nothing is called yet.
    pub fn new(sdk: S, index: usize, config: CameraConfig, dispatcher: Dispatcher) -> Self {
        Self {
            sdk,
            dispatcher,
            index,
            config,
            state: CameraState::Disconnected,
            info: CameraInfo::default(),
            exposure: 0.0,
            opened: false,
            pool: None,
        }
    }

    /// The underlying library binding.
    pub fn sdk(&self) -> &S {
        &self.sdk
    }

    /// USB index of this camera.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CameraState {
        self.state
    }

    /// Properties read back by [`Self::configure`].
    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    /// The buffer pool, once allocated.
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Initialise the device and utility libraries.
    ///
    /// # Errors
    /// Returns [`DaqError::Hardware`] with the library status.
    pub async fn initialize(&mut self) -> AppResult<()> {
        self.sdk
            .initialise_libraries()
            .await
            .map_err(|code| library_error("InitialiseLibrary", code))?;
        debug!(camera = self.index, "camera libraries initialised");
        Ok(())
    }

    /// Open the camera and program it for `plan`.
    ///
    /// Rotating plans are externally triggered, static plans software triggered.
    /// With automatic exposure in a rotating plan the exposure fills the trigger
    /// interval less one and a half readouts.
    ///
    /// # Errors
    /// Returns the first [`DaqError::Hardware`] from the open sequence.
    #[instrument(skip_all, fields(camera = self.index))]
    pub async fn configure(
        &mut self,
        plan: &AcquisitionPlan,
        observation: &ObservationConfig,
        expected_serial: Option<&str>,
    ) -> AppResult<&CameraInfo> {
        let trigger = if plan.is_rotating() {
            TriggerMode::External
        } else {
            TriggerMode::Software
        };
        let requested = match observation.exposure {
            ExposureSetting::Seconds(seconds) => seconds,
            ExposureSetting::Auto(_) => observation.fallback_exposure,
        };

        let d = &self.dispatcher;
        let sdk = &mut self.sdk;
        d.invoke(sdk, &HardwareOperation::Open { index: self.index })
            .await?;
        self.opened = true;

        d.set_bool(sdk, feature::SENSOR_COOLING, true).await?;
        d.set_bool(sdk, feature::METADATA_ENABLE, true).await?;
        d.set_bool(sdk, feature::METADATA_TIMESTAMP, true).await?;
        d.set_bool(sdk, feature::SPURIOUS_NOISE_FILTER, false).await?;
        d.set_bool(sdk, feature::STATIC_BLEMISH_CORRECTION, false).await?;
        d.set_bool(sdk, feature::ROLLING_SHUTTER_GLOBAL_CLEAR, true).await?;
        d.set_enum(sdk, feature::SHUTTERING_MODE, "Rolling").await?;
        d.set_enum(sdk, feature::SENSOR_READOUT_MODE, self.config.read_direction.as_feature_value())
            .await?;
        d.set_enum(sdk, feature::PRE_AMP_GAIN, self.config.amplifier.as_feature_value())
            .await?;
        d.set_enum(sdk, feature::PIXEL_ENCODING, self.config.encoding.as_feature_value())
            .await?;
        d.set_enum(sdk, feature::PIXEL_READOUT_RATE, self.config.readout_rate.as_feature_value())
            .await?;
        d.set_enum(sdk, feature::CYCLE_MODE, "Continuous").await?;
        d.set_enum(sdk, feature::AOI_BINNING, self.config.binning.as_feature_value())
            .await?;
        d.set_enum(sdk, feature::TRIGGER_MODE, trigger.as_feature_value())
            .await?;
        d.set_float(sdk, feature::EXPOSURE_TIME, requested).await?;

        let mut info = CameraInfo {
            full_aoi_control: d.get_bool(sdk, feature::FULL_AOI_CONTROL).await?,
            serial: d.get_string(sdk, feature::SERIAL_NUMBER).await?,
            firmware: d.get_string(sdk, feature::FIRMWARE_VERSION).await?,
            exposure: d.get_float(sdk, feature::EXPOSURE_TIME).await?,
            readout_time: d.get_float(sdk, feature::READOUT_TIME).await?,
            bytes_per_pixel: d.get_float(sdk, feature::BYTES_PER_PIXEL).await?,
            pixel_width: d.get_float(sdk, feature::PIXEL_WIDTH).await?,
            pixel_height: d.get_float(sdk, feature::PIXEL_HEIGHT).await?,
            sensor_width: d.get_int(sdk, feature::SENSOR_WIDTH).await?,
            sensor_height: d.get_int(sdk, feature::SENSOR_HEIGHT).await?,
            clock_frequency: d.get_int(sdk, feature::CLOCK_FREQUENCY).await?,
            image_size: usize::try_from(d.get_int(sdk, feature::IMAGE_SIZE_BYTES).await?)
                .map_err(|_| DaqError::InvalidOperation("negative ImageSizeBytes".into()))?,
            exposure_min: d
                .invoke(sdk, &HardwareOperation::GetFloatMin(feature::EXPOSURE_TIME))
                .await?
                .into_float()?,
            exposure_max: d
                .invoke(sdk, &HardwareOperation::GetFloatMax(feature::EXPOSURE_TIME))
                .await?
                .into_float()?,
            ..CameraInfo::default()
        };
        d.invoke(sdk, &HardwareOperation::Flush).await?;

        if matches!(observation.exposure, ExposureSetting::Auto(_)) && plan.is_rotating() {
            let auto = plan.exposure_for(&observation.exposure, info.readout_time, requested);
            let clamped = auto.clamp(info.exposure_min, info.exposure_max);
            if clamped != auto {
                warn!(auto, clamped, "automatic exposure outside device range");
            }
            d.set_float(sdk, feature::EXPOSURE_TIME, clamped).await?;
            info.exposure = d.get_float(sdk, feature::EXPOSURE_TIME).await?;
            info!(exposure = info.exposure, "automatic exposure");
        }
        plan.check_exposure(info.exposure);

        let bin = self.config.binning.factor().max(1);
        info.width = info.sensor_width / bin;
        info.height = info.sensor_height / bin;

        if let Some(expected) = expected_serial.filter(|e| *e != info.serial) {
            warn!(
                expected,
                found = %info.serial,
                index = self.index,
                "unexpected camera at this index, check the USB leads"
            );
        }

        info!(
            serial = %info.serial,
            firmware = %info.firmware,
            %trigger,
            encoding = self.config.encoding.as_feature_value(),
            rate = self.config.readout_rate.as_feature_value(),
            amp = self.config.amplifier.as_feature_value(),
            binning = self.config.binning.as_feature_value(),
            full_aoi = info.full_aoi_control,
            "camera configured"
        );
        info!(
            image_size = info.image_size,
            readout = info.readout_time,
            exposure = info.exposure,
            min = info.exposure_min,
            max = info.exposure_max,
            per_cycle = plan.images_per_cycle,
            total = plan.total_images,
            "exposure settings"
        );

        self.exposure = info.exposure;
        self.info = info;
        self.state = CameraState::Configured;
        Ok(&self.info)
    }

    /// Sensor temperature and thermal status.
    async fn thermal(&mut self) -> AppResult<(f64, String)> {
        let temperature = self
            .dispatcher
            .get_float(&mut self.sdk, feature::SENSOR_TEMPERATURE)
            .await?;
        let status = self
            .dispatcher
            .get_enum_string(&mut self.sdk, feature::TEMPERATURE_STATUS)
            .await?;
        info!(thermal = %status, temperature, "sensor");
        Ok((temperature, status))
    }

    /// Wait for the sensor to cool to `target` °C.
    ///
    /// Unless `fast`, first waits for the status to report stabilised. Both phases
    /// poll once a second and share `timeout`. Returns the final temperature.
    ///
    /// # Errors
    /// Returns [`DaqError::Timeout`] if the budget runs out.
    pub async fn stabilize(&mut self, target: f64, timeout: Duration, fast: bool) -> AppResult<f64> {
        self.state = CameraState::Stabilizing;
        let deadline = Instant::now() + timeout;

        if !fast {
            loop {
                sleep(THERMAL_POLL).await;
                let (_, status) = self.thermal().await?;
                if status == TEMPERATURE_STABILISED {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("cooling timeout");
                    return Err(DaqError::timeout("stabilised sensor temperature", timeout));
                }
            }
        }

        loop {
            sleep(THERMAL_POLL).await;
            let (temperature, status) = self.thermal().await?;
            if temperature <= target {
                info!(thermal = %status, temperature, target, "sensor cold");
                return Ok(temperature);
            }
            if Instant::now() >= deadline {
                warn!(temperature, target, "cooling timeout");
                return Err(DaqError::timeout(
                    format!("sensor below {target}°C"),
                    timeout,
                ));
            }
        }
    }

    /// Allocate a pool one rotation deep and queue a buffer for every frame.
    ///
    /// # Errors
    /// - [`DaqError::InvalidOperation`] before [`Self::configure`].
    /// - [`DaqError::Allocation`] if the pool cannot be allocated.
    /// - [`DaqError::Hardware`] if the device refuses a buffer.
    pub async fn allocate_and_queue(&mut self, plan: &AcquisitionPlan) -> AppResult<()> {
        if self.info.image_size == 0 {
            return Err(DaqError::InvalidOperation(
                "buffers requested before the camera was configured".into(),
            ));
        }
        let pool = BufferPool::allocate(plan.images_per_cycle, self.info.image_size)?;
        let len = pool.buffer_len();
        let slots: Vec<usize> = pool.slot_sequence(plan.total_images).collect();
        for slot in slots {
            self.sdk
                .queue_buffer(slot, len)
                .await
                .map_err(|code| library_error(&format!("QueueBuffer({slot})"), code))?;
        }
        debug!(depth = pool.depth(), queued = plan.total_images, len, "buffers queued");
        self.pool = Some(pool);
        self.state = CameraState::BuffersQueued;
        Ok(())
    }

    /// Start or stop acquisition, only if the camera is not already in that state.
    ///
    /// Returns whether a command was issued.
    pub async fn set_acquisition(&mut self, enable: bool) -> AppResult<bool> {
        let d = &self.dispatcher;
        let acquiring = d.get_bool(&mut self.sdk, feature::CAMERA_ACQUIRING).await?;
        if acquiring == enable {
            return Ok(false);
        }
        let command = if enable {
            feature::ACQUISITION_START
        } else {
            feature::ACQUISITION_STOP
        };
        d.command(&mut self.sdk, command).await?;
        info!(camera = self.index, command, "acquisition");
        if enable {
            self.state = CameraState::Acquiring;
        }
        Ok(true)
    }

    /// Select the trigger source.
    pub async fn set_trigger_mode(&mut self, mode: TriggerMode) -> AppResult<()> {
        self.dispatcher
            .set_enum(&mut self.sdk, feature::TRIGGER_MODE, mode.as_feature_value())
            .await
    }

    /// Zero the timestamp clock.
    pub async fn reset_clock(&mut self) -> AppResult<()> {
        self.dispatcher
            .command(&mut self.sdk, feature::CLOCK_RESET)
            .await
    }

    /// Read and log the sensor temperature.
    pub async fn read_temperature(&mut self) -> AppResult<f64> {
        let temperature = self
            .dispatcher
            .get_float(&mut self.sdk, feature::SENSOR_TEMPERATURE)
            .await?;
        info!(camera = self.index, temperature, "sensor temperature");
        Ok(temperature)
    }

    /// Discard queued and filled buffers.
    pub async fn flush(&mut self) -> AppResult<()> {
        self.dispatcher
            .invoke(&mut self.sdk, &HardwareOperation::Flush)
            .await
            .map(drop)
    }

    /// Set the exposure for `kind`: the device minimum for bias frames, otherwise
    /// the configured exposure. Returns the exposure in effect.
    async fn prepare_exposure(&mut self, kind: ExposureKind) -> AppResult<f64> {
        let exposure = if kind == ExposureKind::Bias {
            self.info.exposure_min
        } else {
            self.exposure
        };
        let d = &self.dispatcher;
        d.set_float(&mut self.sdk, feature::EXPOSURE_TIME, exposure)
            .await?;
        let actual = d.get_float(&mut self.sdk, feature::EXPOSURE_TIME).await?;
        self.info.exposure = actual;
        Ok(actual)
    }

    /// Collect `plan.total_images` externally triggered frames.
    ///
    /// The rotator holder measures each frame's arc from the live position; without
    /// one the arc is assumed to be exactly one step. Returns the frame count.
    ///
    /// # Errors
    /// - [`DaqError::MissedFrame`] if a buffer does not arrive within the exposure
    ///   plus `transfer`.
    /// - Rotator and sink errors as they occur.
    #[instrument(skip_all, fields(camera = self.index, kind = %kind))]
    pub async fn acquire_continuous(
        &mut self,
        plan: &AcquisitionPlan,
        kind: ExposureKind,
        sink: &mut dyn FrameSink,
        mut rotator: Option<&mut (dyn RotatorAccess + '_)>,
        transfer: Duration,
    ) -> AppResult<usize> {
        let exposure = self.prepare_exposure(kind).await?;
        let timeout = Duration::from_secs_f64(exposure) + transfer;
        let mut frames = FrameBook::new(self.index, kind, plan, exposure, self.info.clock_frequency);
        let pool = self.pool.as_mut().ok_or_else(not_queued)?;

        for index in 0..plan.total_images {
            let requested = frames.requested;
            let started = Utc::now();
            let slot = match self.sdk.wait_buffer(pool, timeout).await {
                Ok(slot) => slot,
                Err(code) => return Err(missed(index, timeout, code)),
            };
            let arc = match rotator.as_deref_mut() {
                Some(r) => ArcMeasurement::live(requested, r.position().await?),
                None => ArcMeasurement::synthesized(requested, plan.step),
            };
            let image = pool.slot(slot).ok_or_else(not_queued)?;
            frames.record(image, slot, arc, started, sink).await?;
        }

        self.set_acquisition(false).await?;
        self.set_trigger_mode(TriggerMode::Software).await?;
        self.read_temperature().await?;
        self.flush().await?;
        sink.finish().await?;
        Ok(frames.written)
    }

    /// Collect `plan.total_images` software triggered frames at discrete angles.
    ///
    /// The rotator holder moves to each angle and, if `sync` is given, hands a
    /// trigger signal to the peer. Without a rotator the loop waits for that signal
    /// on `role`'s slot and takes the requested angle as observed.
    ///
    /// # Errors
    /// - [`DaqError::Timeout`] if the rotator or the peer does not respond.
    /// - [`DaqError::MissedFrame`] if a triggered buffer does not arrive.
    #[instrument(skip_all, fields(camera = self.index, kind = %kind))]
    #[allow(clippy::too_many_arguments)]
    pub async fn acquire_static(
        &mut self,
        plan: &AcquisitionPlan,
        kind: ExposureKind,
        sink: &mut dyn FrameSink,
        mut rotator: Option<&mut (dyn RotatorAccess + '_)>,
        sync: Option<&dyn SyncChannel>,
        role: Role,
        timeouts: &TimeoutConfig,
    ) -> AppResult<usize> {
        let exposure = self.prepare_exposure(kind).await?;
        let timeout = Duration::from_secs_f64(exposure) + timeouts.transfer();
        let mut frames = FrameBook::new(self.index, kind, plan, exposure, self.info.clock_frequency);
        let pool = self.pool.as_mut().ok_or_else(not_queued)?;

        for index in 0..plan.total_images {
            let requested = frames.requested;
            let started = Utc::now();

            let observed = match rotator.as_deref_mut() {
                Some(r) => {
                    let actual = r.goto(requested, timeouts.rotate()).await?;
                    if let Some(sync) = sync {
                        if !sync
                            .hand_over(SyncState::Trigger, role.peer(), timeouts.trigger())
                            .await
                        {
                            error!(frame = index, "peer did not take the trigger");
                            return Err(DaqError::timeout("peer to take trigger", timeouts.trigger()));
                        }
                    }
                    actual
                }
                None => {
                    if let Some(sync) = sync {
                        if !sync
                            .wait(SyncState::Trigger, role, timeouts.trigger(), true)
                            .await
                        {
                            error!(frame = index, "no trigger from peer");
                            return Err(DaqError::timeout("trigger from peer", timeouts.trigger()));
                        }
                    }
                    requested
                }
            };

            self.dispatcher
                .command(&mut self.sdk, feature::SOFTWARE_TRIGGER)
                .await?;
            let slot = match self.sdk.wait_buffer(pool, timeout).await {
                Ok(slot) => slot,
                Err(code) => return Err(missed(index, timeout, code)),
            };
            let image = pool.slot(slot).ok_or_else(not_queued)?;
            let arc = ArcMeasurement::stationary(requested, observed);
            frames.record(image, slot, arc, started, sink).await?;
        }

        self.set_acquisition(false).await?;
        self.read_temperature().await?;
        self.flush().await?;
        sink.finish().await?;
        Ok(frames.written)
    }

    /// Stop acquisition, fall back to software triggering, flush, close the handle
    /// and release the libraries.
    ///
    /// Every step is attempted even if an earlier one fails.
    ///
    /// # Errors
    /// The single failure, or [`DaqError::ShutdownFailed`] with all of them.
    pub async fn close(&mut self) -> AppResult<()> {
        if self.state == CameraState::Closed {
            return Ok(());
        }
        let mut errors = Vec::new();
        if self.opened {
            if let Err(e) = self.set_acquisition(false).await {
                errors.push(e);
            }
            if let Err(e) = self.set_trigger_mode(TriggerMode::Software).await {
                errors.push(e);
            }
            if let Err(e) = self.flush().await {
                errors.push(e);
            }
            if let Err(e) = self
                .dispatcher
                .invoke(&mut self.sdk, &HardwareOperation::Close)
                .await
            {
                errors.push(e);
            }
            self.opened = false;
        }
        self.pool = None;
        if let Err(code) = self.sdk.finalise_libraries().await {
            errors.push(library_error("FinaliseLibrary", code));
        }
        self.state = CameraState::Closed;
        info!(camera = self.index, errors = errors.len(), "camera closed");

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }
}

/// Per-frame bookkeeping shared by both loops.
struct FrameBook {
    camera: usize,
    kind: ExposureKind,
    cycle_len: usize,
    step: f64,
    speed: f64,
    sign: f64,
    exposure: f64,
    requested: f64,
    clock: TickClock,
    written: usize,
}

impl FrameBook {
    fn new(camera: usize, kind: ExposureKind, plan: &AcquisitionPlan, exposure: f64, clock_hz: i64) -> Self {
        Self {
            camera,
            kind,
            cycle_len: plan.images_per_cycle,
            step: plan.step,
            speed: plan.speed,
            sign: plan.direction.sign(),
            exposure,
            requested: plan.start_angle,
            clock: TickClock::new(clock_hz as f64),
            written: 0,
        }
    }

    async fn record(
        &mut self,
        image: &[u8],
        slot: usize,
        arc: ArcMeasurement,
        started: chrono::DateTime<Utc>,
        sink: &mut dyn FrameSink,
    ) -> AppResult<()> {
        let index = self.written;
        let ticks = extract_ticks(image);
        if ticks.is_none() {
            debug!(frame = index, "no timestamp in metadata trailer");
        }
        let clock_delta = ticks.map_or(0.0, |t| self.clock.delta(t));
        let record = FrameRecord {
            camera: self.camera,
            kind: self.kind,
            index,
            rotation: rotation_number(index, self.cycle_len),
            position: position_in_rotation(index, self.cycle_len),
            requested_angle: self.requested,
            requested_wrapped: wrap_angle(self.requested),
            end_angle: arc.end_angle,
            arc: arc.arc,
            ticks,
            clock_delta,
            exposure: self.exposure,
            slot,
            started,
            finished: Utc::now(),
        };
        sink.write_frame(image, &record).await?;

        info!(
            frame = index + 1,
            rot = record.rotation,
            seq = record.position,
            exp = self.exposure,
            req = format_args!("{:.3}", record.requested_wrapped),
            end = format_args!("{:.3}", record.end_angle),
            arc = format_args!("{:.3}", record.arc),
            mismatch = format_args!(
                "{:.4}",
                exposure_mismatch(record.arc, self.speed, self.sign, self.exposure)
            ),
            clock = format_args!("{:.4}", clock_delta),
            "frame"
        );

        self.requested += self.step;
        self.written += 1;
        Ok(())
    }
}

fn library_error(operation: &str, code: i32) -> DaqError {
    DaqError::Hardware {
        operation: operation.to_string(),
        attempts: 1,
        status: VendorStatus::classify(code),
    }
}

fn missed(index: usize, after: Duration, code: i32) -> DaqError {
    let status = VendorStatus::classify(code);
    error!(frame = index, ?after, %status, "missed image");
    DaqError::MissedFrame {
        index,
        after,
        status,
    }
}

fn not_queued() -> DaqError {
    DaqError::InvalidOperation("acquisition started without queued buffers".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoExposure;
    use crate::data::storage::MemorySink;
    use crate::error_recovery::RetryPolicy;
    use crate::hardware::mock::{MockCameraSdk, MockGcsLink, MOCK_TRAILER_LEN};
    use crate::instrument::rotator::{RotatorController, TriggerGeometry};

    fn observation(images_per_cycle: usize, cycles: usize, velocity: f64) -> ObservationConfig {
        ObservationConfig {
            images_per_cycle,
            cycles,
            velocity,
            ..ObservationConfig::default()
        }
    }

    fn camera(sdk: MockCameraSdk) -> CameraController<MockCameraSdk> {
        let dispatcher = Dispatcher::new(RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(1),
        });
        CameraController::new(sdk, 0, CameraConfig::default(), dispatcher)
    }

    async fn ready(
        sdk: MockCameraSdk,
        obs: &ObservationConfig,
    ) -> (CameraController<MockCameraSdk>, AcquisitionPlan) {
        let plan = AcquisitionPlan::from_observation(obs, 0.004).unwrap();
        let mut cam = camera(sdk);
        cam.initialize().await.unwrap();
        cam.configure(&plan, obs, None).await.unwrap();
        cam.allocate_and_queue(&plan).await.unwrap();
        cam.reset_clock().await.unwrap();
        cam.set_acquisition(true).await.unwrap();
        (cam, plan)
    }

    #[tokio::test(start_paused = true)]
    async fn configure_reads_back_geometry_and_auto_exposure() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let obs = observation(16, 1, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(sdk);
        cam.initialize().await.unwrap();
        let info = cam.configure(&plan, &obs, Some("VSC-04181")).await.unwrap().clone();

        assert_eq!(info.serial, "VSC-04181");
        assert_eq!((info.width, info.height), (64, 48));
        assert_eq!(info.image_size, 64 * 48 * 2 + MOCK_TRAILER_LEN);
        assert_eq!(info.clock_frequency, 100_000_000);
        // 22.5 / 45 - 1.5 * 0.01
        assert!((info.exposure - 0.485).abs() < 1e-12);
        assert_eq!(probe.trigger_mode(), "External");
        assert_eq!(cam.state(), CameraState::Configured);
    }

    #[tokio::test(start_paused = true)]
    async fn static_plan_uses_software_trigger_and_fixed_exposure() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let mut obs = observation(8, 1, 0.0);
        obs.exposure = ExposureSetting::Seconds(0.2);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(sdk);
        cam.configure(&plan, &obs, None).await.unwrap();
        assert_eq!(probe.trigger_mode(), "Software");
        assert_eq!(cam.info().exposure, 0.2);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn serial_mismatch_only_warns() {
        let obs = observation(16, 1, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(MockCameraSdk::new("VSC-09999"));
        assert!(cam.configure(&plan, &obs, Some("VSC-04181")).await.is_ok());
        assert!(logs_contain("unexpected camera"));
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_enable_is_idempotent() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let obs = observation(8, 1, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(sdk);
        cam.configure(&plan, &obs, None).await.unwrap();

        assert!(cam.set_acquisition(true).await.unwrap());
        assert!(!cam.set_acquisition(true).await.unwrap());
        assert!(cam.set_acquisition(false).await.unwrap());
        assert!(!cam.set_acquisition(false).await.unwrap());
        assert_eq!(probe.commands(), vec!["AcquisitionStart", "AcquisitionStop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stabilize_waits_for_status_then_temperature() {
        let obs = observation(8, 1, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(MockCameraSdk::default());
        cam.configure(&plan, &obs, None).await.unwrap();

        // 20 -> 14 -> 8 -> 2 -> 0 (stabilised), then one more read at 0
        let start = Instant::now();
        let t = cam.stabilize(4.0, Duration::from_secs(60), false).await.unwrap();
        assert_eq!(t, 0.0);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_stabilize_skips_the_status_phase() {
        let obs = observation(8, 1, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(MockCameraSdk::default());
        cam.configure(&plan, &obs, None).await.unwrap();

        let start = Instant::now();
        let t = cam.stabilize(4.0, Duration::from_secs(60), true).await.unwrap();
        assert_eq!(t, 2.0);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stabilize_timeout_is_an_error() {
        let obs = observation(8, 1, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(MockCameraSdk::default().with_cooling(20.0, 10.0, 1.0));
        cam.configure(&plan, &obs, None).await.unwrap();

        let start = Instant::now();
        let err = cam
            .stabilize(4.0, Duration::from_secs(5), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn every_frame_gets_a_queued_buffer_cycling_through_the_pool() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let obs = observation(8, 2, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(sdk);
        cam.configure(&plan, &obs, None).await.unwrap();
        cam.allocate_and_queue(&plan).await.unwrap();

        let expected: Vec<usize> = (0..16).map(|i| i % 8).collect();
        assert_eq!(probe.queued_slots(), expected);
        assert_eq!(cam.pool().unwrap().depth(), 8);
        assert_eq!(cam.state(), CameraState::BuffersQueued);
    }

    #[tokio::test(start_paused = true)]
    async fn buffers_before_configure_are_refused() {
        let obs = observation(8, 1, 45.0);
        let plan = AcquisitionPlan::from_observation(&obs, 0.004).unwrap();
        let mut cam = camera(MockCameraSdk::default());
        assert!(matches!(
            cam.allocate_and_queue(&plan).await,
            Err(DaqError::InvalidOperation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_run_records_every_frame() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let (mut cam, plan) = ready(sdk, &observation(16, 3, 45.0)).await;
        let mut sink = MemorySink::new();

        let written = cam
            .acquire_continuous(&plan, ExposureKind::Expose, &mut sink, None, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(written, 48);
        let records = sink.records();
        assert_eq!(records.len(), 48);
        assert_eq!((records[16].rotation, records[16].position), (2, 1));
        assert_eq!(records[16].slot, 0);
        assert_eq!(records[47].requested_wrapped, wrap_angle(47.0 * 22.5));
        assert!(records.iter().all(|r| r.arc == 22.5 && r.ticks.is_some()));
        // exposure + readout between frames
        assert!((records[5].clock_delta - 0.495).abs() < 1e-3);
        assert!(!probe.is_acquiring());
        assert_eq!(probe.trigger_mode(), "Software");
    }

    #[tokio::test(start_paused = true)]
    async fn missed_frame_stops_the_loop() {
        let (mut cam, plan) = ready(MockCameraSdk::default().stall_after(5), &observation(8, 1, 45.0)).await;
        let mut sink = MemorySink::new();

        let err = cam
            .acquire_continuous(&plan, ExposureKind::Expose, &mut sink, None, Duration::from_secs(30))
            .await
            .unwrap_err();

        match err {
            DaqError::MissedFrame { index, status, .. } => {
                assert_eq!(index, 5);
                assert_eq!(status.name(), "AT_ERR_TIMEDOUT");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(sink.records().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn bias_frames_use_the_minimum_exposure() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let (mut cam, plan) = ready(sdk, &observation(8, 1, 45.0)).await;
        let mut sink = MemorySink::new();

        cam.acquire_continuous(&plan, ExposureKind::Bias, &mut sink, None, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(probe.exposure(), 0.00001);
        assert!(sink.records().iter().all(|r| r.kind == ExposureKind::Bias));
    }

    #[tokio::test(start_paused = true)]
    async fn static_run_drives_the_rotator() {
        let mut obs = observation(8, 1, 0.0);
        obs.exposure = ExposureSetting::Auto(AutoExposure::Auto);
        let (mut cam, plan) = ready(MockCameraSdk::default(), &obs).await;

        let mut rotator = RotatorController::new(MockGcsLink::new(), 0.004);
        rotator.connect(&RetryPolicy::connection()).await.unwrap();
        rotator
            .initialize(&TriggerGeometry::from_plan(&plan, true), Duration::from_secs(30))
            .await
            .unwrap();
        let mut sink = MemorySink::new();

        let written = cam
            .acquire_static(
                &plan,
                ExposureKind::Expose,
                &mut sink,
                Some(&mut rotator),
                None,
                Role::Master,
                &TimeoutConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(written, 8);
        for (i, r) in sink.records().iter().enumerate() {
            assert_eq!(r.requested_wrapped, i as f64 * 45.0);
            assert!(r.arc.abs() <= 0.004, "frame {i} arc {}", r.arc);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn static_run_without_rotator_takes_requested_angles() {
        let (mut cam, plan) = ready(MockCameraSdk::default(), &observation(8, 1, 0.0)).await;
        let mut sink = MemorySink::new();

        cam.acquire_static(
            &plan,
            ExposureKind::Dark,
            &mut sink,
            None,
            None,
            Role::Slave,
            &TimeoutConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(sink.records().len(), 8);
        assert!(sink
            .records()
            .iter()
            .all(|r| r.arc == 0.0 && r.end_angle == r.requested_wrapped));
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_the_handle() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let (mut cam, _) = ready(sdk, &observation(8, 1, 45.0)).await;
        cam.close().await.unwrap();
        assert!(!probe.is_open());
        assert!(!probe.is_acquiring());
        assert_eq!(cam.state(), CameraState::Closed);
        // second close is a no-op
        cam.close().await.unwrap();
    }
}
