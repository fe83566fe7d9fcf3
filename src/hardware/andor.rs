//! Andor SDK3 vocabulary: return-code classification and feature names.
//!
//! The camera library reports every call outcome as an integer. Three disjoint
//! ranges are meaningful:
//!
//! | Range        | Source                         |
//! |--------------|--------------------------------|
//! | `0`          | success                        |
//! | `1..=39`     | device API (`atcore`)          |
//! | `1000..=1006`| utility/codec API (`atutility`)|
//!
//! Anything else is reported as unknown.

use std::fmt;

/// Device API return codes, indexed by value.
const DEVICE_ERRORS: [&str; 40] = [
    "AT_SUCCESS",
    "AT_ERR_NOTINITIALISED",
    "AT_ERR_NOTIMPLEMENTED",
    "AT_ERR_READONLY",
    "AT_ERR_NOTREADABLE",
    "AT_ERR_NOTWRITABLE",
    "AT_ERR_OUTOFRANGE",
    "AT_ERR_INDEXNOTAVAILABLE",
    "AT_ERR_INDEXNOTIMPLEMENTED",
    "AT_ERR_EXCEEDEDMAXSTRINGLENGTH",
    "AT_ERR_CONNECTION",
    "AT_ERR_NODATA",
    "AT_ERR_INVALIDHANDLE",
    "AT_ERR_TIMEDOUT",
    "AT_ERR_BUFFERFULL",
    "AT_ERR_INVALIDSIZE",
    "AT_ERR_INVALIDALIGNMENT",
    "AT_ERR_COMM",
    "AT_ERR_STRINGNOTAVAILABLE",
    "AT_ERR_STRINGNOTIMPLEMENTED",
    "AT_ERR_NULL_FEATURE",
    "AT_ERR_NULL_HANDLE",
    "AT_ERR_NULL_IMPLEMENTED_VAR",
    "AT_ERR_NULL_READABLE_VAR",
    "AT_ERR_NULL_READONLY_VAR",
    "AT_ERR_NULL_WRITABLE_VAR",
    "AT_ERR_NULL_MINVALUE",
    "AT_ERR_NULL_MAXVALUE",
    "AT_ERR_NULL_VALUE",
    "AT_ERR_NULL_STRING",
    "AT_ERR_NULL_COUNT_VAR",
    "AT_ERR_NULL_ISAVAILABLE_VAR",
    "AT_ERR_NULL_MAXSTRINGLENGTH",
    "AT_ERR_NULL_EVCALLBACK",
    "AT_ERR_NULL_QUEUE_PTR",
    "AT_ERR_NULL_WAIT_PTR",
    "AT_ERR_NULL_PTRSIZE",
    "AT_ERR_NOMEMORY",
    "AT_ERR_DEVICEINUSE",
    "AT_ERR_DEVICENOTFOUND",
];

/// Utility library return codes, offset from 1000.
const UTILITY_ERRORS: [&str; 7] = [
    "AT_ERR_1000",
    "AT_ERR_1001",
    "AT_ERR_INVALIDOUTPUTPIXELENCODING",
    "AT_ERR_INVALIDINPUTPIXELENCODING",
    "AT_ERR_INVALIDMETADATAINFO",
    "AT_ERR_CORRUPTEDMETADATA",
    "AT_ERR_METADATANOTFOUND",
];

const UTILITY_BASE: i32 = 1000;

/// Return code used by the wait call when no buffer arrived in time.
pub const AT_ERR_TIMEDOUT: i32 = 13;
/// Return code for a failed allocation inside the library.
pub const AT_ERR_NOMEMORY: i32 = 37;

/// Classified outcome of a vendor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorStatus {
    /// Return code 0.
    Success,
    /// Device API failure.
    Device {
        /// Raw return code.
        code: i32,
        /// Symbolic name from the vendor table.
        name: &'static str,
    },
    /// Utility/codec API failure.
    Utility {
        /// Raw return code.
        code: i32,
        /// Symbolic name from the vendor table.
        name: &'static str,
    },
    /// Code outside every known range.
    Unknown(i32),
}

impl VendorStatus {
    /// Classify a raw vendor return code.
    pub fn classify(code: i32) -> Self {
        if code == 0 {
            return Self::Success;
        }
        if let Some(name) = usize::try_from(code)
            .ok()
            .and_then(|idx| DEVICE_ERRORS.get(idx))
        {
            return Self::Device { code, name };
        }
        if let Some(name) = usize::try_from(code - UTILITY_BASE)
            .ok()
            .and_then(|idx| UTILITY_ERRORS.get(idx))
        {
            return Self::Utility { code, name };
        }
        Self::Unknown(code)
    }

    /// Raw return code.
    pub fn code(&self) -> i32 {
        match *self {
            Self::Success => 0,
            Self::Device { code, .. } | Self::Utility { code, .. } | Self::Unknown(code) => code,
        }
    }

    /// Symbolic name, `ERR_UNKNOWN` outside the tables.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => DEVICE_ERRORS[0],
            Self::Device { name, .. } | Self::Utility { name, .. } => name,
            Self::Unknown(_) => "ERR_UNKNOWN",
        }
    }

    /// True only for [`VendorStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for VendorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = match self {
            Self::Success => "ok",
            Self::Device { .. } => "device",
            Self::Utility { .. } => "utility",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "Ret={} Err={} ({})", self.code(), self.name(), range)
    }
}

// =============================================================================
// Feature names
// =============================================================================

/// Feature names understood by the camera library.
pub mod feature {
    #![allow(missing_docs)]

    pub const SENSOR_COOLING: &str = "SensorCooling";
    pub const METADATA_ENABLE: &str = "MetadataEnable";
    pub const METADATA_TIMESTAMP: &str = "MetadataTimestamp";
    pub const SPURIOUS_NOISE_FILTER: &str = "SpuriousNoiseFilter";
    pub const STATIC_BLEMISH_CORRECTION: &str = "StaticBlemishCorrection";
    pub const ROLLING_SHUTTER_GLOBAL_CLEAR: &str = "RollingShutterGlobalClear";
    pub const SHUTTERING_MODE: &str = "ElectronicShutteringMode";
    pub const SENSOR_READOUT_MODE: &str = "SensorReadoutMode";
    pub const PRE_AMP_GAIN: &str = "SimplePreAmpGainControl";
    pub const PIXEL_ENCODING: &str = "PixelEncoding";
    pub const PIXEL_READOUT_RATE: &str = "PixelReadoutRate";
    pub const CYCLE_MODE: &str = "CycleMode";
    pub const AOI_BINNING: &str = "AOIBinning";
    pub const TRIGGER_MODE: &str = "TriggerMode";
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    pub const FULL_AOI_CONTROL: &str = "FullAOIControl";
    pub const SERIAL_NUMBER: &str = "SerialNumber";
    pub const FIRMWARE_VERSION: &str = "FirmwareVersion";
    pub const READOUT_TIME: &str = "ReadoutTime";
    pub const BYTES_PER_PIXEL: &str = "BytesPerPixel";
    pub const PIXEL_WIDTH: &str = "PixelWidth";
    pub const PIXEL_HEIGHT: &str = "PixelHeight";
    pub const SENSOR_WIDTH: &str = "SensorWidth";
    pub const SENSOR_HEIGHT: &str = "SensorHeight";
    pub const CLOCK_FREQUENCY: &str = "TimestampClockFrequency";
    pub const IMAGE_SIZE_BYTES: &str = "ImageSizeBytes";
    pub const SENSOR_TEMPERATURE: &str = "SensorTemperature";
    pub const TEMPERATURE_STATUS: &str = "TemperatureStatus";
    pub const CAMERA_ACQUIRING: &str = "CameraAcquiring";

    pub const ACQUISITION_START: &str = "AcquisitionStart";
    pub const ACQUISITION_STOP: &str = "AcquisitionStop";
    pub const CLOCK_RESET: &str = "TimestampClockReset";
    pub const SOFTWARE_TRIGGER: &str = "SoftwareTrigger";
}

/// Temperature status string reported once cooling has settled.
pub const TEMPERATURE_STABILISED: &str = "Stabilised";
