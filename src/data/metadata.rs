//! Per-frame metadata: device timestamps, angle bookkeeping and the frame record.
//!
//! # Metadata trailer
//!
//! With `MetadataEnable` and `MetadataTimestamp` set, the camera appends a chain of
//! fields after the pixels. Each field is laid out as
//!
//! ```text
//! [data: length - 4 bytes][id: u32 LE][length: u32 LE]
//! ```
//!
//! so the chain is read backwards from the end of the image. Id 1 carries the 64-bit
//! timestamp clock; id 0 (frame data) and id 7 (frame info) are skipped.
//!
//! # Angle bookkeeping
//!
//! Requested angles accumulate without wrapping (`angle[i] = angle[i-1] + step`). Only
//! the values written to the frame record are wrapped into `[0, 360)`.

use bytes::Buf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field id of the frame data block.
pub const CID_FRAME_DATA: u32 = 0;
/// Field id of the timestamp clock block.
pub const CID_TICKS: u32 = 1;
/// Field id of the frame info block.
pub const CID_FRAME_INFO: u32 = 7;

/// Fields visited before giving up on finding the timestamp.
const MAX_TRAILER_FIELDS: usize = 3;

/// Read the timestamp clock from the metadata trailer at the end of `image`.
///
/// Returns `None` when no timestamp field is found within the last three fields
/// or when a length field points outside the buffer.
pub fn extract_ticks(image: &[u8]) -> Option<u64> {
    let mut end = image.len();
    for _ in 0..MAX_TRAILER_FIELDS {
        let len_at = end.checked_sub(4)?;
        let length = (&image[len_at..end]).get_u32_le() as usize;
        let cid_at = len_at.checked_sub(4)?;
        let cid = (&image[cid_at..len_at]).get_u32_le();
        let data_len = length.checked_sub(4)?;
        let data_at = cid_at.checked_sub(data_len)?;

        if cid == CID_TICKS {
            let mut data = &image[data_at..cid_at];
            return (data.remaining() >= 8).then(|| data.get_u64_le());
        }
        // frame data, frame info and unknown ids
        end = data_at;
    }
    None
}

// =============================================================================
// Angle and clock arithmetic
// =============================================================================

/// Wrap an accumulated angle into `[0, 360)`.
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid rounds tiny negative inputs up to exactly 360.0
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// 1-based rotation number of frame `index`.
pub fn rotation_number(index: usize, cycle_len: usize) -> usize {
    1 + index / cycle_len.max(1)
}

/// 1-based position of frame `index` within its rotation.
pub fn position_in_rotation(index: usize, cycle_len: usize) -> usize {
    1 + index % cycle_len.max(1)
}

/// Converts successive timestamp readings into seconds since the previous frame.
#[derive(Debug, Clone)]
pub struct TickClock {
    frequency: f64,
    previous: Option<u64>,
}

impl TickClock {
    /// Clock running at `frequency` Hz.
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            previous: None,
        }
    }

    /// Seconds since the previous reading; the first reading is measured from the
    /// clock reset.
    pub fn delta(&mut self, ticks: u64) -> f64 {
        let since = self.previous.unwrap_or(0);
        self.previous = Some(ticks);
        if self.frequency <= 0.0 {
            return 0.0;
        }
        (ticks as f64 - since as f64) / self.frequency
    }
}

/// Observed end angle and swept arc of one exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcMeasurement {
    /// End angle, wrapped.
    pub end_angle: f64,
    /// Angle swept during the exposure.
    pub arc: f64,
}

impl ArcMeasurement {
    /// Continuous rotation with access to the live rotator position.
    pub fn live(requested: f64, observed: f64) -> Self {
        Self {
            end_angle: wrap_angle(observed),
            arc: observed - requested,
        }
    }

    /// Continuous rotation without rotator access: assume exactly one step.
    pub fn synthesized(requested: f64, step: f64) -> Self {
        Self {
            end_angle: wrap_angle(requested + step),
            arc: step,
        }
    }

    /// Fixed-angle exposure at `observed`. The arc is taken between the unwrapped
    /// angles so a stage settling just short of a 360° boundary reads as a small
    /// negative arc.
    pub fn stationary(requested: f64, observed: f64) -> Self {
        Self {
            end_angle: wrap_angle(observed),
            arc: observed - requested,
        }
    }
}

/// How far the exposure strayed from the trigger interval, in seconds.
pub fn exposure_mismatch(arc: f64, speed: f64, sign: f64, exposure: f64) -> f64 {
    if speed == 0.0 {
        return 0.0;
    }
    (arc / speed - sign * exposure).abs()
}

// =============================================================================
// Frame record
// =============================================================================

/// Observation type of a frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureKind {
    /// Zero-length exposure; uses the device minimum exposure.
    Bias,
    /// Shutter-closed exposure.
    Dark,
    /// Science exposure.
    #[default]
    Expose,
    /// Flat field.
    Flat,
    /// Target acquisition.
    Acquire,
    /// Standard star.
    Standard,
}

impl ExposureKind {
    /// Single-letter code used in file names.
    pub fn code(self) -> char {
        match self {
            Self::Bias => 'b',
            Self::Dark => 'd',
            Self::Expose => 'e',
            Self::Flat => 'f',
            Self::Acquire => 'q',
            Self::Standard => 's',
        }
    }
}

impl fmt::Display for ExposureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Everything known about one captured frame.
///
/// Created when the device hands back a filled buffer; never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Camera index (0 = master).
    pub camera: usize,
    /// Observation type.
    pub kind: ExposureKind,
    /// Logical frame index, 0-based.
    pub index: usize,
    /// Rotation number, 1-based.
    pub rotation: usize,
    /// Position within the rotation, 1-based.
    pub position: usize,
    /// Requested angle, accumulated.
    pub requested_angle: f64,
    /// Requested angle wrapped into `[0, 360)`.
    pub requested_wrapped: f64,
    /// Observed end angle wrapped into `[0, 360)`.
    pub end_angle: f64,
    /// Angle swept during the exposure.
    pub arc: f64,
    /// Device timestamp clock, if the trailer carried one.
    pub ticks: Option<u64>,
    /// Seconds since the previous frame by the device clock.
    pub clock_delta: f64,
    /// Exposure in seconds.
    pub exposure: f64,
    /// Pool slot that held the pixels.
    pub slot: usize,
    /// Wall time when the wait for this frame began.
    pub started: DateTime<Utc>,
    /// Wall time when the frame was handed to the sink.
    pub finished: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(data: &[u8], cid: u32) -> Vec<u8> {
        let mut out = data.to_vec();
        out.extend_from_slice(&cid.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32 + 4).to_le_bytes());
        out
    }

    #[test]
    fn ticks_found_behind_frame_info() {
        let mut image = field(&[0xAA; 32], CID_FRAME_DATA);
        image.extend(field(&123_456_789u64.to_le_bytes(), CID_TICKS));
        image.extend(field(&[1, 2, 3, 4, 5, 6, 7, 8], CID_FRAME_INFO));
        assert_eq!(extract_ticks(&image), Some(123_456_789));
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut image = field(&42u64.to_le_bytes(), CID_TICKS);
        image.extend(field(&[9; 4], 99));
        assert_eq!(extract_ticks(&image), Some(42));
    }

    #[test]
    fn missing_or_malformed_trailer_yields_none() {
        assert_eq!(extract_ticks(&[]), None);
        assert_eq!(extract_ticks(&[0u8; 3]), None);
        // length points past the start of the buffer
        let mut bogus = vec![0u8; 8];
        bogus.extend_from_slice(&CID_TICKS.to_le_bytes());
        bogus.extend_from_slice(&1000u32.to_le_bytes());
        assert_eq!(extract_ticks(&bogus), None);
        // length smaller than the id itself
        let mut short = vec![0u8; 4];
        short.extend_from_slice(&2u32.to_le_bytes());
        assert_eq!(extract_ticks(&short), None);
        // timestamp deeper than three fields
        let mut deep = field(&7u64.to_le_bytes(), CID_TICKS);
        for _ in 0..3 {
            deep.extend(field(&[0; 4], CID_FRAME_INFO));
        }
        assert_eq!(extract_ticks(&deep), None);
    }

    #[test]
    fn wrapped_angles_stay_in_range() {
        for angle in [-1e-18, -0.004, -22.5, -1079.996, 0.0, 359.999, 360.0, 1079.996] {
            let w = wrap_angle(angle);
            assert!((0.0..360.0).contains(&w), "{angle} -> {w}");
        }
        assert!((wrap_angle(-22.5) - 337.5).abs() < 1e-9);
        assert!((wrap_angle(382.5) - 22.5).abs() < 1e-9);
    }

    #[test]
    fn rotation_and_position_numbering() {
        assert_eq!(rotation_number(0, 16), 1);
        assert_eq!(position_in_rotation(0, 16), 1);
        assert_eq!(rotation_number(15, 16), 1);
        assert_eq!(position_in_rotation(15, 16), 16);
        assert_eq!(rotation_number(16, 16), 2);
        assert_eq!(position_in_rotation(16, 16), 1);
        assert_eq!(rotation_number(47, 16), 3);
    }

    #[test]
    fn clock_delta_uses_previous_reading() {
        let mut clock = TickClock::new(100.0);
        assert_eq!(clock.delta(50), 0.5);
        assert_eq!(clock.delta(100), 0.5);
        assert_eq!(clock.delta(400), 3.0);
    }

    #[test]
    fn arc_measurements() {
        let live = ArcMeasurement::live(360.0, 382.4);
        assert!((live.arc - 22.4).abs() < 1e-9);
        assert!((live.end_angle - 22.4).abs() < 1e-9);

        let fake = ArcMeasurement::synthesized(337.5, 22.5);
        assert_eq!(fake.arc, 22.5);
        assert_eq!(fake.end_angle, 0.0);

        let still = ArcMeasurement::stationary(382.5, 382.501);
        assert!((still.arc - 0.001).abs() < 1e-9);
    }

    #[test]
    fn settling_short_of_a_full_turn_is_a_small_arc() {
        let short = ArcMeasurement::stationary(0.0, -0.002);
        assert!((short.arc + 0.002).abs() < 1e-9);
        assert!((short.end_angle - 359.998).abs() < 1e-9);

        let short = ArcMeasurement::stationary(360.0, 359.999);
        assert!((short.arc + 0.001).abs() < 1e-9);

        let over = ArcMeasurement::stationary(720.0, 720.003);
        assert!((over.arc - 0.003).abs() < 1e-9);
        assert!((over.end_angle - 0.003).abs() < 1e-9);
    }

    #[test]
    fn mismatch_compares_arc_time_to_exposure() {
        assert!((exposure_mismatch(22.5, 45.0, 1.0, 0.485) - 0.015).abs() < 1e-9);
        assert!((exposure_mismatch(-22.5, 45.0, -1.0, 0.485) - 0.015).abs() < 1e-9);
        assert_eq!(exposure_mismatch(1.0, 0.0, 0.0, 0.1), 0.0);
    }
}
