//! Acquisition plan: rotation geometry and frame count derived from the settings.
//!
//! The rotator emits one trigger every `step` degrees of travel. A clockwise plan has
//! a positive step, a counter-clockwise plan a negative one, and a static plan moves
//! the rotator to discrete angles between software-triggered exposures.
//!
//! The final travel stops one tolerance short of the last trigger position, so the
//! rotator never emits a trigger past the last frame:
//!
//! ```text
//! clockwise          total * step - tolerance
//! counter-clockwise  total * step + tolerance   (step < 0)
//! ```

use crate::config::{ExposureSetting, ObservationConfig};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Trigger step for 8 images per rotation, degrees.
pub const STEP_8: f64 = 45.0;
/// Trigger step for 16 images per rotation, degrees.
pub const STEP_16: f64 = 22.5;
/// Default run velocity, degrees per second.
pub const DEFAULT_SPEED: f64 = 45.0;
/// Offset travelled before the first trigger position, degrees (unsigned).
pub const PRE_ROLL: f64 = 22.0;
/// Travel limit after which the controller stops triggering, degrees.
pub const MAX_TRAVEL: f64 = 36000.0;
/// Largest number of rotations in one observation.
pub const MAX_CYCLES: usize = 100;

/// Readout margin, in readout times, kept free when the exposure is chosen
/// automatically.
const AUTO_EXPOSURE_READOUTS: f64 = 1.5;

/// Rotation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Positive travel, hardware triggered.
    Clockwise,
    /// Negative travel, hardware triggered.
    CounterClockwise,
    /// Discrete angles, software triggered.
    Static,
}

impl Direction {
    /// +1, -1 or 0.
    pub fn sign(self) -> f64 {
        match self {
            Self::Clockwise => 1.0,
            Self::CounterClockwise => -1.0,
            Self::Static => 0.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clockwise => f.write_str("CW"),
            Self::CounterClockwise => f.write_str("CCW"),
            Self::Static => f.write_str("static"),
        }
    }
}

/// Everything the camera and rotator need to know about the frame sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    /// Rotation direction.
    pub direction: Direction,
    /// Frames per rotation; also the buffer pool depth.
    pub images_per_cycle: usize,
    /// Number of rotations.
    pub cycles: usize,
    /// `images_per_cycle * cycles`.
    pub total_images: usize,
    /// Signed angle between successive frames; 0 for a single fixed angle.
    pub step: f64,
    /// Unsigned rotator velocity, degrees per second.
    pub speed: f64,
    /// Requested angle of the first frame.
    pub start_angle: f64,
    /// On-target tolerance, degrees.
    pub tolerance: f64,
}

impl AcquisitionPlan {
    /// Derive the plan from the observation settings.
    ///
    /// A zero velocity selects a static plan at the default speed. A fixed angle
    /// selects a static plan with zero step at that angle, whatever the velocity.
    ///
    /// # Errors
    /// Returns [`DaqError::Configuration`] for an unsupported image count or number
    /// of rotations, or a non-finite velocity.
    pub fn from_observation(obs: &ObservationConfig, tolerance: f64) -> AppResult<Self> {
        let base_step = match obs.images_per_cycle {
            8 => STEP_8,
            16 => STEP_16,
            n => {
                return Err(DaqError::Configuration(format!(
                    "unsupported images per rotation {n}, use 8 or 16"
                )))
            }
        };
        if !(1..=MAX_CYCLES).contains(&obs.cycles) {
            return Err(DaqError::Configuration(format!(
                "rotations must be 1-{MAX_CYCLES}, got {}",
                obs.cycles
            )));
        }
        if !obs.velocity.is_finite() {
            return Err(DaqError::Configuration(format!(
                "velocity must be finite, got {}",
                obs.velocity
            )));
        }

        let (direction, step, speed, start_angle) = match obs.fixed_angle {
            Some(angle) => (Direction::Static, 0.0, DEFAULT_SPEED, angle),
            None if obs.velocity > 0.0 => (Direction::Clockwise, base_step, obs.velocity, 0.0),
            None if obs.velocity < 0.0 => {
                (Direction::CounterClockwise, -base_step, -obs.velocity, 0.0)
            }
            None => (Direction::Static, base_step, DEFAULT_SPEED, 0.0),
        };

        Ok(Self {
            direction,
            images_per_cycle: obs.images_per_cycle,
            cycles: obs.cycles,
            total_images: obs.images_per_cycle * obs.cycles,
            step,
            speed,
            start_angle,
            tolerance,
        })
    }

    /// Whether the rotator turns continuously and triggers the cameras.
    pub fn is_rotating(&self) -> bool {
        self.direction != Direction::Static
    }

    /// Whether this is a single fixed-angle observation.
    pub fn is_fixed_angle(&self) -> bool {
        self.direction == Direction::Static && self.step == 0.0
    }

    /// Absolute rotator target for the end of a continuous run.
    pub fn final_travel(&self) -> Option<f64> {
        let travel = self.total_images as f64 * self.step;
        match self.direction {
            Direction::Clockwise => Some(travel - self.tolerance),
            Direction::CounterClockwise => Some(travel + self.tolerance),
            Direction::Static => None,
        }
    }

    /// Position the rotator rests at before the run, so it is up to speed when it
    /// passes the first trigger position.
    pub fn pre_roll_angle(&self) -> f64 {
        -self.direction.sign() * PRE_ROLL
    }

    /// Travel at which the controller stops emitting triggers.
    pub fn trigger_end(&self) -> f64 {
        self.direction.sign() * MAX_TRAVEL
    }

    /// Seconds between hardware triggers, for a rotating plan.
    pub fn trigger_interval(&self) -> Option<f64> {
        self.is_rotating().then(|| (self.step / self.speed).abs())
    }

    /// Whether `exposure` leaves no time to read out before the next trigger.
    pub fn overruns(&self, exposure: f64) -> bool {
        self.trigger_interval()
            .is_some_and(|interval| interval <= exposure)
    }

    /// Log a warning if `exposure` will overrun the trigger interval.
    pub fn check_exposure(&self, exposure: f64) {
        if let Some(interval) = self.trigger_interval().filter(|_| self.overruns(exposure)) {
            warn!(exposure, interval, "exposure will overrun trigger interval");
        }
    }

    /// Exposure to program given the configured setting and the sensor readout time.
    ///
    /// `auto` fills the trigger interval less one and a half readouts; it needs a
    /// rotating plan and falls back to `fallback` otherwise.
    pub fn exposure_for(&self, setting: &ExposureSetting, readout_time: f64, fallback: f64) -> f64 {
        match setting {
            ExposureSetting::Seconds(seconds) => *seconds,
            ExposureSetting::Auto(_) => match self.trigger_interval() {
                Some(interval) => interval - AUTO_EXPOSURE_READOUTS * readout_time,
                None => {
                    warn!(fallback, "automatic exposure needs a rotating plan");
                    fallback
                }
            },
        }
    }

    /// Requested angle of frame `index`.
    pub fn requested_angle(&self, index: usize) -> f64 {
        self.start_angle + index as f64 * self.step
    }
}
