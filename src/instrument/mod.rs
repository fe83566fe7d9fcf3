//! Device controllers built on the [`crate::hardware`] seams.
//!
//! - [`camera::CameraController`]: configuration, cooling, buffer queue and the two
//!   acquisition loops.
//! - [`rotator::RotatorController`]: homing, trigger geometry and positioning of
//!   the rotation stage.

pub mod camera;
pub mod rotator;

pub use camera::{CameraController, CameraInfo, CameraState, TriggerMode};
pub use rotator::{RotatorAccess, RotatorController, TriggerGeometry};
