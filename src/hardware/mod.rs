//! Hardware Communication Layer
//!
//! Device seams, vendor status tables, the retrying dispatcher and the simulated
//! devices used by tests and the mock binary mode.

pub mod andor;
pub mod capabilities;
pub mod dispatch;
#[cfg(feature = "instrument_serial")]
pub mod gcs_serial;
pub mod mock;
pub mod operation;

pub use andor::VendorStatus;
pub use capabilities::{CameraSdk, GcsLink};
pub use dispatch::Dispatcher;
#[cfg(feature = "instrument_serial")]
pub use gcs_serial::GcsSerialLink;
pub use mock::{MockCameraSdk, MockGcsLink};
pub use operation::{HardwareOperation, OpValue};
