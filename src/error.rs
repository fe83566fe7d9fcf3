//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition engine.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failure classes of an observation, from configuration issues to
//! exhausted hardware retries and missed frames.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically parse or type errors in the
//!   configuration file or environment.
//! - **`Configuration`**: Semantic errors caught by `Settings::validate`.
//! - **`Hardware`**: A camera SDK call that still failed after every retry attempt.
//!   Carries the operation, the attempt count and the classified vendor status.
//! - **`InvalidOperation`**: Programmer error, e.g. an operation with an empty feature
//!   name or a result of the wrong type. Never retried.
//! - **`Timeout`** / **`MissedFrame`**: A bounded wait expired. Always fatal to the
//!   observation.
//! - **`Allocation`**: The image buffer pool could not be allocated.
//! - **`Rotator`**, **`Sync`**, **`Storage`**: Failures of the rotation stage link, the
//!   cross-process signalling channel and the frame sink respectively.
//!
//! Component functions return these as values; only the orchestrator decides whether
//! an error ends the observation.

use crate::hardware::andor::VendorStatus;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised while configuring and running an observation.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration loaded but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure outside the device links.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A vendor call failed on every attempt.
    #[error("{operation} failed after {attempts} attempt(s): {status}")]
    Hardware {
        /// Human readable operation, e.g. `SetFloat(ExposureTime, 0.45)`.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// Classified status of the last attempt.
        status: VendorStatus,
    },

    /// Programmer error; retrying cannot help.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A bounded wait expired.
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The budget that expired.
        after: Duration,
    },

    /// No filled buffer arrived for a frame.
    #[error("Missed frame {index}: no buffer within {after:?} ({status})")]
    MissedFrame {
        /// Logical frame index.
        index: usize,
        /// Wait budget for this frame.
        after: Duration,
        /// Status reported by the wait call.
        status: VendorStatus,
    },

    /// The image buffer pool could not be allocated.
    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    /// Rotation stage command or link failure.
    #[error("Rotator error: {0}")]
    Rotator(String),

    /// Cross-process signalling failure.
    #[error("Sync channel error: {0}")]
    Sync(String),

    /// The frame sink rejected a frame.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Teardown ran after a failure and some of its steps failed too.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Shorthand for a timeout on `what`.
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Rotator("MOV 1 10 rejected".to_string());
        assert_eq!(err.to_string(), "Rotator error: MOV 1 10 rejected");
    }

    #[test]
    fn test_hardware_error_names_operation_and_status() {
        let err = DaqError::Hardware {
            operation: "Command(AcquisitionStart)".into(),
            attempts: 3,
            status: VendorStatus::classify(13),
        };
        let text = err.to_string();
        assert!(text.contains("AcquisitionStart"));
        assert!(text.contains("3 attempt"));
        assert!(text.contains("TIMEDOUT"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Rotator("TRO 1 0 rejected".into()),
            DaqError::timeout("camera close", Duration::from_secs(1)),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
