//! Closed set of camera library operations.
//!
//! Every call the acquisition engine makes into the camera library is one
//! [`HardwareOperation`] value. The SDK implementation matches on it and performs
//! exactly one vendor call per invocation.

use crate::error::{AppResult, DaqError};
use std::fmt;

/// One camera library call with its typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareOperation {
    /// Open the camera at a USB index.
    Open {
        /// Device index as enumerated by the library.
        index: usize,
    },
    /// Set a boolean feature.
    SetBool {
        /// Feature name.
        feature: &'static str,
        /// New value.
        value: bool,
    },
    /// Set an enumerated feature by its string value.
    SetEnumString {
        /// Feature name.
        feature: &'static str,
        /// Enumerated value, e.g. `"Continuous"`.
        value: String,
    },
    /// Set a floating point feature.
    SetFloat {
        /// Feature name.
        feature: &'static str,
        /// New value.
        value: f64,
    },
    /// Read a boolean feature.
    GetBool(&'static str),
    /// Read a string feature.
    GetString(&'static str),
    /// Read a floating point feature.
    GetFloat(&'static str),
    /// Read an integer feature.
    GetInt(&'static str),
    /// Read the lower bound of a floating point feature.
    GetFloatMin(&'static str),
    /// Read the upper bound of a floating point feature.
    GetFloatMax(&'static str),
    /// Read the current index of an enumerated feature.
    GetEnumIndex(&'static str),
    /// Read the string for one index of an enumerated feature.
    GetEnumStringByIndex {
        /// Feature name.
        feature: &'static str,
        /// Enumeration index.
        index: usize,
    },
    /// Query whether a feature is read-only.
    IsReadOnly(&'static str),
    /// Run a command feature, e.g. `AcquisitionStart`.
    Command(&'static str),
    /// Discard queued and filled buffers.
    Flush,
    /// Release the camera handle.
    Close,
}

impl HardwareOperation {
    /// Feature name carried by the operation, if any.
    pub fn feature(&self) -> Option<&'static str> {
        match self {
            Self::SetBool { feature, .. }
            | Self::SetEnumString { feature, .. }
            | Self::SetFloat { feature, .. }
            | Self::GetEnumStringByIndex { feature, .. } => Some(feature),
            Self::GetBool(feature)
            | Self::GetString(feature)
            | Self::GetFloat(feature)
            | Self::GetInt(feature)
            | Self::GetFloatMin(feature)
            | Self::GetFloatMax(feature)
            | Self::GetEnumIndex(feature)
            | Self::IsReadOnly(feature)
            | Self::Command(feature) => Some(feature),
            Self::Open { .. } | Self::Flush | Self::Close => None,
        }
    }

    /// Reject operations that no amount of retrying can make succeed.
    ///
    /// # Errors
    /// Returns [`DaqError::InvalidOperation`] for an empty feature name.
    pub fn validate(&self) -> AppResult<()> {
        match self.feature() {
            Some(name) if name.trim().is_empty() => Err(DaqError::InvalidOperation(format!(
                "{self}: empty feature name"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for HardwareOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { index } => write!(f, "Open({index})"),
            Self::SetBool { feature, value } => write!(f, "SetBool({feature}, {value})"),
            Self::SetEnumString { feature, value } => {
                write!(f, "SetEnumString({feature}, {value})")
            }
            Self::SetFloat { feature, value } => write!(f, "SetFloat({feature}, {value})"),
            Self::GetBool(feature) => write!(f, "GetBool({feature})"),
            Self::GetString(feature) => write!(f, "GetString({feature})"),
            Self::GetFloat(feature) => write!(f, "GetFloat({feature})"),
            Self::GetInt(feature) => write!(f, "GetInt({feature})"),
            Self::GetFloatMin(feature) => write!(f, "GetFloatMin({feature})"),
            Self::GetFloatMax(feature) => write!(f, "GetFloatMax({feature})"),
            Self::GetEnumIndex(feature) => write!(f, "GetEnumIndex({feature})"),
            Self::GetEnumStringByIndex { feature, index } => {
                write!(f, "GetEnumStringByIndex({feature}, {index})")
            }
            Self::IsReadOnly(feature) => write!(f, "IsReadOnly({feature})"),
            Self::Command(feature) => write!(f, "Command({feature})"),
            Self::Flush => f.write_str("Flush"),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// Value produced by a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpValue {
    /// Setters, commands, open, flush and close.
    Unit,
    /// Boolean reads.
    Bool(bool),
    /// Floating point reads and bounds.
    Float(f64),
    /// Integer reads.
    Int(i64),
    /// String reads.
    Text(String),
    /// Enumeration index reads.
    Index(usize),
}

impl OpValue {
    fn mismatch(&self, wanted: &str) -> DaqError {
        DaqError::InvalidOperation(format!("expected {wanted} result, got {self:?}"))
    }

    /// Unwrap a boolean result.
    pub fn into_bool(self) -> AppResult<bool> {
        match self {
            Self::Bool(v) => Ok(v),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Unwrap a float result.
    pub fn into_float(self) -> AppResult<f64> {
        match self {
            Self::Float(v) => Ok(v),
            other => Err(other.mismatch("float")),
        }
    }

    /// Unwrap an integer result.
    pub fn into_int(self) -> AppResult<i64> {
        match self {
            Self::Int(v) => Ok(v),
            other => Err(other.mismatch("integer")),
        }
    }

    /// Unwrap a string result.
    pub fn into_text(self) -> AppResult<String> {
        match self {
            Self::Text(v) => Ok(v),
            other => Err(other.mismatch("string")),
        }
    }

    /// Unwrap an enumeration index result.
    pub fn into_index(self) -> AppResult<usize> {
        match self {
            Self::Index(v) => Ok(v),
            other => Err(other.mismatch("index")),
        }
    }
}
