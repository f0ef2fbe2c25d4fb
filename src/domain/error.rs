//! Error types for the BLE session
//!
//! Only malformed input reaches callers of the session as an error.
//! Platform faults are turned into
//! [`ResultCode`](crate::domain::result_code::ResultCode)s, booleans or
//! status values where they occur.

use thiserror::Error;

/// Malformed user input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid MAC address '{0}': expected 12 hex digits, optionally separated by ':'")]
    InvalidMac(String),

    #[error("Invalid GATT UUID '{0}'")]
    InvalidUuid(String),
}

/// A call into the platform BLE stack failed outright
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// The OS returned a failure code
    #[error("Platform call failed ({code:#010X}): {message}")]
    Os { code: i32, message: String },

    /// The platform could not provide the requested object
    #[error("Platform resource unavailable: {0}")]
    Unavailable(String),
}

impl PlatformError {
    pub fn unavailable(what: impl Into<String>) -> Self {
        Self::Unavailable(what.into())
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for PlatformError {
    fn from(e: windows::core::Error) -> Self {
        Self::Os {
            code: e.code().0,
            message: e.message().to_string(),
        }
    }
}
