//! Error types for the plcrx-transport crate.

use crate::types::{NotificationHandle, VariableHandle};

/// Errors reported by a device transport.
///
/// Transport errors are `Clone` so the core can hand the same failure to every
/// subscriber of the stream that caused it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The device does not know the requested variable
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// The variable exists but its type does not match the requested type
    #[error("Type mismatch for {variable}: {detail}")]
    TypeMismatch {
        /// The variable name
        variable: String,
        /// What did not match
        detail: String,
    },

    /// A notification handle is not registered on this session
    #[error("Invalid notification handle: {0}")]
    InvalidNotificationHandle(NotificationHandle),

    /// A write handle is not known on this session
    #[error("Invalid variable handle: {0}")]
    InvalidVariableHandle(VariableHandle),

    /// The session is not connected (or no longer connected)
    #[error("Transport is not connected")]
    NotConnected,

    /// The device rejected the request with an error code
    #[error("Request rejected (code {code}): {message}")]
    Rejected {
        /// Device error code
        code: u32,
        /// Human-readable message
        message: String,
    },

    /// A lower-level I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience type alias for Results using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
