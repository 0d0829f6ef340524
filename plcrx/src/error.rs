//! Error types for plcrx
//!
//! Every error is scoped to the one stream or write binding that caused it.
//! Errors are `Clone` because a single terminal failure is delivered to every
//! subscriber of the failing stream.

use plcrx_transport::{TransportError, ValueType};
use thiserror::Error;

/// Errors produced by plcrx streams, bindings and the client facade
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RxError {
    /// The requested value type is outside the supported set; the transport
    /// was never contacted
    #[error("Variables of type {value_type} are not supported: {reason}")]
    UnsupportedType {
        value_type: ValueType,
        reason: &'static str,
    },

    /// The transport rejected the notification registration, or reported an
    /// error for the handle on its feed
    #[error("Failed to register notification for {variable}: {source}")]
    Registration {
        variable: String,
        #[source]
        source: TransportError,
    },

    /// A notification value could not be converted to the stream's type
    #[error("Failed to decode {variable}: {source}")]
    Decode {
        variable: String,
        #[source]
        source: DecodeError,
    },

    /// The transport could not resolve a write handle
    #[error("Failed to create write handle for {variable}: {source}")]
    WriteHandle {
        variable: String,
        #[source]
        source: TransportError,
    },

    /// A write through a bound handle failed
    #[error("Failed to write {variable}: {source}")]
    Write {
        variable: String,
        #[source]
        source: TransportError,
    },

    /// The current transport session is not connected
    #[error("Transport is not connected")]
    NotConnected,

    /// The client configuration is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The stream ended and no further values will arrive
    #[error("Stream closed")]
    Closed,
}

/// Why a decoded transport value could not become the requested Rust type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The transport delivered a different variant than expected
    #[error("expected {expected}, got {actual}")]
    UnexpectedVariant {
        expected: &'static str,
        actual: &'static str,
    },

    /// A composite payload had the wrong size
    #[error("expected {expected} bytes, got {actual}")]
    Size { expected: usize, actual: usize },

    /// The payload was well-formed but out of range for the target type
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

/// Result type for plcrx operations
pub type Result<T> = std::result::Result<T, RxError>;
