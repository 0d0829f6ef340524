//! Configuration types for the plcrx client
//!
//! This module defines the settings a `PlcRxClient` applies to every
//! notification registration it issues, plus the sizing of its internal
//! channels.

use std::time::Duration;

use plcrx_transport::{TransmissionMode, MAX_STRING_CAPACITY};

use crate::error::RxError;

/// Configuration for a `PlcRxClient`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Cycle time used by `observe_default`
    /// Default: 100 ms
    pub default_cycle_time: Duration,

    /// Transmission mode used by `observe_default`
    /// Default: OnChange
    pub default_mode: TransmissionMode,

    /// Maximum time the device may hold back a notification
    /// Default: 0 (send immediately)
    pub max_delay: Duration,

    /// Character capacity assumed for `String` variables
    /// Default: 80 (IEC `STRING` without explicit length)
    pub string_capacity: usize,

    /// Buffer size of the reconnect signal broadcast
    /// Default: 16
    pub reconnect_signal_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_cycle_time: Duration::from_millis(100),
            default_mode: TransmissionMode::OnChange,
            max_delay: Duration::ZERO,
            string_capacity: 80,
            reconnect_signal_capacity: 16,
        }
    }
}

impl ClientConfig {
    /// Create a new ClientConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ClientConfig tuned for low-latency HMIs
    pub fn fast() -> Self {
        Self {
            default_cycle_time: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), RxError> {
        if self.string_capacity == 0 || self.string_capacity > MAX_STRING_CAPACITY {
            return Err(RxError::Configuration(format!(
                "String capacity must be between 1 and {}",
                MAX_STRING_CAPACITY
            )));
        }

        if self.reconnect_signal_capacity == 0 {
            return Err(RxError::Configuration(
                "Reconnect signal capacity must be greater than 0".to_string(),
            ));
        }

        if self.default_mode == TransmissionMode::Cyclic && self.default_cycle_time.is_zero() {
            return Err(RxError::Configuration(
                "Cyclic notifications need a non-zero cycle time".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_cycle_time(mut self, cycle_time: Duration) -> Self {
        self.default_cycle_time = cycle_time;
        self
    }

    pub fn with_mode(mut self, mode: TransmissionMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_string_capacity(mut self, capacity: usize) -> Self {
        self.string_capacity = capacity;
        self
    }

    pub fn with_reconnect_signal_capacity(mut self, capacity: usize) -> Self {
        self.reconnect_signal_capacity = capacity;
        self
    }
}
