//! Core types for the plcrx-transport crate.

use std::time::Duration;

use crate::value::ValueType;

/// Opaque identifier of a device-side change notification registration.
///
/// A handle is only meaningful on the session that issued it.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NotificationHandle(u32);

impl NotificationHandle {
    /// Create a notification handle from the raw device value.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw device value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NotificationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notify-{}", self.0)
    }
}

/// Opaque identifier of a variable write handle.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct VariableHandle(u32);

impl VariableHandle {
    /// Create a variable handle from the raw device value.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw device value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VariableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "var-{}", self.0)
    }
}

/// Identifier of a listener attached to a transport's notification feed.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Create a listener id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// How the device should emit notifications for a variable.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default)]
pub enum TransmissionMode {
    /// Notify when the value changes, checked at most once per cycle
    #[default]
    OnChange,
    /// Notify every cycle, changed or not
    Cyclic,
}

impl TransmissionMode {
    /// Wire code used by ADS-style routers.
    pub fn code(&self) -> u32 {
        match self {
            TransmissionMode::OnChange => 4,
            TransmissionMode::Cyclic => 3,
        }
    }
}

/// Everything a transport needs to register a change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    /// Full variable name, i.e. "MAIN.var1"
    pub variable: String,
    /// Update policy
    pub mode: TransmissionMode,
    /// Interval at which the device checks the variable
    pub cycle_time: Duration,
    /// Maximum time the device may hold back a notification
    pub max_delay: Duration,
    /// How the payload should be decoded
    pub value_type: ValueType,
}

impl NotificationRequest {
    /// Create a request with no max delay.
    pub fn new(
        variable: impl Into<String>,
        mode: TransmissionMode,
        cycle_time: Duration,
        value_type: ValueType,
    ) -> Self {
        Self {
            variable: variable.into(),
            mode,
            cycle_time,
            max_delay: Duration::ZERO,
            value_type,
        }
    }

    /// Set the max delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}
