//! The transport trait the core is built on.

use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::types::{ListenerId, NotificationHandle, NotificationRequest, VariableHandle};
use crate::value::Value;

/// A single occurrence on a transport's notification feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    /// The registration this notification belongs to
    pub handle: NotificationHandle,
    /// The decoded value, or an error the device reported for this handle
    pub payload: std::result::Result<Value, TransportError>,
}

impl RawNotification {
    /// A notification carrying a value.
    pub fn value(handle: NotificationHandle, value: Value) -> Self {
        Self {
            handle,
            payload: Ok(value),
        }
    }

    /// A notification carrying a device-side error for the handle.
    pub fn error(handle: NotificationHandle, error: TransportError) -> Self {
        Self {
            handle,
            payload: Err(error),
        }
    }
}

/// Callback invoked for every notification on a session's feed.
///
/// Called from the transport's own worker thread, never from the thread that
/// registered the notification.
pub type NotificationListener = Arc<dyn Fn(&RawNotification) + Send + Sync>;

/// A connected device client.
///
/// One value of this trait is one transport session: a reconnect replaces the
/// whole object, it never mutates an existing one. Handle identifiers returned
/// by one session must never be passed to another.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Every method may be called from any
/// thread, including from inside a [`NotificationListener`].
pub trait Transport: Send + Sync {
    /// Register a change notification for a variable.
    ///
    /// The device sends an initial notification with the current value once
    /// the registration is in place. That notification may arrive before this
    /// method returns.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownVariable` or `TransportError::TypeMismatch`
    /// if the device rejects the variable.
    fn register_notification(&self, request: &NotificationRequest) -> Result<NotificationHandle>;

    /// Remove a change notification.
    fn delete_notification(&self, handle: NotificationHandle) -> Result<()>;

    /// Resolve a variable name to a write handle.
    fn create_write_handle(&self, variable: &str) -> Result<VariableHandle>;

    /// Release a write handle.
    fn delete_write_handle(&self, handle: VariableHandle) -> Result<()>;

    /// Write a value through a write handle.
    fn write_by_handle(&self, handle: VariableHandle, value: &Value) -> Result<()>;

    /// Attach a listener to the notification feed.
    fn add_listener(&self, listener: NotificationListener) -> Result<ListenerId>;

    /// Detach a listener from the notification feed.
    fn remove_listener(&self, id: ListenerId) -> Result<()>;

    /// Whether the session is currently usable.
    fn is_connected(&self) -> bool;
}
