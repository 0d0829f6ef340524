//! Transport sessions and the handles scoped to them
//!
//! A [`TransportSession`] wraps one connected transport. Every device-side
//! resource created through it ([`HandleRegistration`], [`WriteHandle`]) keeps
//! the session alive and is released against that same session when dropped,
//! so a handle can never be used with, or deleted from, a different session.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use plcrx_transport::{
    NotificationHandle, NotificationRequest, Transport, TransportError, Value, VariableHandle,
};
use tracing::{debug, warn};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a transport session
///
/// Ids increase monotonically, so a later session always compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One connected transport
///
/// Sessions are never mutated after creation. A reconnect creates a new
/// session and the old one lives on only as long as handles still refer to it.
pub struct TransportSession {
    id: SessionId,
    transport: Arc<dyn Transport>,
}

impl TransportSession {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::next(),
            transport,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Register a change notification owned by the returned guard
    pub fn register(
        self: &Arc<Self>,
        request: &NotificationRequest,
    ) -> Result<HandleRegistration, TransportError> {
        let handle = self.transport.register_notification(request)?;
        debug!(
            session = %self.id,
            %handle,
            variable = %request.variable,
            mode = ?request.mode,
            "Registered notification"
        );

        Ok(HandleRegistration {
            handle,
            variable: request.variable.clone(),
            session: Arc::clone(self),
        })
    }

    /// Resolve a write handle owned by the returned guard
    pub fn create_write_handle(self: &Arc<Self>, variable: &str) -> Result<WriteHandle, TransportError> {
        let handle = self.transport.create_write_handle(variable)?;
        debug!(session = %self.id, %handle, variable, "Created write handle");

        Ok(WriteHandle {
            handle,
            variable: variable.to_string(),
            session: Arc::clone(self),
        })
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id)
            .field("connected", &self.transport.is_connected())
            .finish()
    }
}

/// An outstanding notification registration
///
/// Dropping the registration deletes it on its own session. Deletion is
/// best-effort: failures are logged and otherwise ignored.
pub struct HandleRegistration {
    handle: NotificationHandle,
    variable: String,
    session: Arc<TransportSession>,
}

impl HandleRegistration {
    pub fn handle(&self) -> NotificationHandle {
        self.handle
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }
}

impl Drop for HandleRegistration {
    fn drop(&mut self) {
        match self.session.transport.delete_notification(self.handle) {
            Ok(()) => debug!(
                session = %self.session.id,
                handle = %self.handle,
                variable = %self.variable,
                "Deleted notification"
            ),
            Err(e) => warn!(
                session = %self.session.id,
                handle = %self.handle,
                variable = %self.variable,
                error = %e,
                "Failed to delete notification; ignoring"
            ),
        }
    }
}

impl fmt::Debug for HandleRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistration")
            .field("handle", &self.handle)
            .field("variable", &self.variable)
            .field("session", &self.session.id)
            .finish()
    }
}

/// A resolved write handle, released on drop
pub struct WriteHandle {
    handle: VariableHandle,
    variable: String,
    session: Arc<TransportSession>,
}

impl WriteHandle {
    pub fn handle(&self) -> VariableHandle {
        self.handle
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Write synchronously on the calling thread
    pub fn write(&self, value: &Value) -> Result<(), TransportError> {
        self.session.transport.write_by_handle(self.handle, value)
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if let Err(e) = self.session.transport.delete_write_handle(self.handle) {
            warn!(
                session = %self.session.id,
                handle = %self.handle,
                variable = %self.variable,
                error = %e,
                "Failed to delete write handle; ignoring"
            );
        } else {
            debug!(session = %self.session.id, handle = %self.handle, "Deleted write handle");
        }
    }
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle")
            .field("handle", &self.handle)
            .field("variable", &self.variable)
            .field("session", &self.session.id)
            .finish()
    }
}
