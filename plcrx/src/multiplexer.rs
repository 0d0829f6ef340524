//! One shared listener per session, fanned out to many taps
//!
//! The transport feed carries notifications for every registration of a
//! session. Instead of attaching one transport listener per variable, each
//! session gets a single [`NotificationMultiplexer`] that hands every raw
//! notification to all installed taps; taps filter by handle themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use plcrx_transport::{ListenerId, RawNotification, TransportError};
use tracing::{debug, trace, warn};

use crate::session::{SessionId, TransportSession};

/// Callback receiving every notification of the session
pub type Tap = Arc<dyn Fn(&RawNotification) + Send + Sync>;

/// Identifies an installed tap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapId(u64);

#[derive(Default)]
struct Lifecycle {
    listener: Option<ListenerId>,
    closed: bool,
}

/// Broadcasts a session's notification feed to per-stream taps
///
/// The transport listener is attached with the first tap and detached with
/// the last one. Dispatch reads an immutable snapshot of the taps and never
/// waits on attach or detach.
pub struct NotificationMultiplexer {
    session: Arc<TransportSession>,
    taps: RwLock<Arc<[(TapId, Tap)]>>,
    // Serializes attach/detach; never taken on the dispatch path
    lifecycle: Mutex<Lifecycle>,
    next_tap: AtomicU64,
    this: Weak<NotificationMultiplexer>,
}

impl NotificationMultiplexer {
    pub fn new(session: Arc<TransportSession>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            session,
            taps: RwLock::new(Arc::from(Vec::new())),
            lifecycle: Mutex::new(Lifecycle::default()),
            next_tap: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Install a tap, attaching to the transport feed if it is the first
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotConnected` once the multiplexer is closed,
    /// or whatever the transport reports when attaching its listener fails.
    pub fn add_tap(&self, tap: Tap) -> Result<TapId, TransportError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            return Err(TransportError::NotConnected);
        }

        if lifecycle.listener.is_none() {
            let this = self.this.clone();
            let listener = self.session.transport().add_listener(Arc::new(move |n: &RawNotification| {
                if let Some(mux) = this.upgrade() {
                    mux.dispatch(n);
                }
            }))?;
            debug!(session = %self.session.id(), "Attached to notification feed");
            lifecycle.listener = Some(listener);
        }

        let id = TapId(self.next_tap.fetch_add(1, Ordering::Relaxed));
        let mut taps = self.taps.write();
        let mut next: Vec<(TapId, Tap)> = taps.iter().cloned().collect();
        next.push((id, tap));
        *taps = Arc::from(next);
        Ok(id)
    }

    /// Remove a tap, detaching from the feed if it was the last
    ///
    /// Unknown ids are ignored.
    pub fn remove_tap(&self, id: TapId) {
        let mut lifecycle = self.lifecycle.lock();
        let remaining = {
            let mut taps = self.taps.write();
            if !taps.iter().any(|(t, _)| *t == id) {
                return;
            }
            let next: Vec<(TapId, Tap)> = taps.iter().filter(|(t, _)| *t != id).cloned().collect();
            let remaining = next.len();
            *taps = Arc::from(next);
            remaining
        };

        if remaining == 0 {
            self.detach(&mut lifecycle);
        }
    }

    /// Stop delivery and detach from the transport feed
    ///
    /// Later `add_tap` calls fail. Closing twice is harmless.
    pub fn close(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            return;
        }
        lifecycle.closed = true;
        *self.taps.write() = Arc::from(Vec::new());
        self.detach(&mut lifecycle);
        debug!(session = %self.session.id(), "Closed notification multiplexer");
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    pub fn tap_count(&self) -> usize {
        self.taps.read().len()
    }

    pub fn is_attached(&self) -> bool {
        self.lifecycle.lock().listener.is_some()
    }

    fn dispatch(&self, notification: &RawNotification) {
        let taps = Arc::clone(&*self.taps.read());
        trace!(handle = %notification.handle, taps = taps.len(), "Dispatching notification");
        for (_, tap) in taps.iter() {
            tap(notification);
        }
    }

    fn detach(&self, lifecycle: &mut Lifecycle) {
        if let Some(listener) = lifecycle.listener.take() {
            match self.session.transport().remove_listener(listener) {
                Ok(()) => debug!(session = %self.session.id(), "Detached from notification feed"),
                Err(e) => warn!(
                    session = %self.session.id(),
                    error = %e,
                    "Failed to detach from notification feed; ignoring"
                ),
            }
        }
    }
}

impl Drop for NotificationMultiplexer {
    fn drop(&mut self) {
        let mut lifecycle = self.lifecycle.lock();
        self.detach(&mut lifecycle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plcrx_transport::{LoopbackTransport, NotificationHandle, Value};

    fn setup() -> (Arc<LoopbackTransport>, Arc<NotificationMultiplexer>) {
        let transport = Arc::new(LoopbackTransport::new());
        let session = TransportSession::new(transport.clone());
        (transport, NotificationMultiplexer::new(session))
    }

    fn recording_tap() -> (Tap, Arc<Mutex<Vec<RawNotification>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |n: &RawNotification| sink.lock().push(n.clone())), seen)
    }

    #[test]
    fn test_single_listener_for_many_taps() {
        let (transport, mux) = setup();
        let (tap_a, seen_a) = recording_tap();
        let (tap_b, seen_b) = recording_tap();

        let a = mux.add_tap(tap_a).unwrap();
        let _b = mux.add_tap(tap_b).unwrap();
        assert_eq!(transport.counts().add_listener, 1);
        assert_eq!(transport.listener_count(), 1);

        let notification = RawNotification::value(NotificationHandle::new(9), Value::Int(1));
        transport.emit(notification.clone());
        assert_eq!(*seen_a.lock(), vec![notification.clone()]);
        assert_eq!(*seen_b.lock(), vec![notification]);

        mux.remove_tap(a);
        assert_eq!(mux.tap_count(), 1);
        assert!(mux.is_attached());
    }

    #[test]
    fn test_last_tap_detaches() {
        let (transport, mux) = setup();
        let (tap, _) = recording_tap();

        let id = mux.add_tap(tap.clone()).unwrap();
        mux.remove_tap(id);
        mux.remove_tap(id);
        assert_eq!(transport.listener_count(), 0);
        assert_eq!(transport.counts().remove_listener, 1);

        // Reattaches on demand
        mux.add_tap(tap).unwrap();
        assert_eq!(transport.counts().add_listener, 2);
    }

    #[test]
    fn test_close_stops_delivery() {
        let (transport, mux) = setup();
        let (tap, seen) = recording_tap();
        mux.add_tap(tap.clone()).unwrap();

        mux.close();
        mux.close();
        transport.emit(RawNotification::value(NotificationHandle::new(1), Value::Bool(true)));

        assert!(seen.lock().is_empty());
        assert_eq!(transport.listener_count(), 0);
        assert!(mux.is_closed());
        assert_eq!(mux.add_tap(tap), Err(TransportError::NotConnected));
    }

    #[test]
    fn test_attach_failure_reported() {
        let (transport, mux) = setup();
        transport.disconnect();
        let (tap, _) = recording_tap();

        assert_eq!(mux.add_tap(tap), Err(TransportError::NotConnected));
        assert_eq!(mux.tap_count(), 0);
    }

    #[test]
    fn test_drop_detaches() {
        let (transport, mux) = setup();
        let (tap, _) = recording_tap();
        mux.add_tap(tap).unwrap();

        drop(mux);
        assert_eq!(transport.listener_count(), 0);
    }
}
