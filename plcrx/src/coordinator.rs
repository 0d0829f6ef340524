//! Session replacement
//!
//! The [`ReconnectCoordinator`] owns the current [`SessionContext`]: the live
//! transport session together with its notification multiplexer. A reconnect
//! swaps in a new context, closes the old multiplexer and rewires every live
//! variable stream against the new session. Stream identity is untouched, so
//! subscribers keep receiving values without re-subscribing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use plcrx_transport::Transport;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::multiplexer::NotificationMultiplexer;
use crate::session::{SessionId, TransportSession};

/// A session and the multiplexer over its feed
pub struct SessionContext {
    pub session: Arc<TransportSession>,
    pub multiplexer: Arc<NotificationMultiplexer>,
}

impl SessionContext {
    fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let session = TransportSession::new(transport);
        let multiplexer = NotificationMultiplexer::new(Arc::clone(&session));
        Arc::new(Self {
            session,
            multiplexer,
        })
    }
}

/// Emitted after every session replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSignal {
    pub previous: SessionId,
    pub current: SessionId,
}

/// Something that has to be rebuilt when the session changes
pub(crate) trait Rewire: Send + Sync {
    /// Called after `current` became the active session
    ///
    /// Must not fail: problems are reported to the rewired component's own
    /// subscribers.
    fn on_reconnect(&self, current: SessionId);
}

/// Tracks the active transport session and rewires dependents on change
pub struct ReconnectCoordinator {
    current: RwLock<Arc<SessionContext>>,
    reconnect_gate: Mutex<()>,
    dependents: DashMap<u64, Weak<dyn Rewire>>,
    next_dependent: AtomicU64,
    signals: broadcast::Sender<ReconnectSignal>,
    reconnects: AtomicU64,
}

impl ReconnectCoordinator {
    pub fn new(transport: Arc<dyn Transport>, signal_capacity: usize) -> Self {
        let (signals, _) = broadcast::channel(signal_capacity.max(1));
        let context = SessionContext::new(transport);
        debug!(session = %context.session.id(), "Coordinator started");

        Self {
            current: RwLock::new(context),
            reconnect_gate: Mutex::new(()),
            dependents: DashMap::new(),
            next_dependent: AtomicU64::new(1),
            signals,
            reconnects: AtomicU64::new(0),
        }
    }

    /// Snapshot of the active session and multiplexer
    pub fn current(&self) -> Arc<SessionContext> {
        Arc::clone(&*self.current.read())
    }

    pub fn session_id(&self) -> SessionId {
        self.current.read().session.id()
    }

    /// Whether `session` is still the active one
    pub fn is_current(&self, session: SessionId) -> bool {
        self.session_id() == session
    }

    /// Replace the transport session
    ///
    /// Installs the new session, closes the previous multiplexer, rewires every
    /// live stream and finally broadcasts a [`ReconnectSignal`]. Concurrent
    /// calls run one after another. Nothing here fails: per-stream problems
    /// surface on that stream.
    ///
    /// Must not be called from inside an observer callback.
    pub fn reconnect(&self, transport: Arc<dyn Transport>) -> ReconnectSignal {
        let _gate = self.reconnect_gate.lock();

        let next = SessionContext::new(transport);
        let previous = std::mem::replace(&mut *self.current.write(), Arc::clone(&next));
        let signal = ReconnectSignal {
            previous: previous.session.id(),
            current: next.session.id(),
        };
        info!(previous = %signal.previous, current = %signal.current, "Reconnecting");

        previous.multiplexer.close();

        // Collect first so no map shard is locked while dependents run
        let dependents: Vec<Arc<dyn Rewire>> = self
            .dependents
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.dependents.retain(|_, dependent| dependent.strong_count() > 0);

        debug!(streams = dependents.len(), "Rewiring streams");
        for dependent in dependents {
            dependent.on_reconnect(signal.current);
        }

        self.reconnects.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine
        let _ = self.signals.send(signal);
        signal
    }

    /// Receive a [`ReconnectSignal`] after every future reconnect
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectSignal> {
        self.signals.subscribe()
    }

    /// Number of completed reconnects
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn register(&self, dependent: Weak<dyn Rewire>) -> u64 {
        let id = self.next_dependent.fetch_add(1, Ordering::Relaxed);
        self.dependents.insert(id, dependent);
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.dependents.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn dependent_count(&self) -> usize {
        self.dependents.len()
    }
}

impl std::fmt::Debug for ReconnectCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectCoordinator")
            .field("session", &self.session_id())
            .field("reconnects", &self.reconnect_count())
            .finish()
    }
}
