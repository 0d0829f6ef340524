//! Ref-counted, reconnect-safe variable streams
//!
//! A [`VariableStream`] is the typed view of one PLC variable under one update
//! policy. The stream registers a device notification when its first
//! subscriber arrives and deletes it when the last one leaves. In between it
//! replays the latest value to late subscribers and rebuilds its registration
//! whenever the [`ReconnectCoordinator`] swaps the transport session.
//!
//! # Registration lifecycle
//!
//! ```text
//!   Idle ──first subscriber──▶ Registering ──handle issued──▶ Active
//!    ▲                              │                           │
//!    └──── last subscriber / terminal error ◀───────────────────┘
//!                                   ▲                           │
//!                                   └──────── reconnect ────────┘
//! ```
//!
//! The stream's tap is installed on the multiplexer before the registration
//! call, so a notification the device sends while the call is in flight is
//! buffered and replayed once the handle id is known.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use plcrx_transport::{
    NotificationHandle, NotificationRequest, RawNotification, TransmissionMode, TransportError,
    ValueType,
};
use tracing::{debug, warn};

use crate::coordinator::{ReconnectCoordinator, Rewire, SessionContext};
use crate::error::{Result, RxError};
use crate::iter::{ValueIter, ValueStream};
use crate::multiplexer::{NotificationMultiplexer, TapId};
use crate::observer::{observer_fn, Observer, Subscription, ValueSource};
use crate::session::{HandleRegistration, SessionId};
use crate::value::{validate, PlcValue};

/// Logical identity of a variable stream
///
/// Two requests with the same key share one registration. Mode and interval
/// are part of the key, so the same variable observed on change and cyclically
/// is registered twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableKey {
    pub name: String,
    pub value_type: ValueType,
    pub mode: TransmissionMode,
    pub interval: Duration,
}

impl VariableKey {
    pub fn new(
        name: impl Into<String>,
        value_type: ValueType,
        mode: TransmissionMode,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            value_type,
            mode,
            interval,
        }
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {:?} @ {:?})",
            self.name, self.value_type, self.mode, self.interval
        )
    }
}

/// A live registration and the tap reading it
struct Binding {
    registration: HandleRegistration,
    multiplexer: Arc<NotificationMultiplexer>,
    tap: TapId,
}

impl Binding {
    fn handle(&self) -> NotificationHandle {
        self.registration.handle()
    }

    fn release(self) {
        self.multiplexer.remove_tap(self.tap);
        // Deletes on the registration's own session
        drop(self.registration);
    }
}

enum Phase {
    Idle,
    Registering { pending: Vec<RawNotification> },
    Active(Binding),
}

struct CoreState<T> {
    observers: Vec<(u64, Arc<dyn Observer<T>>)>,
    next_observer: u64,
    phase: Phase,
    latest: Option<T>,
    // Bumped on every phase reset; taps and installers from an older epoch
    // are ignored
    epoch: u64,
}

impl<T> CoreState<T> {
    fn snapshot(&self) -> Vec<Arc<dyn Observer<T>>> {
        self.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    /// Drop every observer and return to Idle
    fn reset(&mut self) -> (Vec<Arc<dyn Observer<T>>>, Option<Binding>) {
        self.epoch += 1;
        self.latest = None;
        let observers = std::mem::take(&mut self.observers)
            .into_iter()
            .map(|(_, o)| o)
            .collect();
        let binding = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Active(binding) => Some(binding),
            _ => None,
        };
        (observers, binding)
    }
}

enum Install {
    Done,
    Stale(Binding),
    Abandoned(Binding),
}

enum Outcome<T> {
    Next(T, Vec<Arc<dyn Observer<T>>>),
    Fail(RxError, Vec<Arc<dyn Observer<T>>>, Option<Binding>),
}

/// Shared state behind every handle to one variable stream
pub(crate) struct StreamCore<T: PlcValue> {
    key: VariableKey,
    request: NotificationRequest,
    coordinator: Arc<ReconnectCoordinator>,
    state: Mutex<CoreState<T>>,
    // Serializes replay and live fan-out so ordering per handle holds
    delivery: ReentrantMutex<()>,
    dependent_id: u64,
    this: Weak<StreamCore<T>>,
}

impl<T: PlcValue> StreamCore<T> {
    fn new(key: VariableKey, max_delay: Duration, coordinator: Arc<ReconnectCoordinator>) -> Arc<Self> {
        let request = NotificationRequest::new(key.name.clone(), key.mode, key.interval, key.value_type)
            .with_max_delay(max_delay);

        Arc::new_cyclic(|this: &Weak<Self>| {
            let dependent: Weak<dyn Rewire> = this.clone();
            let dependent_id = coordinator.register(dependent);
            Self {
                key,
                request,
                coordinator,
                state: Mutex::new(CoreState {
                    observers: Vec::new(),
                    next_observer: 1,
                    phase: Phase::Idle,
                    latest: None,
                    epoch: 0,
                }),
                delivery: ReentrantMutex::new(()),
                dependent_id,
                this: this.clone(),
            }
        })
    }

    fn subscribe(self: &Arc<Self>, observer: Arc<dyn Observer<T>>) -> Result<Subscription> {
        validate(&self.key.value_type)?;

        let (id, start) = {
            let _delivery = self.delivery.lock();
            let (id, replay, start) = {
                let mut state = self.state.lock();
                let id = state.next_observer;
                state.next_observer += 1;
                state.observers.push((id, Arc::clone(&observer)));

                let start = if matches!(state.phase, Phase::Idle) {
                    state.epoch += 1;
                    state.phase = Phase::Registering {
                        pending: Vec::new(),
                    };
                    Some(state.epoch)
                } else {
                    None
                };

                debug!(
                    variable = %self.key.name,
                    subscribers = state.observers.len(),
                    "Subscriber added"
                );
                (id, state.latest.clone(), start)
            };

            if let Some(value) = replay {
                observer.on_next(value);
            }
            (id, start)
        };

        if let Some(epoch) = start {
            debug!(variable = %self.key.name, "First subscriber; registering notification");
            self.activate(epoch);
        }

        let core = Arc::clone(self);
        Ok(Subscription::new(move || core.unsubscribe(id)))
    }

    fn unsubscribe(&self, id: u64) {
        let binding = {
            let mut state = self.state.lock();
            let before = state.observers.len();
            state.observers.retain(|(oid, _)| *oid != id);
            if state.observers.len() == before {
                // Already removed by a terminal error
                return;
            }

            debug!(
                variable = %self.key.name,
                subscribers = state.observers.len(),
                "Subscriber removed"
            );
            if !state.observers.is_empty() {
                return;
            }

            let (_, binding) = state.reset();
            binding
        };

        if let Some(binding) = binding {
            debug!(
                variable = %self.key.name,
                handle = %binding.handle(),
                "Last subscriber left; deleting notification"
            );
            binding.release();
        }
    }

    /// Register against the current session until it sticks
    fn activate(&self, epoch: u64) {
        loop {
            let context = self.coordinator.current();
            let session = context.session.id();

            let registered = self.install_tap(&context, epoch).and_then(|tap| {
                match context.session.register(&self.request) {
                    Ok(registration) => Ok(Binding {
                        registration,
                        multiplexer: Arc::clone(&context.multiplexer),
                        tap,
                    }),
                    Err(e) => {
                        context.multiplexer.remove_tap(tap);
                        Err(e)
                    }
                }
            });

            match registered {
                Ok(binding) => match self.install(epoch, binding) {
                    Install::Done => return,
                    Install::Stale(binding) => {
                        debug!(
                            variable = %self.key.name,
                            %session,
                            "Session replaced during registration; retrying"
                        );
                        binding.release();
                    }
                    Install::Abandoned(binding) => {
                        debug!(variable = %self.key.name, "Registration no longer needed");
                        binding.release();
                        return;
                    }
                },
                Err(_) if !self.coordinator.is_current(session) => {
                    debug!(
                        variable = %self.key.name,
                        %session,
                        "Registration failed on a replaced session; retrying"
                    );
                }
                Err(source) => {
                    self.fail(
                        epoch,
                        RxError::Registration {
                            variable: self.key.name.clone(),
                            source,
                        },
                    );
                    return;
                }
            }
        }
    }

    fn install_tap(
        &self,
        context: &SessionContext,
        epoch: u64,
    ) -> std::result::Result<TapId, TransportError> {
        let this = self.this.clone();
        context.multiplexer.add_tap(Arc::new(move |notification: &RawNotification| {
            if let Some(core) = this.upgrade() {
                core.on_notification(epoch, notification);
            }
        }))
    }

    fn install(&self, epoch: u64, binding: Binding) -> Install {
        let handle = binding.handle();
        let _delivery = self.delivery.lock();
        let pending = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return Install::Abandoned(binding);
            }
            // Checked under the state lock: a swap after this point will
            // find the stream Active and rewire it
            if !self.coordinator.is_current(binding.registration.session_id()) {
                if let Phase::Registering { pending } = &mut state.phase {
                    pending.clear();
                }
                return Install::Stale(binding);
            }

            match std::mem::replace(&mut state.phase, Phase::Active(binding)) {
                Phase::Registering { pending } => pending,
                _ => Vec::new(),
            }
        };

        debug!(
            variable = %self.key.name,
            %handle,
            buffered = pending.len(),
            "Notification active"
        );

        for notification in pending.iter().filter(|n| n.handle == handle) {
            if self.deliver(epoch, notification) {
                break;
            }
        }
        Install::Done
    }

    fn on_notification(&self, epoch: u64, notification: &RawNotification) {
        let _delivery = self.delivery.lock();
        self.deliver(epoch, notification);
    }

    /// Fan one notification out; the caller holds the delivery gate
    ///
    /// Returns true when the notification was terminal for the stream.
    fn deliver(&self, epoch: u64, notification: &RawNotification) -> bool {
        let outcome = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return false;
            }
            match &mut state.phase {
                Phase::Registering { pending } => {
                    pending.push(notification.clone());
                    return false;
                }
                Phase::Active(binding) if binding.handle() == notification.handle => {}
                _ => return false,
            }

            let decoded = match &notification.payload {
                Ok(value) => T::from_value(value.clone()).map_err(|source| RxError::Decode {
                    variable: self.key.name.clone(),
                    source,
                }),
                Err(source) => Err(RxError::Registration {
                    variable: self.key.name.clone(),
                    source: source.clone(),
                }),
            };

            match decoded {
                Ok(value) => {
                    state.latest = Some(value.clone());
                    Outcome::Next(value, state.snapshot())
                }
                Err(error) => {
                    let (observers, binding) = state.reset();
                    Outcome::Fail(error, observers, binding)
                }
            }
        };

        match outcome {
            Outcome::Next(value, observers) => {
                for observer in observers {
                    observer.on_next(value.clone());
                }
                false
            }
            Outcome::Fail(error, observers, binding) => {
                self.notify_failure(error, observers, binding);
                true
            }
        }
    }

    fn fail(&self, epoch: u64, error: RxError) {
        let _delivery = self.delivery.lock();
        let (observers, binding) = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.reset()
        };
        self.notify_failure(error, observers, binding);
    }

    /// Release the failed registration, then tell the former observers
    ///
    /// The handle is gone before `on_error` runs, so an observer that
    /// subscribes again from its callback starts a fresh registration
    /// without overlapping the old one.
    fn notify_failure(
        &self,
        error: RxError,
        observers: Vec<Arc<dyn Observer<T>>>,
        binding: Option<Binding>,
    ) {
        warn!(variable = %self.key.name, error = %error, "Stream failed");
        if let Some(binding) = binding {
            binding.release();
        }
        for observer in observers {
            observer.on_error(error.clone());
        }
    }

    fn latest(&self) -> Option<T> {
        self.state.lock().latest.clone()
    }

    fn subscriber_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    fn handle(&self) -> Option<NotificationHandle> {
        match &self.state.lock().phase {
            Phase::Active(binding) => Some(binding.handle()),
            _ => None,
        }
    }

    fn session_id(&self) -> Option<SessionId> {
        match &self.state.lock().phase {
            Phase::Active(binding) => Some(binding.registration.session_id()),
            _ => None,
        }
    }
}

impl<T: PlcValue> Rewire for StreamCore<T> {
    fn on_reconnect(&self, current: SessionId) {
        let (binding, epoch) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Active(binding) if binding.registration.session_id() != current => {
                    state.epoch += 1;
                    state.phase = Phase::Registering {
                        pending: Vec::new(),
                    };
                    (binding, state.epoch)
                }
                // Idle, already on the new session, or an in-flight
                // registration that will notice the swap itself
                other => {
                    state.phase = other;
                    return;
                }
            }
        };

        debug!(
            variable = %self.key.name,
            old_handle = %binding.handle(),
            %current,
            "Rewiring stream"
        );
        binding.release();
        self.activate(epoch);
    }
}

impl<T: PlcValue> Drop for StreamCore<T> {
    fn drop(&mut self) {
        self.coordinator.unregister(self.dependent_id);
        if let Phase::Active(binding) = std::mem::replace(&mut self.state.get_mut().phase, Phase::Idle) {
            binding.release();
        }
    }
}

/// A typed, shareable stream of one variable's values
///
/// Cloning is cheap; every clone, and every stream the factory returns for the
/// same key and type, shares one registration.
pub struct VariableStream<T: PlcValue> {
    core: Arc<StreamCore<T>>,
}

impl<T: PlcValue> Clone for VariableStream<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: PlcValue> VariableStream<T> {
    pub fn key(&self) -> &VariableKey {
        &self.core.key
    }

    /// Attach an observer
    ///
    /// The first subscriber registers the notification. A late subscriber
    /// immediately receives the latest value, if any.
    ///
    /// # Errors
    ///
    /// Returns `RxError::UnsupportedType` without contacting the transport
    /// when the value type is outside the supported set. Registration and
    /// decode failures are delivered to the observer instead.
    pub fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Result<Subscription> {
        self.core.subscribe(observer)
    }

    /// Attach a closure; a terminal error is logged and ends the subscription
    pub fn subscribe_fn(&self, on_next: impl Fn(T) + Send + Sync + 'static) -> Result<Subscription> {
        let variable = self.core.key.name.clone();
        self.subscribe(observer_fn(on_next, move |error| {
            debug!(%variable, %error, "Closure subscription ended");
        }))
    }

    /// Blocking iterator over the values
    pub fn iter(&self) -> Result<ValueIter<T>> {
        ValueIter::subscribe(self)
    }

    /// Async stream of the values
    pub fn values(&self) -> Result<ValueStream<T>> {
        ValueStream::subscribe(self)
    }

    /// The cached replay value, without subscribing
    pub fn latest(&self) -> Option<T> {
        self.core.latest()
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.subscriber_count()
    }

    /// Whether a registration is currently live
    pub fn is_active(&self) -> bool {
        self.core.handle().is_some()
    }

    /// Handle of the live registration
    pub fn handle(&self) -> Option<NotificationHandle> {
        self.core.handle()
    }

    /// Session the live registration belongs to
    pub fn session_id(&self) -> Option<SessionId> {
        self.core.session_id()
    }

    /// Whether both handles share one backing stream
    pub fn same_stream(&self, other: &VariableStream<T>) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T: PlcValue> ValueSource<T> for VariableStream<T> {
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Result<Subscription> {
        VariableStream::subscribe(self, observer)
    }
}

impl<T: PlcValue> fmt::Debug for VariableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableStream")
            .field("key", &self.core.key)
            .field("subscribers", &self.subscriber_count())
            .field("handle", &self.handle())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamIdentity {
    key: VariableKey,
    rust_type: TypeId,
}

/// Produces variable streams and shares them by identity
///
/// Creating a stream does no transport I/O. Streams are cached weakly: a
/// stream nobody holds is rebuilt on the next request.
pub struct VariableStreamFactory {
    coordinator: Arc<ReconnectCoordinator>,
    max_delay: Duration,
    streams: DashMap<StreamIdentity, Weak<dyn Any + Send + Sync>>,
}

impl VariableStreamFactory {
    pub fn new(coordinator: Arc<ReconnectCoordinator>, max_delay: Duration) -> Self {
        Self {
            coordinator,
            max_delay,
            streams: DashMap::new(),
        }
    }

    /// The stream for `key`, viewed as `T`
    pub fn stream_for<T: PlcValue>(&self, key: VariableKey) -> VariableStream<T> {
        self.streams.retain(|_, stream| stream.strong_count() > 0);

        let identity = StreamIdentity {
            key: key.clone(),
            rust_type: TypeId::of::<T>(),
        };
        let mut entry = self
            .streams
            .entry(identity)
            .or_insert_with(|| Weak::<StreamCore<T>>::new() as Weak<dyn Any + Send + Sync>);

        if let Some(core) = entry
            .upgrade()
            .and_then(|any| any.downcast::<StreamCore<T>>().ok())
        {
            return VariableStream { core };
        }

        debug!(key = %key, "Creating variable stream");
        let core = StreamCore::new(key, self.max_delay, Arc::clone(&self.coordinator));
        let any: Arc<dyn Any + Send + Sync> = core.clone();
        *entry = Arc::downgrade(&any);
        VariableStream { core }
    }

    /// Number of streams still referenced somewhere
    pub fn live_streams(&self) -> usize {
        self.streams
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for VariableStreamFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableStreamFactory")
            .field("live_streams", &self.live_streams())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plcrx_transport::{CallCounts, LoopbackTransport, Value};

    fn setup() -> (Arc<LoopbackTransport>, VariableStreamFactory) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.define("MAIN.var1", ValueType::Int, Value::Int(1));
        let coordinator = Arc::new(ReconnectCoordinator::new(transport.clone(), 4));
        (transport, VariableStreamFactory::new(coordinator, Duration::ZERO))
    }

    fn key(name: &str) -> VariableKey {
        VariableKey::new(name, ValueType::Int, TransmissionMode::OnChange, Duration::from_millis(100))
    }

    #[test]
    fn test_factory_is_lazy() {
        let (transport, factory) = setup();
        let _stream = factory.stream_for::<i16>(key("MAIN.var1"));
        assert_eq!(transport.counts().register, 0);
        assert_eq!(transport.counts().add_listener, 0);
    }

    #[test]
    fn test_same_identity_shares_core() {
        let (_, factory) = setup();
        let a = factory.stream_for::<i16>(key("MAIN.var1"));
        let b = factory.stream_for::<i16>(key("MAIN.var1"));
        let raw = factory.stream_for::<Value>(key("MAIN.var1"));
        let cyclic = factory.stream_for::<i16>(VariableKey {
            mode: TransmissionMode::Cyclic,
            ..key("MAIN.var1")
        });

        assert!(a.same_stream(&b));
        assert!(!a.same_stream(&cyclic));
        assert_eq!(factory.live_streams(), 3);
        drop(raw);
        assert_eq!(factory.live_streams(), 2);
    }

    #[test]
    fn test_dropped_stream_is_rebuilt() {
        let (_, factory) = setup();
        let first = factory.stream_for::<i16>(key("MAIN.var1"));
        drop(first);

        assert_eq!(factory.live_streams(), 0);
        let second = factory.stream_for::<i16>(key("MAIN.var1"));
        assert_eq!(factory.live_streams(), 1);
        assert_eq!(second.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_fn_receives_initial_value() {
        let (transport, factory) = setup();
        let stream = factory.stream_for::<i16>(key("MAIN.var1"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let subscription = stream.subscribe_fn(move |v| sink.lock().push(v)).unwrap();
        transport.set("MAIN.var1", Value::Int(2));

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(stream.latest(), Some(2));
        assert!(stream.is_active());

        drop(subscription);
        assert!(!stream.is_active());
        assert_eq!(stream.latest(), None);
        assert_eq!(transport.counts().delete, 1);
    }

    #[test]
    fn test_unsupported_type_rejected_locally() {
        let (transport, factory) = setup();
        let stream = factory.stream_for::<Value>(VariableKey {
            value_type: ValueType::LInt,
            ..key("MAIN.var1")
        });

        let err = stream.subscribe_fn(|_| {}).unwrap_err();
        assert!(matches!(err, RxError::UnsupportedType { .. }));
        assert_eq!(transport.counts(), CallCounts::default());
    }

    #[test]
    fn test_request_carries_key() {
        let (transport, factory) = setup();
        let stream = factory.stream_for::<i16>(key("MAIN.var1"));
        let _sub = stream.subscribe_fn(|_| {}).unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].variable, "MAIN.var1");
        assert_eq!(requests[0].mode, TransmissionMode::OnChange);
        assert_eq!(requests[0].cycle_time, Duration::from_millis(100));
        assert_eq!(requests[0].value_type, ValueType::Int);
    }
}
