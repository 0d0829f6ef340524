//! Observers, subscriptions and push sources
//!
//! The reactive surface of plcrx is deliberately small: an [`Observer`]
//! receives values and at most one terminal signal, a [`ValueSource`] accepts
//! observers, and every subscription is represented by a [`Subscription`]
//! whose disposal is the only way to cancel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, RxError};

/// Receiver of a value sequence
///
/// Observers are shared between threads; notifications for one stream are
/// never delivered concurrently, but may come from any thread.
pub trait Observer<T>: Send + Sync {
    /// A new value
    fn on_next(&self, value: T);

    /// Terminal failure; no further calls follow
    fn on_error(&self, error: RxError);

    /// Terminal completion; no further calls follow
    fn on_completed(&self) {}
}

/// Anything observers can subscribe to
pub trait ValueSource<T>: Send + Sync {
    /// Attach an observer
    ///
    /// # Errors
    ///
    /// Returns an error only for failures detected before anything is
    /// attached (for example an unsupported value type). Failures after that
    /// point are delivered to the observer.
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Result<Subscription>;
}

struct FnObserver<N, E> {
    next: N,
    error: E,
}

impl<T, N, E> Observer<T> for FnObserver<N, E>
where
    N: Fn(T) + Send + Sync,
    E: Fn(RxError) + Send + Sync,
{
    fn on_next(&self, value: T) {
        (self.next)(value)
    }

    fn on_error(&self, error: RxError) {
        (self.error)(error)
    }
}

/// Build an observer from a value callback and an error callback
pub fn observer_fn<T, N, E>(next: N, error: E) -> Arc<dyn Observer<T>>
where
    T: 'static,
    N: Fn(T) + Send + Sync + 'static,
    E: Fn(RxError) + Send + Sync + 'static,
{
    Arc::new(FnObserver { next, error })
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Handle to an active subscription
///
/// Dropping the handle disposes it. Disposal is idempotent: only the first
/// call runs the teardown.
#[must_use = "dropping a Subscription disposes it immediately"]
pub struct Subscription {
    disposer: Mutex<Option<Disposer>>,
}

impl Subscription {
    /// A subscription that runs `dispose` once when disposed
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposer: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// A subscription with nothing to tear down
    pub fn empty() -> Self {
        Self {
            disposer: Mutex::new(None),
        }
    }

    /// Cancel the subscription
    pub fn dispose(&self) {
        let disposer = self.disposer.lock().take();
        if let Some(dispose) = disposer {
            dispose();
        }
    }

    /// Whether teardown has already run (or there was none)
    pub fn is_disposed(&self) -> bool {
        self.disposer.lock().is_none()
    }

    /// Keep the subscription alive for the life of the process
    ///
    /// The teardown, and everything it holds, is leaked.
    pub fn detach(self) {
        if let Some(dispose) = self.disposer.lock().take() {
            std::mem::forget(dispose);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

enum SubjectState<T> {
    Open(Vec<(u64, Arc<dyn Observer<T>>)>),
    Completed,
    Failed(RxError),
}

struct SubjectInner<T> {
    state: Mutex<SubjectState<T>>,
    next_id: AtomicU64,
}

/// A push source driven by the caller
///
/// Values pushed with [`Subject::next`] go to every observer attached at that
/// moment. Useful as the input of a write binding.
pub struct Subject<T> {
    inner: Arc<SubjectInner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subject<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                state: Mutex::new(SubjectState::Open(Vec::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Push a value to the current observers
    pub fn next(&self, value: T) {
        for observer in self.snapshot() {
            observer.on_next(value.clone());
        }
    }

    /// Fail every observer and close the subject
    pub fn error(&self, error: RxError) {
        for observer in self.close(SubjectState::Failed(error.clone())) {
            observer.on_error(error.clone());
        }
    }

    /// Complete every observer and close the subject
    pub fn complete(&self) {
        for observer in self.close(SubjectState::Completed) {
            observer.on_completed();
        }
    }

    /// Number of attached observers
    pub fn observer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            SubjectState::Open(observers) => observers.len(),
            _ => 0,
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Observer<T>>> {
        match &*self.inner.state.lock() {
            SubjectState::Open(observers) => observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
            _ => Vec::new(),
        }
    }

    fn close(&self, terminal: SubjectState<T>) -> Vec<Arc<dyn Observer<T>>> {
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut *state, terminal) {
            SubjectState::Open(observers) => observers.into_iter().map(|(_, o)| o).collect(),
            previous => {
                // Already closed; keep the first terminal state
                *state = previous;
                Vec::new()
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ValueSource<T> for Subject<T> {
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Result<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            match &mut *state {
                SubjectState::Open(observers) => observers.push((id, observer)),
                SubjectState::Completed => {
                    drop(state);
                    observer.on_completed();
                    return Ok(Subscription::empty());
                }
                SubjectState::Failed(error) => {
                    let error = error.clone();
                    drop(state);
                    observer.on_error(error);
                    return Ok(Subscription::empty());
                }
            }
        }

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let SubjectState::Open(observers) = &mut *inner.state.lock() {
                    observers.retain(|(oid, _)| *oid != id);
                }
            }
        }))
    }
}

/// A source that emits one value and completes
pub struct Just<T>(pub T);

impl<T: Clone + Send + Sync + 'static> ValueSource<T> for Just<T> {
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Result<Subscription> {
        observer.on_next(self.0.clone());
        observer.on_completed();
        Ok(Subscription::empty())
    }
}
