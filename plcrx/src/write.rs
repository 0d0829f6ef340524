//! Write bindings
//!
//! A [`WriteBinding`] forwards every value of a source to one PLC variable
//! through a write handle it owns. The binding ends when it is disposed
//! (or dropped), when its source completes or fails, or on the first failed
//! write; in every case the source is unsubscribed and the write handle is
//! deleted exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use plcrx_transport::Value;
use tokio::sync::{mpsc as async_mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Result, RxError};
use crate::observer::{Observer, Subscription, ValueSource};
use crate::session::{SessionId, TransportSession, WriteHandle};
use crate::value::{validate_value, PlcValue};

/// Where writes are executed
#[derive(Debug, Clone, Default)]
pub enum ExecutionPolicy {
    /// On the thread that emitted the value
    #[default]
    Immediate,
    /// On a dedicated background thread owned by the binding
    Worker,
    /// On a tokio runtime's blocking pool, one write at a time
    Runtime(tokio::runtime::Handle),
}

/// Progress of a write binding
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    /// Still forwarding values
    Pending,
    /// The source completed
    Completed,
    /// Disposed before the source finished
    Disposed,
    /// A write failed, or the source failed
    Failed(RxError),
}

impl WriteStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, WriteStatus::Pending)
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Runs write jobs in emission order
enum Executor {
    Immediate,
    Worker(mpsc::Sender<Job>),
    Runtime(async_mpsc::UnboundedSender<Job>),
}

impl Executor {
    fn start(policy: &ExecutionPolicy, variable: &str) -> Result<Self> {
        match policy {
            ExecutionPolicy::Immediate => Ok(Executor::Immediate),
            ExecutionPolicy::Worker => {
                let (tx, rx) = mpsc::channel::<Job>();
                thread::Builder::new()
                    .name(format!("plcrx-write-{}", variable))
                    .spawn(move || {
                        // Exits once the binding drops its sender
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .map_err(|e| {
                        RxError::Configuration(format!("Failed to spawn write worker: {}", e))
                    })?;
                Ok(Executor::Worker(tx))
            }
            ExecutionPolicy::Runtime(handle) => {
                let (tx, mut rx) = async_mpsc::unbounded_channel::<Job>();
                handle.spawn(async move {
                    while let Some(job) = rx.recv().await {
                        if let Err(e) = tokio::task::spawn_blocking(job).await {
                            warn!(error = %e, "Write job panicked");
                        }
                    }
                });
                Ok(Executor::Runtime(tx))
            }
        }
    }

    fn run(&self, job: Job) {
        match self {
            Executor::Immediate => job(),
            Executor::Worker(tx) => {
                if tx.send(job).is_err() {
                    debug!("Write worker gone; dropping job");
                }
            }
            Executor::Runtime(tx) => {
                if tx.send(job).is_err() {
                    debug!("Write task gone; dropping job");
                }
            }
        }
    }
}

#[derive(Default)]
struct Resources {
    handle: Option<Arc<WriteHandle>>,
    subscription: Option<Subscription>,
}

struct BindingInner {
    variable: String,
    session: SessionId,
    resources: Mutex<Resources>,
    status: watch::Sender<WriteStatus>,
    writes: AtomicU64,
    string_capacity: usize,
}

impl BindingInner {
    fn write(&self, value: Value) {
        if let Err(error) = validate_value(&value, self.string_capacity) {
            warn!(variable = %self.variable, error = %error, "Unsupported value; ending binding");
            self.finish(WriteStatus::Failed(error));
            return;
        }

        // Clone out so no lock is held across the transport call
        let handle = match self.resources.lock().handle.clone() {
            Some(handle) => handle,
            None => return,
        };

        match handle.write(&value) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(source) => {
                let error = RxError::Write {
                    variable: self.variable.clone(),
                    source,
                };
                warn!(variable = %self.variable, error = %error, "Write failed; ending binding");
                self.finish(WriteStatus::Failed(error));
            }
        }
    }

    /// Record the final status once and release everything
    fn finish(&self, status: WriteStatus) {
        let released = {
            let mut resources = self.resources.lock();
            if self.status.borrow().is_finished() {
                return;
            }
            self.status.send_replace(status.clone());
            std::mem::take(&mut *resources)
        };

        debug!(variable = %self.variable, status = ?status, "Write binding finished");
        drop(released.subscription);
        drop(released.handle);
    }

    fn attach(&self, subscription: Subscription) {
        let mut resources = self.resources.lock();
        if self.status.borrow().is_finished() {
            drop(resources);
            // Finished while subscribing, e.g. a single-value source
            drop(subscription);
        } else {
            resources.subscription = Some(subscription);
        }
    }
}

struct WriteObserver {
    inner: Weak<BindingInner>,
    executor: Executor,
}

impl WriteObserver {
    fn schedule(&self, job: impl FnOnce(&BindingInner) + Send + 'static) {
        if let Some(inner) = self.inner.upgrade() {
            self.executor.run(Box::new(move || job(&inner)));
        }
    }
}

impl<T: PlcValue> Observer<T> for WriteObserver {
    fn on_next(&self, value: T) {
        let value = value.into_value();
        self.schedule(move |inner| inner.write(value));
    }

    fn on_error(&self, error: RxError) {
        self.schedule(move |inner| inner.finish(WriteStatus::Failed(error)));
    }

    fn on_completed(&self) {
        self.schedule(|inner| inner.finish(WriteStatus::Completed));
    }
}

/// Forwards a value source to a PLC variable
///
/// Dropping the binding disposes it.
#[must_use = "dropping a WriteBinding disposes it immediately"]
pub struct WriteBinding {
    inner: Arc<BindingInner>,
}

impl WriteBinding {
    /// Create the write handle and subscribe to `source`
    ///
    /// Every value is checked against the supported types, with strings
    /// limited to `string_capacity` characters; an unsupported value ends the
    /// binding without reaching the transport.
    ///
    /// # Errors
    ///
    /// Returns `RxError::WriteHandle` if the handle cannot be created, or the
    /// source's own subscribe error. Nothing is left behind on failure.
    pub(crate) fn bind<T, S>(
        session: &Arc<TransportSession>,
        variable: &str,
        source: &S,
        policy: ExecutionPolicy,
        string_capacity: usize,
    ) -> Result<Self>
    where
        T: PlcValue,
        S: ValueSource<T> + ?Sized,
    {
        let handle = session
            .create_write_handle(variable)
            .map_err(|source| RxError::WriteHandle {
                variable: variable.to_string(),
                source,
            })?;
        let executor = Executor::start(&policy, variable)?;

        let (status, _) = watch::channel(WriteStatus::Pending);
        let inner = Arc::new(BindingInner {
            variable: variable.to_string(),
            session: session.id(),
            resources: Mutex::new(Resources {
                handle: Some(Arc::new(handle)),
                subscription: None,
            }),
            status,
            writes: AtomicU64::new(0),
            string_capacity,
        });

        debug!(variable, policy = ?policy, "Binding write source");
        let observer: Arc<dyn Observer<T>> = Arc::new(WriteObserver {
            inner: Arc::downgrade(&inner),
            executor,
        });
        match source.subscribe(observer) {
            Ok(subscription) => inner.attach(subscription),
            Err(e) => {
                inner.finish(WriteStatus::Failed(e.clone()));
                return Err(e);
            }
        }

        Ok(Self { inner })
    }

    pub fn variable(&self) -> &str {
        &self.inner.variable
    }

    /// Session the write handle was created on
    pub fn session_id(&self) -> SessionId {
        self.inner.session
    }

    pub fn status(&self) -> WriteStatus {
        self.inner.status.borrow().clone()
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Wait until the binding has finished
    pub async fn finished(&self) -> WriteStatus {
        let mut status = self.inner.status.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            if current.is_finished() {
                return current;
            }
            if status.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Unsubscribe from the source and delete the write handle
    ///
    /// Idempotent; a finished binding is left as it is.
    pub fn dispose(&self) {
        self.inner.finish(WriteStatus::Disposed);
    }
}

impl Drop for WriteBinding {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WriteBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBinding")
            .field("variable", &self.inner.variable)
            .field("status", &self.status())
            .field("writes", &self.writes())
            .finish()
    }
}
