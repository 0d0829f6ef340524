//! Blocking and async adapters over value sources
//!
//! Both adapters own their subscription: dropping the adapter unsubscribes.
//! Items are `Result`s so a terminal stream error reaches the consumer; after
//! it the adapter is exhausted.

use std::pin::Pin;
use std::sync::{mpsc, Arc};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc as async_mpsc;

use crate::error::{Result, RxError};
use crate::observer::{Observer, Subscription, ValueSource};

struct ChannelObserver<T> {
    tx: Mutex<Option<mpsc::Sender<Result<T>>>>,
}

impl<T: Send> Observer<T> for ChannelObserver<T> {
    fn on_next(&self, value: T) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Ok(value));
        }
    }

    fn on_error(&self, error: RxError) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    fn on_completed(&self) {
        self.tx.lock().take();
    }
}

/// Blocking iterator over a stream's values
///
/// `next()` blocks until a value arrives or the stream ends. Use
/// `try_recv()` for non-blocking access.
pub struct ValueIter<T> {
    rx: Mutex<mpsc::Receiver<Result<T>>>,
    _subscription: Subscription,
}

impl<T: Send + 'static> ValueIter<T> {
    pub(crate) fn subscribe<S>(source: &S) -> Result<Self>
    where
        S: ValueSource<T> + ?Sized,
    {
        let (tx, rx) = mpsc::channel();
        let observer = Arc::new(ChannelObserver {
            tx: Mutex::new(Some(tx)),
        });
        let subscription = source.subscribe(observer)?;

        Ok(Self {
            rx: Mutex::new(rx),
            _subscription: subscription,
        })
    }

    /// Block until a value is available
    ///
    /// Returns `None` once the stream has ended.
    pub fn recv(&self) -> Option<Result<T>> {
        self.rx.lock().recv().ok()
    }

    /// Try to receive a value without blocking
    pub fn try_recv(&self) -> Option<Result<T>> {
        self.rx.lock().try_recv().ok()
    }

    /// Block until a value is available or timeout expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        self.rx.lock().recv_timeout(timeout).ok()
    }

    /// Non-blocking iterator over the values already received
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { inner: self }
    }

    /// Blocking iterator that gives up after `timeout` per item
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIter<'_, T> {
        TimeoutIter {
            inner: self,
            timeout,
        }
    }
}

impl<T: Send + 'static> Iterator for ValueIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

/// Non-blocking iterator over currently available values
pub struct TryIter<'a, T> {
    inner: &'a ValueIter<T>,
}

impl<'a, T: Send + 'static> Iterator for TryIter<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}

/// Blocking iterator with timeout
pub struct TimeoutIter<'a, T> {
    inner: &'a ValueIter<T>,
    timeout: Duration,
}

impl<'a, T: Send + 'static> Iterator for TimeoutIter<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}

struct AsyncObserver<T> {
    tx: Mutex<Option<async_mpsc::UnboundedSender<Result<T>>>>,
}

impl<T: Send> Observer<T> for AsyncObserver<T> {
    fn on_next(&self, value: T) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Ok(value));
        }
    }

    fn on_error(&self, error: RxError) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    fn on_completed(&self) {
        self.tx.lock().take();
    }
}

/// Async stream of a source's values
///
/// Values are queued without bound, so a slow consumer never blocks the
/// transport thread.
pub struct ValueStream<T> {
    rx: async_mpsc::UnboundedReceiver<Result<T>>,
    _subscription: Subscription,
}

impl<T: Send + 'static> ValueStream<T> {
    pub(crate) fn subscribe<S>(source: &S) -> Result<Self>
    where
        S: ValueSource<T> + ?Sized,
    {
        let (tx, rx) = async_mpsc::unbounded_channel();
        let observer = Arc::new(AsyncObserver {
            tx: Mutex::new(Some(tx)),
        });
        let subscription = source.subscribe(observer)?;

        Ok(Self {
            rx,
            _subscription: subscription,
        })
    }

    /// Wait for the next value
    ///
    /// # Errors
    ///
    /// Returns the stream's terminal error, then `RxError::Closed` once the
    /// stream has ended.
    pub async fn recv(&mut self) -> Result<T> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(RxError::Closed),
        }
    }
}

impl<T: Send + 'static> Stream for ValueStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
