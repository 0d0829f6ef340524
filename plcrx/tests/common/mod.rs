//! Shared fixtures for the integration tests.
//!
//! Every test runs against `LoopbackTransport`, which counts each transport
//! call so tests can assert on registration and deletion traffic.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use plcrx::{Observer, PlcRxClient, RxError, TransmissionMode, Value, ValueType, VariableStream};
use plcrx_transport::LoopbackTransport;

pub const INTERVAL: Duration = Duration::from_millis(100);

/// A transport with the variables used across the tests.
///
/// `MAIN.var1` and `MAIN.var3` are INTs, `MAIN.message` a STRING(80) and
/// `MAIN.flag` a BOOL.
pub fn plc(handle_base: u32) -> Arc<LoopbackTransport> {
    let transport = Arc::new(LoopbackTransport::with_handle_base(handle_base));
    transport.define("MAIN.var1", ValueType::Int, Value::Int(0));
    transport.define("MAIN.var2", ValueType::Int, Value::Int(0));
    transport.define("MAIN.var3", ValueType::Int, Value::Int(0));
    transport.define(
        "MAIN.message",
        ValueType::String { capacity: 80 },
        Value::String(String::new()),
    );
    transport.define("MAIN.flag", ValueType::Bool, Value::Bool(false));
    transport
}

pub fn client() -> (Arc<LoopbackTransport>, PlcRxClient) {
    let transport = plc(1);
    let client = PlcRxClient::new(transport.clone());
    (transport, client)
}

pub fn var(client: &PlcRxClient, name: &str) -> VariableStream<i16> {
    client.observe::<i16>(name, TransmissionMode::OnChange, INTERVAL)
}

/// Observer that records everything it receives.
pub struct Recorder<T> {
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<RxError>>,
    completed: AtomicUsize,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        })
    }

    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    pub fn errors(&self) -> Vec<RxError> {
        self.errors.lock().clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl<T: Send + Sync> Observer<T> for Recorder<T> {
    fn on_next(&self, value: T) {
        self.values.lock().push(value);
    }

    fn on_error(&self, error: RxError) {
        self.errors.lock().push(error);
    }

    fn on_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}
