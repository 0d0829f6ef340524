//! In-memory transport for tests.
//!
//! `LoopbackTransport` keeps a table of variables, issues handles, and delivers
//! notifications to its listeners on the thread that changes a value. Every
//! call is counted so tests can assert on the exact traffic a client produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TransportError};
use crate::transport::{NotificationListener, RawNotification, Transport};
use crate::types::{
    ListenerId, NotificationHandle, NotificationRequest, TransmissionMode, VariableHandle,
};
use crate::value::{Value, ValueType};

type RegisterHook = Arc<dyn Fn(&NotificationRequest) + Send + Sync>;

#[derive(Debug, Clone)]
struct Variable {
    value_type: ValueType,
    value: Value,
}

#[derive(Debug, Clone)]
struct Registration {
    variable: String,
    mode: TransmissionMode,
}

#[derive(Default)]
struct Tables {
    variables: HashMap<String, Variable>,
    registrations: HashMap<NotificationHandle, Registration>,
    write_handles: HashMap<VariableHandle, String>,
    listeners: Vec<(ListenerId, NotificationListener)>,
    requests: Vec<NotificationRequest>,
    deleted: Vec<NotificationHandle>,
    writes: Vec<(String, Value)>,
}

/// Counters of every call made against a [`LoopbackTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub register: u32,
    pub delete: u32,
    pub create_write_handle: u32,
    pub delete_write_handle: u32,
    pub write: u32,
    pub add_listener: u32,
    pub remove_listener: u32,
}

/// An in-memory [`Transport`] with scriptable failures.
pub struct LoopbackTransport {
    tables: Mutex<Tables>,
    counts: Mutex<CallCounts>,
    connected: AtomicBool,
    fail_deletes: AtomicBool,
    fail_writes: AtomicBool,
    initial_notification: AtomicBool,
    next_handle: AtomicU32,
    next_listener: AtomicU64,
    register_hook: Mutex<Option<RegisterHook>>,
}

impl LoopbackTransport {
    /// Create a connected transport with no variables.
    pub fn new() -> Self {
        Self::with_handle_base(1)
    }

    /// Create a transport whose handles start at `base`.
    ///
    /// Giving each session in a test its own base makes it obvious which
    /// session a handle came from.
    pub fn with_handle_base(base: u32) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            counts: Mutex::new(CallCounts::default()),
            connected: AtomicBool::new(true),
            fail_deletes: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            initial_notification: AtomicBool::new(true),
            next_handle: AtomicU32::new(base),
            next_listener: AtomicU64::new(1),
            register_hook: Mutex::new(None),
        }
    }

    /// Declare a variable with its type and current value.
    pub fn define(&self, name: &str, value_type: ValueType, value: Value) {
        self.tables
            .lock()
            .variables
            .insert(name.to_string(), Variable { value_type, value });
    }

    /// Change a variable as the device program would.
    ///
    /// Notifies every registration on the variable: on-change registrations
    /// only if the value differs, cyclic ones always.
    pub fn set(&self, name: &str, value: Value) {
        let notifications = {
            let mut tables = self.tables.lock();
            let changed = match tables.variables.get_mut(name) {
                Some(variable) => {
                    let changed = variable.value != value;
                    variable.value = value.clone();
                    changed
                }
                None => return,
            };

            tables
                .registrations
                .iter()
                .filter(|(_, r)| r.variable == name)
                .filter(|(_, r)| changed || r.mode == TransmissionMode::Cyclic)
                .map(|(handle, _)| RawNotification::value(*handle, value.clone()))
                .collect::<Vec<_>>()
        };

        for notification in notifications {
            self.deliver(&notification);
        }
    }

    /// Current value of a variable.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.tables.lock().variables.get(name).map(|v| v.value.clone())
    }

    /// Deliver an arbitrary notification to every listener.
    pub fn emit(&self, notification: RawNotification) {
        self.deliver(&notification);
    }

    /// Simulate a lost connection: every later call fails with `NotConnected`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make `delete_notification` and `delete_write_handle` fail.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make `write_by_handle` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether a registration immediately notifies the current value.
    ///
    /// On by default, matching device behavior.
    pub fn set_initial_notification(&self, enabled: bool) {
        self.initial_notification.store(enabled, Ordering::SeqCst);
    }

    /// Run `hook` inside every `register_notification` call, before the
    /// handle is issued.
    pub fn on_register(&self, hook: impl Fn(&NotificationRequest) + Send + Sync + 'static) {
        *self.register_hook.lock() = Some(Arc::new(hook));
    }

    /// Snapshot of the call counters.
    pub fn counts(&self) -> CallCounts {
        *self.counts.lock()
    }

    /// Every registration request received, in order.
    pub fn requests(&self) -> Vec<NotificationRequest> {
        self.tables.lock().requests.clone()
    }

    /// Every notification handle that was deleted, in order.
    pub fn deleted_handles(&self) -> Vec<NotificationHandle> {
        self.tables.lock().deleted.clone()
    }

    /// Handles of the registrations that are still live.
    pub fn active_registrations(&self) -> Vec<NotificationHandle> {
        let mut handles: Vec<_> = self.tables.lock().registrations.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Handle of the live registration for a variable, if exactly one exists.
    pub fn handle_for(&self, name: &str) -> Option<NotificationHandle> {
        let tables = self.tables.lock();
        let mut matching = tables
            .registrations
            .iter()
            .filter(|(_, r)| r.variable == name)
            .map(|(h, _)| *h);
        match (matching.next(), matching.next()) {
            (Some(handle), None) => Some(handle),
            _ => None,
        }
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.tables.lock().writes.clone()
    }

    /// Number of write handles still open.
    pub fn open_write_handles(&self) -> usize {
        self.tables.lock().write_handles.len()
    }

    /// Number of listeners attached to the feed.
    pub fn listener_count(&self) -> usize {
        self.tables.lock().listeners.len()
    }

    fn deliver(&self, notification: &RawNotification) {
        let listeners: Vec<NotificationListener> = self
            .tables
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(notification);
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn count(&self, f: impl FnOnce(&mut CallCounts)) {
        f(&mut self.counts.lock());
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn register_notification(&self, request: &NotificationRequest) -> Result<NotificationHandle> {
        self.count(|c| c.register += 1);
        self.tables.lock().requests.push(request.clone());
        self.ensure_connected()?;

        let hook = self.register_hook.lock().clone();
        if let Some(hook) = hook {
            hook(request);
        }

        let (handle, current) = {
            let mut tables = self.tables.lock();
            let variable = tables
                .variables
                .get(&request.variable)
                .cloned()
                .ok_or_else(|| TransportError::UnknownVariable(request.variable.clone()))?;

            if variable.value_type != request.value_type {
                return Err(TransportError::TypeMismatch {
                    variable: request.variable.clone(),
                    detail: format!(
                        "declared {}, requested {}",
                        variable.value_type, request.value_type
                    ),
                });
            }

            let handle = NotificationHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
            tables.registrations.insert(
                handle,
                Registration {
                    variable: request.variable.clone(),
                    mode: request.mode,
                },
            );
            (handle, variable.value)
        };

        tracing::trace!(%handle, variable = %request.variable, "loopback registration");

        if self.initial_notification.load(Ordering::SeqCst) {
            self.deliver(&RawNotification::value(handle, current));
        }

        Ok(handle)
    }

    fn delete_notification(&self, handle: NotificationHandle) -> Result<()> {
        self.count(|c| c.delete += 1);
        self.ensure_connected()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("delete failed".to_string()));
        }

        let mut tables = self.tables.lock();
        tables
            .registrations
            .remove(&handle)
            .ok_or(TransportError::InvalidNotificationHandle(handle))?;
        tables.deleted.push(handle);
        Ok(())
    }

    fn create_write_handle(&self, variable: &str) -> Result<VariableHandle> {
        self.count(|c| c.create_write_handle += 1);
        self.ensure_connected()?;

        let mut tables = self.tables.lock();
        if !tables.variables.contains_key(variable) {
            return Err(TransportError::UnknownVariable(variable.to_string()));
        }
        let handle = VariableHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        tables.write_handles.insert(handle, variable.to_string());
        Ok(handle)
    }

    fn delete_write_handle(&self, handle: VariableHandle) -> Result<()> {
        self.count(|c| c.delete_write_handle += 1);
        self.ensure_connected()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("delete failed".to_string()));
        }

        self.tables
            .lock()
            .write_handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(TransportError::InvalidVariableHandle(handle))
    }

    fn write_by_handle(&self, handle: VariableHandle, value: &Value) -> Result<()> {
        self.count(|c| c.write += 1);
        self.ensure_connected()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("write failed".to_string()));
        }

        let name = {
            let mut tables = self.tables.lock();
            let name = tables
                .write_handles
                .get(&handle)
                .cloned()
                .ok_or(TransportError::InvalidVariableHandle(handle))?;
            let declared = tables
                .variables
                .get(&name)
                .map(|v| v.value_type)
                .ok_or_else(|| TransportError::UnknownVariable(name.clone()))?;
            if !value.fits(&declared) {
                return Err(TransportError::TypeMismatch {
                    variable: name,
                    detail: format!("cannot store {} in {}", value.iec_name(), declared),
                });
            }
            tables.writes.push((name.clone(), value.clone()));
            name
        };

        self.set(&name, value.clone());
        Ok(())
    }

    fn add_listener(&self, listener: NotificationListener) -> Result<ListenerId> {
        self.count(|c| c.add_listener += 1);
        self.ensure_connected()?;
        let id = ListenerId::new(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.tables.lock().listeners.push((id, listener));
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.count(|c| c.remove_listener += 1);
        // Detaching works on a dead session too so nothing keeps firing into it
        self.tables.lock().listeners.retain(|(l, _)| *l != id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(name: &str, value_type: ValueType) -> NotificationRequest {
        NotificationRequest::new(name, TransmissionMode::OnChange, Duration::ZERO, value_type)
    }

    #[test]
    fn test_register_delivers_initial_value() {
        let transport = LoopbackTransport::new();
        transport.define("MAIN.var1", ValueType::Int, Value::Int(42));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport
            .add_listener(Arc::new(move |n: &RawNotification| sink.lock().push(n.clone())))
            .unwrap();

        let handle = transport
            .register_notification(&request("MAIN.var1", ValueType::Int))
            .unwrap();

        assert_eq!(
            seen.lock().as_slice(),
            &[RawNotification::value(handle, Value::Int(42))]
        );
    }

    #[test]
    fn test_register_unknown_variable() {
        let transport = LoopbackTransport::new();
        let result = transport.register_notification(&request("MAIN.varNonExist", ValueType::Int));
        assert_eq!(
            result,
            Err(TransportError::UnknownVariable("MAIN.varNonExist".to_string()))
        );
        assert_eq!(transport.counts().register, 1);
    }

    #[test]
    fn test_on_change_skips_identical_values() {
        let transport = LoopbackTransport::new();
        transport.set_initial_notification(false);
        transport.define("MAIN.var1", ValueType::Int, Value::Int(1));

        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        transport
            .add_listener(Arc::new(move |_: &RawNotification| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        transport
            .register_notification(&request("MAIN.var1", ValueType::Int))
            .unwrap();

        transport.set("MAIN.var1", Value::Int(1));
        transport.set("MAIN.var1", Value::Int(2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_updates_variable_and_rejects_mismatch() {
        let transport = LoopbackTransport::new();
        transport.define("MAIN.var3", ValueType::Int, Value::Int(0));

        let handle = transport.create_write_handle("MAIN.var3").unwrap();
        transport.write_by_handle(handle, &Value::Int(7)).unwrap();
        assert_eq!(transport.get("MAIN.var3"), Some(Value::Int(7)));

        let err = transport
            .write_by_handle(handle, &Value::String("x".into()))
            .unwrap_err();
        assert!(matches!(err, TransportError::TypeMismatch { .. }));

        transport.delete_write_handle(handle).unwrap();
        assert_eq!(transport.open_write_handles(), 0);
    }

    #[test]
    fn test_disconnect_fails_calls() {
        let transport = LoopbackTransport::new();
        transport.define("MAIN.var1", ValueType::Int, Value::Int(0));
        transport.disconnect();

        assert!(!transport.is_connected());
        assert_eq!(
            transport.register_notification(&request("MAIN.var1", ValueType::Int)),
            Err(TransportError::NotConnected)
        );
    }
}
