//! The plcrx entry point
//!
//! [`PlcRxClient`] ties a reconnect coordinator and a variable stream factory
//! to one transport and exposes the read side (`observe*`), the write side
//! (`bind_write`, `write`, `write_async`) and session replacement
//! (`reconnect`).

use std::sync::Arc;
use std::time::Duration;

use plcrx_transport::{TransmissionMode, Transport, TransportError, Value, ValueType};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::ClientConfig;
use crate::coordinator::{ReconnectCoordinator, ReconnectSignal};
use crate::error::{Result, RxError};
use crate::observer::{Just, ValueSource};
use crate::session::SessionId;
use crate::value::{validate_value, PlcType, PlcValue};
use crate::variable::{VariableKey, VariableStream, VariableStreamFactory};
use crate::write::{ExecutionPolicy, WriteBinding};

/// Reactive client over one (replaceable) transport session
///
/// Streams are lazy: nothing is registered until something subscribes. All
/// methods are synchronous except `write_async`.
///
/// # Example
///
/// ```rust,ignore
/// use plcrx::prelude::*;
///
/// let client = PlcRxClient::new(transport);
///
/// // Registered on subscribe, deleted when the subscription drops
/// let subscription = client
///     .observe::<i16>("MAIN.var1", TransmissionMode::OnChange, Duration::from_millis(100))
///     .subscribe_fn(|value| println!("var1 = {}", value))?;
///
/// // Survives a reconnect without re-subscribing
/// client.reconnect(new_transport);
/// ```
pub struct PlcRxClient {
    config: ClientConfig,
    coordinator: Arc<ReconnectCoordinator>,
    factory: VariableStreamFactory,
}

impl PlcRxClient {
    /// Create a client with default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::build(transport, ClientConfig::default())
    }

    /// Create a client with custom configuration
    ///
    /// # Errors
    ///
    /// Returns `RxError::Configuration` if the configuration is invalid.
    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(transport, config))
    }

    fn build(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let coordinator = Arc::new(ReconnectCoordinator::new(
            transport,
            config.reconnect_signal_capacity,
        ));
        let factory = VariableStreamFactory::new(Arc::clone(&coordinator), config.max_delay);
        debug!(session = %coordinator.session_id(), "Created plcrx client");

        Self {
            config,
            coordinator,
            factory,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stream of a variable's values as `T`
    pub fn observe<T: PlcType>(
        &self,
        variable: &str,
        mode: TransmissionMode,
        interval: Duration,
    ) -> VariableStream<T> {
        let value_type = T::value_type(&self.config);
        self.factory
            .stream_for(VariableKey::new(variable, value_type, mode, interval))
    }

    /// [`observe`](Self::observe) with the configured default mode and cycle time
    pub fn observe_default<T: PlcType>(&self, variable: &str) -> VariableStream<T> {
        self.observe(variable, self.config.default_mode, self.config.default_cycle_time)
    }

    /// Stream of undecoded values for an explicit device type
    pub fn observe_raw(
        &self,
        variable: &str,
        value_type: ValueType,
        mode: TransmissionMode,
        interval: Duration,
    ) -> VariableStream<Value> {
        self.factory
            .stream_for(VariableKey::new(variable, value_type, mode, interval))
    }

    /// Write every value of `source` to `variable`
    ///
    /// The binding is tied to the session that is current now; it is not
    /// re-created on reconnect. Watch [`reconnects`](Self::reconnects) to
    /// bind again.
    ///
    /// # Errors
    ///
    /// Returns `RxError::NotConnected` if the transport is down, or
    /// `RxError::WriteHandle` if the variable cannot be resolved.
    pub fn bind_write<T, S>(
        &self,
        variable: &str,
        source: &S,
        policy: ExecutionPolicy,
    ) -> Result<WriteBinding>
    where
        T: PlcValue,
        S: ValueSource<T> + ?Sized,
    {
        let context = self.coordinator.current();
        if !context.session.is_connected() {
            return Err(RxError::NotConnected);
        }
        WriteBinding::bind(
            &context.session,
            variable,
            source,
            policy,
            self.config.string_capacity,
        )
    }

    /// Write a single value
    ///
    /// Keep the returned binding until it has finished: dropping it earlier
    /// cancels a write that has not run yet.
    ///
    /// # Errors
    ///
    /// Returns `RxError::UnsupportedType` without contacting the transport
    /// for a transport-only or oversized value, otherwise the same errors as
    /// [`bind_write`](Self::bind_write).
    pub fn write<T: PlcValue>(
        &self,
        variable: &str,
        value: T,
        policy: ExecutionPolicy,
    ) -> Result<WriteBinding> {
        validate_value(&value.clone().into_value(), self.config.string_capacity)?;
        self.bind_write(variable, &Just(value), policy)
    }

    /// Write a single value on tokio's blocking pool
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write), plus `RxError::Write` if the write
    /// itself fails.
    pub async fn write_async<T: PlcValue>(&self, variable: &str, value: T) -> Result<()> {
        let session = Arc::clone(&self.coordinator.current().session);
        if !session.is_connected() {
            return Err(RxError::NotConnected);
        }

        let value = value.into_value();
        validate_value(&value, self.config.string_capacity)?;

        let name = variable.to_string();
        tokio::task::spawn_blocking(move || {
            let handle = session
                .create_write_handle(&name)
                .map_err(|source| RxError::WriteHandle {
                    variable: name.clone(),
                    source,
                })?;
            handle.write(&value).map_err(|source| RxError::Write {
                variable: name.clone(),
                source,
            })
        })
        .await
        .map_err(|e| RxError::Write {
            variable: variable.to_string(),
            source: TransportError::Io(e.to_string()),
        })?
    }

    /// Replace the transport session and rewire every live stream
    pub fn reconnect(&self, transport: Arc<dyn Transport>) -> ReconnectSignal {
        self.coordinator.reconnect(transport)
    }

    /// Receive a signal after every reconnect
    pub fn reconnects(&self) -> broadcast::Receiver<ReconnectSignal> {
        self.coordinator.subscribe()
    }

    pub fn session_id(&self) -> SessionId {
        self.coordinator.session_id()
    }

    pub fn is_connected(&self) -> bool {
        self.coordinator.current().session.is_connected()
    }

    /// Get statistics about the client
    pub fn stats(&self) -> ClientStats {
        let context = self.coordinator.current();
        ClientStats {
            session: context.session.id(),
            reconnects: self.coordinator.reconnect_count(),
            live_streams: self.factory.live_streams(),
            active_taps: context.multiplexer.tap_count(),
            feed_attached: context.multiplexer.is_attached(),
        }
    }
}

impl std::fmt::Debug for PlcRxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcRxClient")
            .field("session", &self.session_id())
            .field("config", &self.config)
            .finish()
    }
}

/// Statistics about a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub session: SessionId,
    pub reconnects: u64,
    /// Streams still referenced by a handle or subscription
    pub live_streams: usize,
    /// Streams with a registration on the current session
    pub active_taps: usize,
    pub feed_attached: bool,
}

impl std::fmt::Display for ClientStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Client Stats:")?;
        writeln!(f, "  Session: {} ({} reconnects)", self.session, self.reconnects)?;
        writeln!(f, "  Streams: {} live, {} tapped", self.live_streams, self.active_taps)?;
        writeln!(f, "  Feed attached: {}", self.feed_attached)
    }
}
