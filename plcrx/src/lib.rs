//! # plcrx
//!
//! Reactive, reconnect-safe streams over PLC variable change notifications.
//!
//! ## Overview
//!
//! A PLC client delivers change notifications for every registered variable
//! on one shared feed. plcrx turns that feed into independent, typed
//! per-variable streams, registers device notifications only while somebody
//! is listening, and keeps every stream alive across a replacement of the
//! underlying connection.
//!
//! ## Key Features
//!
//! - **Lazy, Ref-Counted Registrations**: A notification is registered for the first subscriber and deleted after the last one leaves
//! - **Replay Latest**: Late subscribers immediately receive the most recent value
//! - **Reconnect Safe**: `reconnect` rewires every live stream; subscribers never re-subscribe
//! - **One Listener per Session**: A single transport listener feeds all streams
//! - **Write Bindings**: Forward any value source to a variable through an owned write handle
//! - **Sync and Async Consumers**: Observers, blocking iterators and `futures::Stream`s
//!
//! ## Usage
//!
//! ```rust,ignore
//! use plcrx::prelude::*;
//!
//! let client = PlcRxClient::new(transport);
//!
//! // Blocking iteration
//! let var1 = client.observe::<i16>("MAIN.var1", TransmissionMode::OnChange, Duration::from_millis(100));
//! for value in var1.iter()?.timeout_iter(Duration::from_secs(1)) {
//!     println!("var1 = {:?}", value);
//! }
//!
//! // Async iteration
//! let mut values = client.observe_default::<String>("MAIN.message").values()?;
//! while let Some(value) = values.next().await {
//!     println!("message = {:?}", value);
//! }
//!
//! // Pipe one variable into another
//! let binding = client.bind_write("MAIN.var3", &var1, ExecutionPolicy::Worker)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Transport feed → NotificationMultiplexer → VariableStream taps → Observers
//!                        ▲ (one per session)       ▲
//!                        └──── ReconnectCoordinator┘
//! ```
//!
//! 1. **Multiplexer**: one transport listener per session, broadcast to every tap
//! 2. **Streams**: each stream filters by its own handle and decodes to `T`
//! 3. **Coordinator**: swaps the session, closes the old multiplexer and rewires streams
//!
//! This is RxJS's `publishReplay(1).refCount()` with reconnect-aware re-registration.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod iter;
pub mod logging;
pub mod multiplexer;
pub mod observer;
pub mod session;
pub mod value;
pub mod variable;
pub mod write;

// Re-export main types for convenience
pub use client::{ClientStats, PlcRxClient};
pub use config::ClientConfig;
pub use coordinator::{ReconnectCoordinator, ReconnectSignal, SessionContext};
pub use error::{DecodeError, Result, RxError};
pub use iter::{ValueIter, ValueStream};
pub use observer::{observer_fn, Just, Observer, Subject, Subscription, ValueSource};
pub use session::{HandleRegistration, SessionId, TransportSession, WriteHandle};
pub use value::{PlcDate, PlcTime, PlcType, PlcValue};
pub use variable::{VariableKey, VariableStream, VariableStreamFactory};
pub use write::{ExecutionPolicy, WriteBinding, WriteStatus};

// Re-export commonly used types from the transport contract
pub use plcrx_transport::{
    NotificationHandle, RawNotification, TransmissionMode, Transport, TransportError, Value,
    ValueType,
};

/// Prelude module for convenient imports
///
/// ```rust
/// use plcrx::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ClientConfig, ExecutionPolicy, Observer, PlcRxClient, PlcType, PlcValue, Result, RxError,
        Subject, Subscription, TransmissionMode, Transport, Value, ValueSource, ValueType,
        VariableStream, WriteBinding, WriteStatus,
    };
    pub use futures::StreamExt;
    pub use std::time::Duration;
}
