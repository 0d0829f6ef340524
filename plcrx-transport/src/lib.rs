//! # plcrx-transport
//!
//! The contract between plcrx and a connected device client.
//!
//! A transport registers change notifications for named variables, removes
//! them by handle, writes values through write handles, and pushes every
//! notification of the session onto a single feed. Everything above that,
//! from fan-out and ref-counting to reconnects, lives in the `plcrx` crate.
//!
//! Enable the `test-support` feature for [`LoopbackTransport`], an in-memory
//! transport that counts every call made against it.

mod error;
mod transport;
mod types;
mod value;

#[cfg(any(test, feature = "test-support"))]
mod loopback;

pub use error::*;
pub use transport::*;
pub use types::*;
pub use value::*;

#[cfg(any(test, feature = "test-support"))]
pub use loopback::{CallCounts, LoopbackTransport};
