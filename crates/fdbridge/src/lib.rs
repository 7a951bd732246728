//! Descriptor bridge for overlay networks
//!
//! Hands overlay-network listeners and connections to callers that only
//! understand plain file descriptors. Each bridged object is backed by a
//! kernel socket pair: the caller gets one end and can `poll`, `read`,
//! `write` and `close` it like any socket, while tasks on a tokio runtime
//! shuttle bytes between the other end and the overlay.
//!
//! Accepted connections are announced on the listener descriptor as a
//! message carrying the connection's fd in `SCM_RIGHTS`, so callers can use
//! ordinary readiness polling instead of a blocking accept.
//!
//! [`Bridge`] is the entry point. The overlay itself sits behind the traits
//! in [`overlay`]; [`memnet`] provides an in-process implementation.

#![warn(missing_docs)]

pub mod addr;
pub mod bridge;
pub mod cbuf;
pub mod error;
pub mod listener;
pub mod memnet;
pub mod overlay;
pub mod pump;
pub mod registry;
pub mod server;
pub mod sys;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeOptions, Counts, CREDENTIAL_LEN};
pub use error::{BridgeError, BridgeResult};
pub use memnet::MemoryNetwork;
pub use overlay::{
    ListenMode, Loopback, NodeConfig, NodeFactory, OverlayConn, OverlayError, OverlayListener,
    OverlayNode, OverlayResult,
};
pub use server::LogSink;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
