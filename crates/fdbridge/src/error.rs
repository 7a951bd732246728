//! Error types for the descriptor bridge
//!
//! Errors stay typed inside the library and are turned into POSIX-style
//! status codes only at the `Bridge` / FFI boundary via [`BridgeError::status`].

use crate::overlay::OverlayError;
use crate::registry::HandleKind;
use std::io;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge operation errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The caller referenced a descriptor that was never issued or is already closed
    #[error("unknown {kind} descriptor {descriptor}")]
    BadDescriptor {
        /// Registry the descriptor was looked up in
        kind: HandleKind,
        /// The offending descriptor
        descriptor: i32,
    },

    /// The overlay runtime rejected the operation
    #[error("{0}")]
    Overlay(#[from] OverlayError),

    /// An output buffer cannot hold the payload plus its NUL terminator
    #[error("{what} of {needed} bytes does not fit in a buffer of {capacity} bytes")]
    BufferTooSmall {
        /// What was being written
        what: &'static str,
        /// Bytes required, terminator included
        needed: usize,
        /// Bytes available
        capacity: usize,
    },

    /// A caller-supplied argument was missing or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The listener was torn down while a caller was waiting on it
    #[error("listener closed")]
    ListenerClosed,

    /// Kernel socket failure
    #[error("socket: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    pub(crate) fn bad_descriptor(kind: HandleKind, descriptor: i32) -> Self {
        BridgeError::BadDescriptor { kind, descriptor }
    }

    /// Status code handed across the ABI boundary.
    ///
    /// Always negative. `-1` means "see the server's last error".
    pub fn status(&self) -> i32 {
        match self {
            BridgeError::BadDescriptor { .. } | BridgeError::ListenerClosed => -libc::EBADF,
            BridgeError::BufferTooSmall { .. } => -libc::ERANGE,
            BridgeError::Io(e) => -e.raw_os_error().filter(|c| *c > 0).unwrap_or(libc::EIO),
            BridgeError::Overlay(_) | BridgeError::InvalidArgument(_) => -1,
        }
    }

    /// Whether this is the "bad descriptor" outcome
    pub fn is_bad_descriptor(&self) -> bool {
        matches!(self, BridgeError::BadDescriptor { .. })
    }
}
