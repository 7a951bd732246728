//! Listener bridge
//!
//! Wraps an overlay listener behind a kernel socket pair. The external
//! endpoint's fd number is the listener descriptor; the foreign caller polls it
//! and receives one message per accepted connection, with the connection's
//! fd attached as `SCM_RIGHTS` and its connection descriptor (native byte
//! order) as the payload.
//!
//! Two tasks run per listener: a sentinel reader that notices the foreign
//! caller closing its descriptor, and the accept loop. Both end in the same
//! idempotent teardown.

use crate::addr;
use crate::bridge::Shared;
use crate::error::{BridgeError, BridgeResult};
use crate::overlay::OverlayListener;
use crate::pump;
use crate::registry::HandleKind;
use crate::sys::{self, SocketPair};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UnixStream;

/// Bytes in one accept notification
pub const NOTIFY_LEN: usize = mem::size_of::<i32>();

/// A connection handed out by [`accept`], remembered for [`remote_addr`].
struct Accepted {
    descriptor: i32,
    /// Identity of the open file behind the caller's fd number
    file: sys::FileId,
}

/// A bridged overlay listener.
pub struct ListenerHandle {
    descriptor: i32,
    server: i32,
    listener: Arc<dyn OverlayListener>,
    internal: UnixStream,
    /// Foreign conn fd -> connection, filled by [`accept`]
    accepted: Mutex<HashMap<i32, Accepted>>,
    released: AtomicBool,
}

impl ListenerHandle {
    fn new(
        descriptor: i32,
        server: i32,
        listener: Arc<dyn OverlayListener>,
        internal: UnixStream,
    ) -> Self {
        Self {
            descriptor,
            server,
            listener,
            internal,
            accepted: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Listener descriptor (the foreign-facing fd number)
    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// Owning server descriptor
    pub fn server(&self) -> i32 {
        self.server
    }

    /// Overlay address the listener is bound to
    pub fn local_addr(&self) -> String {
        self.listener.local_addr()
    }

    fn release_endpoint(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = sys::shutdown(&self.internal, Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(listener = self.descriptor, error = %e, "shutdown internal endpoint");
            }
        }
        self.accepted.lock().clear();
    }

    fn close_listener(&self) {
        if let Err(e) = self.listener.close() {
            tracing::warn!(listener = self.descriptor, error = %e, "overlay listener close failed");
        }
    }
}

/// Bridge a freshly created overlay listener; returns the foreign-facing fd.
///
/// Must run inside a tokio runtime. On failure `listener` is closed.
pub(crate) fn spawn(
    shared: &Arc<Shared>,
    server: i32,
    listener: Arc<dyn OverlayListener>,
) -> BridgeResult<OwnedFd> {
    let SocketPair { internal, external } = match sys::socket_pair() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = listener.close();
            return Err(e.into());
        }
    };

    let handle = ListenerHandle::new(external.as_raw_fd(), server, listener, internal);
    install(shared, Arc::new(handle));
    Ok(OwnedFd::from(external))
}

/// Register `handle` under its descriptor and start its tasks.
fn install(shared: &Arc<Shared>, handle: Arc<ListenerHandle>) {
    let descriptor = handle.descriptor;
    if let Some(stale) = shared.listeners.insert(descriptor, Arc::clone(&handle)) {
        // The kernel recycled the fd number before the old sentinel noticed.
        tracing::debug!(listener = descriptor, "replacing stale listener");
        stale.release_endpoint();
        stale.close_listener();
    }
    tracing::debug!(listener = descriptor, server = handle.server, addr = %handle.local_addr(), "listener started");

    tokio::spawn(watch_foreign_close(Arc::clone(shared), Arc::clone(&handle)));
    tokio::spawn(accept_loop(Arc::clone(shared), handle));
}

/// Tear the listener down. Idempotent; safe to call from any trigger.
pub(crate) fn teardown(shared: &Shared, handle: &Arc<ListenerHandle>) {
    if shared.listeners.remove_occupant(handle.descriptor, handle) {
        handle.release_endpoint();
        tracing::debug!(listener = handle.descriptor, "listener closed");
    }
    handle.close_listener();
}

async fn watch_foreign_close(shared: Arc<Shared>, handle: Arc<ListenerHandle>) {
    let mut scratch = [0u8; 64];
    loop {
        match sys::read(&handle.internal, &mut scratch).await {
            // The foreign side never writes; stray bytes are discarded.
            Ok(n) if n > 0 => continue,
            _ => break,
        }
    }
    teardown(&shared, &handle);
}

async fn accept_loop(shared: Arc<Shared>, handle: Arc<ListenerHandle>) {
    loop {
        let conn = match handle.listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(listener = handle.descriptor, error = %e, "accept loop finished");
                break;
            }
        };

        let (conn_handle, external) =
            match pump::spawn(&shared, handle.server, Some(handle.descriptor), conn) {
                Ok(bridged) => bridged,
                Err(e) => {
                    tracing::warn!(listener = handle.descriptor, error = %e, "bridging accepted connection failed");
                    continue;
                }
            };

        let payload = conn_handle.descriptor().to_ne_bytes();
        if let Err(e) = sys::send_fd(&handle.internal, &payload, external.as_raw_fd()).await {
            tracing::debug!(
                listener = handle.descriptor,
                conn = conn_handle.descriptor(),
                error = %e,
                "accept notification failed"
            );
            pump::close(&shared, &conn_handle);
        }
        // The foreign caller holds its own duplicate now.
        drop(external);
    }
    teardown(&shared, &handle);
}

/// Receive the next accept notification on `listener_fd`.
///
/// Blocks the calling thread unless `nonblocking`, in which case an empty
/// queue is `EAGAIN`. The returned fd belongs to the caller.
pub(crate) fn accept(shared: &Shared, listener_fd: i32, nonblocking: bool) -> BridgeResult<OwnedFd> {
    let handle = shared.listeners.get(listener_fd)?;

    let mut payload = [0u8; NOTIFY_LEN];
    let (mut filled, fd) = sys::recv_fd(listener_fd, &mut payload, nonblocking)?;
    let fd = match fd {
        Some(fd) => fd,
        None if filled == 0 => return Err(BridgeError::ListenerClosed),
        None => {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "accept notification without descriptor").into())
        }
    };
    // Stream sockets may split the payload; the tail follows right behind.
    while filled < NOTIFY_LEN {
        match sys::recv_fd(listener_fd, &mut payload[filled..], false)? {
            (0, _) => return Err(BridgeError::ListenerClosed),
            (n, _) => filled += n,
        }
    }

    let entry = Accepted {
        descriptor: i32::from_ne_bytes(payload),
        file: sys::file_id(fd.as_raw_fd())?,
    };
    let mut accepted = handle.accepted.lock();
    accepted.retain(|_, entry| shared.conns.contains(entry.descriptor));
    accepted.insert(fd.as_raw_fd(), entry);
    Ok(fd)
}

/// Remote address of a connection accepted on `listener_fd`, port stripped.
///
/// `conn` is either an fd returned by [`accept`] or the connection
/// descriptor carried in a notification payload. An fd number the caller
/// closed and got back for a different file no longer matches.
pub(crate) fn remote_addr(shared: &Shared, listener_fd: i32, conn: i32) -> BridgeResult<String> {
    let handle = shared.listeners.get(listener_fd)?;
    let recorded = {
        let mut accepted = handle.accepted.lock();
        let found = accepted
            .get(&conn)
            .map(|entry| (entry.descriptor, sys::file_id(conn).ok() == Some(entry.file)));
        match found {
            Some((descriptor, true)) => Some(descriptor),
            Some((_, false)) => {
                accepted.remove(&conn);
                None
            }
            None => None,
        }
    };
    let conn_handle = match recorded {
        Some(descriptor) => shared.conns.get(descriptor)?,
        None => shared
            .conns
            .get(conn)
            .ok()
            .filter(|c| c.listener() == Some(listener_fd))
            .ok_or_else(|| BridgeError::bad_descriptor(HandleKind::Connection, conn))?,
    };
    Ok(addr::extract_address(conn_handle.remote_addr()).to_string())
}
