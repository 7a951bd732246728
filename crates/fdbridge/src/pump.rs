//! Connection pump
//!
//! Bridges one overlay connection to a kernel socket pair. The foreign caller
//! gets the external endpoint; two tasks copy bytes between the internal
//! endpoint and the overlay connection, one per direction.
//!
//! A direction that reaches end of stream half-closes its side and reports
//! completion. Once both have completed the handle is deleted from the
//! registry, and whoever wins that identity-checked delete releases the
//! resources. An I/O error in either direction forces the same teardown
//! immediately, and so does the foreign caller closing its descriptor: only
//! a `shutdown(SHUT_WR)` keeps the other direction running.

use crate::bridge::Shared;
use crate::error::BridgeResult;
use crate::overlay::{self, OverlayConn};
use crate::sys::{self, SocketPair};
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UnixStream;

/// Default size of each direction's staging buffer
pub const PUMP_BUFFER_SIZE: usize = 64 * 1024;

/// A bridged overlay connection.
pub struct ConnHandle {
    descriptor: i32,
    server: i32,
    listener: Option<i32>,
    conn: Arc<dyn OverlayConn>,
    internal: UnixStream,
    remote_addr: String,
    running: AtomicUsize,
    released: AtomicBool,
}

impl ConnHandle {
    /// Connection descriptor
    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// Owning server descriptor
    pub fn server(&self) -> i32 {
        self.server
    }

    /// Listener the connection was accepted on; `None` for dialed connections
    pub fn listener(&self) -> Option<i32> {
        self.listener
    }

    /// Peer `ip:port` as reported by the overlay when the pump started
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = sys::shutdown(&self.internal, Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(conn = self.descriptor, error = %e, "shutdown internal endpoint");
            }
        }
        if let Err(e) = self.conn.close() {
            tracing::warn!(conn = self.descriptor, error = %e, "overlay connection close failed");
        }
        tracing::debug!(conn = self.descriptor, "connection released");
    }
}

/// Start pumping `conn` and return the handle plus the foreign-facing endpoint.
///
/// Must run inside a tokio runtime. On failure `conn` is closed.
pub(crate) fn spawn(
    shared: &Arc<Shared>,
    server: i32,
    listener: Option<i32>,
    conn: Arc<dyn OverlayConn>,
) -> BridgeResult<(Arc<ConnHandle>, StdUnixStream)> {
    let SocketPair { internal, external } = match sys::socket_pair() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = conn.close();
            return Err(e.into());
        }
    };

    let remote_addr = conn.remote_addr();
    let (descriptor, handle) = shared.conns.allocate_with(|descriptor| ConnHandle {
        descriptor,
        server,
        listener,
        conn,
        internal,
        remote_addr,
        running: AtomicUsize::new(2),
        released: AtomicBool::new(false),
    });
    tracing::debug!(conn = descriptor, server, remote = %handle.remote_addr, "pump started");

    let buffer_size = shared.options.pump_buffer_size.max(1);
    tokio::spawn(runtime_to_kernel(Arc::clone(shared), Arc::clone(&handle), buffer_size));
    tokio::spawn(kernel_to_runtime(Arc::clone(shared), Arc::clone(&handle), buffer_size));
    Ok((handle, external))
}

/// Tear a connection down now, regardless of the pump's progress.
///
/// Safe to race with the pump's own completion and with other callers.
pub(crate) fn close(shared: &Shared, handle: &Arc<ConnHandle>) {
    if shared.conns.remove_occupant(handle.descriptor, handle) {
        handle.release();
    }
}

fn finish(shared: &Shared, handle: &Arc<ConnHandle>) {
    if handle.running.fetch_sub(1, Ordering::AcqRel) == 1 {
        close(shared, handle);
    }
}

async fn runtime_to_kernel(shared: Arc<Shared>, handle: Arc<ConnHandle>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];
    let result: io::Result<()> = async {
        loop {
            let n = handle.conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            sys::write_all(&handle.internal, &buf[..n]).await?;
            tracing::trace!(conn = handle.descriptor, bytes = n, "runtime -> kernel");
        }
    }
    .await;

    match result {
        Ok(()) => {
            let _ = sys::shutdown(&handle.internal, Shutdown::Write);
            let _ = handle.conn.close_read();
            finish(&shared, &handle);
        }
        Err(e) => {
            tracing::debug!(conn = handle.descriptor, error = %e, "runtime -> kernel failed");
            close(&shared, &handle);
        }
    }
}

async fn kernel_to_runtime(shared: Arc<Shared>, handle: Arc<ConnHandle>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];
    let result: io::Result<()> = async {
        loop {
            let n = sys::read(&handle.internal, &mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            overlay::write_all(handle.conn.as_ref(), &buf[..n]).await?;
            tracing::trace!(conn = handle.descriptor, bytes = n, "kernel -> runtime");
        }
    }
    .await;

    match result {
        Ok(()) if sys::peer_hung_up(&handle.internal) => {
            tracing::debug!(conn = handle.descriptor, "foreign descriptor closed");
            close(&shared, &handle);
        }
        Ok(()) => {
            let _ = sys::shutdown(&handle.internal, Shutdown::Read);
            let _ = handle.conn.close_write();
            finish(&shared, &handle);
        }
        Err(e) => {
            tracing::debug!(conn = handle.descriptor, error = %e, "kernel -> runtime failed");
            close(&shared, &handle);
        }
    }
}
