//! Overlay doubles that count teardown calls

use crate::overlay::{OverlayConn, OverlayError, OverlayListener, OverlayResult};
use crate::sys;
use async_trait::async_trait;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};

/// Overlay connection over a socket pair that counts `close` calls.
pub(crate) struct CountingConn {
    stream: UnixStream,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl OverlayConn for CountingConn {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        sys::read(&self.stream, buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        sys::write(&self.stream, buf).await
    }

    fn close_write(&self) -> io::Result<()> {
        sys::shutdown(&self.stream, Shutdown::Write)
    }

    fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        sys::shutdown(&self.stream, Shutdown::Both)
    }

    fn remote_addr(&self) -> String {
        "100.64.0.9:4242".into()
    }
}

/// A counting connection, the remote peer's end of it and its close counter.
pub(crate) fn counting_conn() -> (Arc<CountingConn>, StdUnixStream, Arc<AtomicUsize>) {
    let pair = sys::socket_pair().unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let conn = Arc::new(CountingConn {
        stream: pair.internal,
        closes: Arc::clone(&closes),
    });
    (conn, pair.external, closes)
}

/// Overlay listener fed from a channel; counts `close` calls.
pub(crate) struct QueueListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn OverlayConn>>>,
    shutdown: Notify,
    closes: Arc<AtomicUsize>,
}

pub(crate) type Feed = mpsc::UnboundedSender<Arc<dyn OverlayConn>>;

/// A queue listener, the sender that feeds it and its close counter.
pub(crate) fn queue_listener() -> (Arc<QueueListener>, Feed, Arc<AtomicUsize>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    let listener = Arc::new(QueueListener {
        incoming: tokio::sync::Mutex::new(rx),
        shutdown: Notify::new(),
        closes: Arc::clone(&closes),
    });
    (listener, tx, closes)
}

#[async_trait]
impl OverlayListener for QueueListener {
    async fn accept(&self) -> OverlayResult<Arc<dyn OverlayConn>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            conn = incoming.recv() => conn.ok_or(OverlayError::Closed),
            _ = self.shutdown.notified() => Err(OverlayError::Closed),
        }
    }

    fn close(&self) -> OverlayResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.shutdown.notify_one();
        Ok(())
    }

    fn local_addr(&self) -> String {
        "100.64.0.1:80".into()
    }
}
