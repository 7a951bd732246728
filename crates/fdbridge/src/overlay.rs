//! Overlay runtime seam
//!
//! The bridge never performs network I/O itself. It drives an overlay runtime
//! through these traits: one [`OverlayNode`] per server descriptor, which hands
//! out listeners and connections. [`crate::memnet`] provides an in-process
//! implementation.

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors reported by the overlay runtime
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// The node, listener or connection has been closed
    #[error("use of closed network node")]
    Closed,

    /// Authentication with the control plane failed
    #[error("node is not authorized: missing or rejected auth key")]
    Unauthorized,

    /// The listen address is already taken
    #[error("listen {0}: address already in use")]
    AddrInUse(String),

    /// Nothing is listening at the dial target
    #[error("dial {0}: connection refused")]
    Refused(String),

    /// Address could not be parsed or resolved
    #[error("invalid address {0:?}")]
    BadAddress(String),

    /// Network type other than the supported ones
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// Operation needs a started node
    #[error("node not started")]
    NotStarted,

    /// Anything else the runtime wants to report
    #[error("{0}")]
    Other(String),

    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result type for overlay calls
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Node settings mutated by the `set_*` operations.
///
/// Read by the node at start; changing them afterwards has no effect on a
/// running node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConfig {
    /// State directory
    pub dir: Option<PathBuf>,
    /// Hostname announced on the overlay
    pub hostname: Option<String>,
    /// Pre-authorized key
    pub auth_key: Option<String>,
    /// Control server URL
    pub control_url: Option<String>,
    /// Remove the node from the network when it goes away
    pub ephemeral: bool,
}

/// How a listener is exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenMode {
    /// Reachable from the overlay only
    #[default]
    Tailnet,
    /// Also announced on the public internet
    Funnel {
        /// Refuse connections originating from the overlay itself
        funnel_only: bool,
    },
}

/// Local loopback service description returned by [`OverlayNode::loopback`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loopback {
    /// `ip:port` of the local proxy/API server
    pub address: String,
    /// Credential for the local proxy; 32 bytes
    pub proxy_credential: String,
    /// Credential for the local API; 32 bytes
    pub local_api_credential: String,
}

/// One overlay network instance.
#[async_trait]
pub trait OverlayNode: Send + Sync {
    /// Connect to the overlay. Idempotent.
    async fn start(&self, config: &NodeConfig) -> OverlayResult<()>;

    /// Connect and wait until the node is usable.
    async fn up(&self, config: &NodeConfig) -> OverlayResult<()>;

    /// Listen on `addr` (e.g. `":8080"`).
    async fn listen(
        &self,
        network: &str,
        addr: &str,
        mode: ListenMode,
    ) -> OverlayResult<Arc<dyn OverlayListener>>;

    /// Dial `addr` on the overlay.
    async fn dial(&self, network: &str, addr: &str) -> OverlayResult<Arc<dyn OverlayConn>>;

    /// Start (if needed) and describe the local loopback server.
    async fn loopback(&self) -> OverlayResult<Loopback>;

    /// Overlay addresses assigned to this node. Empty until started.
    fn addresses(&self) -> Vec<IpAddr>;

    /// DNS names this node can serve certificates for. Empty until started.
    fn cert_domains(&self) -> Vec<String>;

    /// Shut the node down.
    async fn close(&self) -> OverlayResult<()>;
}

/// A listening socket on the overlay.
#[async_trait]
pub trait OverlayListener: Send + Sync {
    /// Wait for the next inbound connection.
    ///
    /// Fails once the listener is closed, including for a call already
    /// waiting when `close` happens.
    async fn accept(&self) -> OverlayResult<Arc<dyn OverlayConn>>;

    /// Close the listener. Idempotent.
    fn close(&self) -> OverlayResult<()>;

    /// Bound `ip:port`
    fn local_addr(&self) -> String;
}

/// A stream connection on the overlay.
///
/// Methods take `&self`: the bridge reads and writes from two tasks at once.
#[async_trait]
pub trait OverlayConn: Send + Sync {
    /// Read into `buf`; `Ok(0)` is end of stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some of `buf`, returning how much was taken.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the read half. Connections without partial close keep the default.
    fn close_read(&self) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Close the write half, signalling end of stream to the peer.
    fn close_write(&self) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Close both directions and release the connection.
    fn close(&self) -> io::Result<()>;

    /// Peer `ip:port`
    fn remote_addr(&self) -> String;
}

/// Creates one node per new server descriptor.
pub trait NodeFactory: Send + Sync {
    /// Create a fresh, unstarted node
    fn create(&self) -> Arc<dyn OverlayNode>;
}

impl<F> NodeFactory for F
where
    F: Fn() -> Arc<dyn OverlayNode> + Send + Sync,
{
    fn create(&self) -> Arc<dyn OverlayNode> {
        self()
    }
}

/// Write all of `buf` to an overlay connection.
pub async fn write_all(conn: &dyn OverlayConn, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match conn.write(buf).await? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}
