//! In-process overlay network
//!
//! A process-local stand-in for a real overlay runtime. Every node gets an
//! address in `100.64.0.0/10` when it starts; listeners bind `(address, port)`
//! and dials are matched to them directly, with a kernel socket pair carrying
//! the bytes. It backs the FFI crate when no other runtime is installed and
//! serves as the test double for the bridge.

use crate::overlay::{
    ListenMode, Loopback, NodeConfig, NodeFactory, OverlayConn, OverlayError, OverlayListener,
    OverlayNode, OverlayResult,
};
use crate::sys;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Ports Funnel listeners may use
pub const FUNNEL_PORTS: [u16; 3] = [443, 8443, 10000];

const CGNAT_BASE: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 0);
const ULA_PREFIX: [u16; 3] = [0xfd7a, 0x115c, 0xa1e0];
const DOMAIN_SUFFIX: &str = "memnet.internal";
const EPHEMERAL_PORT_BASE: u32 = 49152;

static SHARED: LazyLock<MemoryNetwork> = LazyLock::new(MemoryNetwork::new);

type AcceptQueue = mpsc::UnboundedSender<Arc<dyn OverlayConn>>;

struct Binding {
    queue: AcceptQueue,
    funnel_only: bool,
}

struct NetState {
    required_auth_key: Option<String>,
    next_host: AtomicU32,
    next_port: AtomicU32,
    bindings: Mutex<HashMap<SocketAddr, Binding>>,
    hostnames: Mutex<HashMap<String, Ipv4Addr>>,
}

impl NetState {
    fn ephemeral_port(&self) -> u16 {
        let n = self.next_port.fetch_add(1, Ordering::Relaxed);
        (EPHEMERAL_PORT_BASE + n % (65536 - EPHEMERAL_PORT_BASE)) as u16
    }

    fn resolve(&self, host: &str) -> OverlayResult<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        let name = host.strip_suffix(DOMAIN_SUFFIX).map(|h| h.trim_end_matches('.')).unwrap_or(host);
        self.hostnames
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| OverlayError::BadAddress(host.to_string()))
    }
}

/// A virtual overlay network shared by the nodes created from it.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<NetState>,
}

impl MemoryNetwork {
    /// Create an open network: any node may join.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a network that only admits nodes configured with `key`.
    pub fn with_auth_key(key: impl Into<String>) -> Self {
        Self::build(Some(key.into()))
    }

    fn build(required_auth_key: Option<String>) -> Self {
        Self {
            state: Arc::new(NetState {
                required_auth_key,
                next_host: AtomicU32::new(1),
                next_port: AtomicU32::new(0),
                bindings: Mutex::new(HashMap::new()),
                hostnames: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The process-wide default network
    pub fn shared() -> MemoryNetwork {
        SHARED.clone()
    }

    /// Create a new, unstarted node on this network.
    pub fn node(&self) -> Arc<MemNode> {
        Arc::new(MemNode {
            net: Arc::clone(&self.state),
            state: Mutex::new(NodeState::default()),
        })
    }

    /// Number of bound listeners
    pub fn listener_count(&self) -> usize {
        self.state.bindings.lock().len()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeFactory for MemoryNetwork {
    fn create(&self) -> Arc<dyn OverlayNode> {
        self.node()
    }
}

#[derive(Default)]
struct NodeState {
    host: Option<u32>,
    hostname: Option<String>,
    closed: bool,
    listeners: Vec<Weak<MemListener>>,
    loopback: Option<Loopback>,
}

impl NodeState {
    fn ipv4(&self) -> Option<Ipv4Addr> {
        self.host.map(|n| Ipv4Addr::from(u32::from(CGNAT_BASE) + n))
    }
}

/// A node on a [`MemoryNetwork`].
pub struct MemNode {
    net: Arc<NetState>,
    state: Mutex<NodeState>,
}

impl MemNode {
    fn require_ip(&self) -> OverlayResult<Ipv4Addr> {
        let state = self.state.lock();
        if state.closed {
            return Err(OverlayError::Closed);
        }
        state.ipv4().ok_or(OverlayError::NotStarted)
    }
}

fn check_network(network: &str) -> OverlayResult<()> {
    match network {
        "tcp" | "tcp4" => Ok(()),
        other => Err(OverlayError::UnsupportedNetwork(other.to_string())),
    }
}

fn split_host_port(addr: &str) -> OverlayResult<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| OverlayError::BadAddress(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| OverlayError::BadAddress(addr.to_string()))?;
    Ok((host, port))
}

#[async_trait]
impl OverlayNode for MemNode {
    async fn start(&self, config: &NodeConfig) -> OverlayResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(OverlayError::Closed);
        }
        if state.host.is_some() {
            return Ok(());
        }
        if let Some(required) = &self.net.required_auth_key {
            if config.auth_key.as_deref() != Some(required.as_str()) {
                return Err(OverlayError::Unauthorized);
            }
        }

        let host = self.net.next_host.fetch_add(1, Ordering::Relaxed);
        state.host = Some(host);
        if let Some(name) = &config.hostname {
            let ip = state.ipv4().unwrap_or(CGNAT_BASE);
            self.net.hostnames.lock().insert(name.clone(), ip);
            state.hostname = Some(name.clone());
        }
        tracing::debug!(ip = ?state.ipv4(), hostname = ?state.hostname, "memnet node started");
        Ok(())
    }

    async fn up(&self, config: &NodeConfig) -> OverlayResult<()> {
        // Nodes are usable as soon as they have an address.
        self.start(config).await
    }

    async fn listen(
        &self,
        network: &str,
        addr: &str,
        mode: ListenMode,
    ) -> OverlayResult<Arc<dyn OverlayListener>> {
        check_network(network)?;
        let ip = self.require_ip()?;
        let (host, port) = split_host_port(addr)?;
        if !host.is_empty() && self.net.resolve(host)? != ip {
            return Err(OverlayError::BadAddress(addr.to_string()));
        }

        let funnel_only = match mode {
            ListenMode::Tailnet => false,
            ListenMode::Funnel { funnel_only } => {
                if !FUNNEL_PORTS.contains(&port) {
                    return Err(OverlayError::Other(format!(
                        "funnel: port {port} is not one of {FUNNEL_PORTS:?}"
                    )));
                }
                funnel_only
            }
        };

        let port = if port == 0 { self.net.ephemeral_port() } else { port };
        let local = SocketAddr::new(IpAddr::V4(ip), port);
        let (queue, rx) = mpsc::unbounded_channel();
        {
            let mut bindings = self.net.bindings.lock();
            if bindings.contains_key(&local) {
                return Err(OverlayError::AddrInUse(local.to_string()));
            }
            bindings.insert(local, Binding { queue, funnel_only });
        }

        let listener = Arc::new(MemListener {
            net: Arc::clone(&self.net),
            local,
            queue: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        });
        let mut state = self.state.lock();
        state.listeners.retain(|l| l.strong_count() > 0);
        state.listeners.push(Arc::downgrade(&listener));
        Ok(listener)
    }

    async fn dial(&self, network: &str, addr: &str) -> OverlayResult<Arc<dyn OverlayConn>> {
        check_network(network)?;
        let ip = self.require_ip()?;
        let (host, port) = split_host_port(addr)?;
        let target = SocketAddr::new(IpAddr::V4(self.net.resolve(host)?), port);
        let origin = SocketAddr::new(IpAddr::V4(ip), self.net.ephemeral_port());

        let (near, far) = StdUnixStream::pair()?;
        let client = MemConn::new(near, target)?;
        let server: Arc<dyn OverlayConn> = Arc::new(MemConn::new(far, origin)?);

        let bindings = self.net.bindings.lock();
        match bindings.get(&target) {
            Some(binding) if !binding.funnel_only => binding
                .queue
                .send(server)
                .map_err(|_| OverlayError::Refused(addr.to_string()))?,
            _ => return Err(OverlayError::Refused(addr.to_string())),
        }
        Ok(Arc::new(client))
    }

    async fn loopback(&self) -> OverlayResult<Loopback> {
        self.require_ip()?;
        let mut state = self.state.lock();
        let port = self.net.ephemeral_port();
        let loopback = state.loopback.get_or_insert_with(|| Loopback {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port).to_string(),
            proxy_credential: hex::encode(rand::random::<[u8; 16]>()),
            local_api_credential: hex::encode(rand::random::<[u8; 16]>()),
        });
        Ok(loopback.clone())
    }

    fn addresses(&self) -> Vec<IpAddr> {
        let state = self.state.lock();
        match (state.ipv4(), state.host) {
            (Some(v4), Some(n)) => {
                let [a, b, c] = ULA_PREFIX;
                let v6 = Ipv6Addr::new(a, b, c, 0, 0, 0, (n >> 16) as u16, n as u16);
                vec![IpAddr::V4(v4), IpAddr::V6(v6)]
            }
            _ => Vec::new(),
        }
    }

    fn cert_domains(&self) -> Vec<String> {
        let state = self.state.lock();
        match (&state.hostname, state.host) {
            (Some(name), Some(_)) => vec![format!("{name}.{DOMAIN_SUFFIX}")],
            _ => Vec::new(),
        }
    }

    async fn close(&self) -> OverlayResult<()> {
        let listeners = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if let Some(name) = state.hostname.take() {
                self.net.hostnames.lock().remove(&name);
            }
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.close()?;
        }
        tracing::debug!("memnet node closed");
        Ok(())
    }
}

/// A listener bound on a [`MemoryNetwork`].
pub struct MemListener {
    net: Arc<NetState>,
    local: SocketAddr,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn OverlayConn>>>,
    closed: AtomicBool,
}

#[async_trait]
impl OverlayListener for MemListener {
    async fn accept(&self) -> OverlayResult<Arc<dyn OverlayConn>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OverlayError::Closed);
        }
        let mut queue = self.queue.lock().await;
        match queue.recv().await {
            Some(conn) if !self.closed.load(Ordering::Acquire) => Ok(conn),
            _ => Err(OverlayError::Closed),
        }
    }

    fn close(&self) -> OverlayResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Dropping the binding drops the only sender, which wakes `accept`.
            self.net.bindings.lock().remove(&self.local);
        }
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.local.to_string()
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        let _ = OverlayListener::close(self);
    }
}

/// A stream between two [`MemNode`]s.
pub struct MemConn {
    stream: UnixStream,
    remote: SocketAddr,
    closed: AtomicBool,
}

impl MemConn {
    fn new(stream: StdUnixStream, remote: SocketAddr) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(stream)?,
            remote,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl OverlayConn for MemConn {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        sys::read(&self.stream, buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        sys::write(&self.stream, buf).await
    }

    fn close_read(&self) -> io::Result<()> {
        sys::shutdown(&self.stream, Shutdown::Read)
    }

    fn close_write(&self) -> io::Result<()> {
        sys::shutdown(&self.stream, Shutdown::Write)
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match sys::shutdown(&self.stream, Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }
}
