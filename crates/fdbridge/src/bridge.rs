//! Bridge context
//!
//! [`Bridge`] owns the three handle registries and the node factory. Every
//! operation takes it explicitly, so independent bridges can coexist in one
//! process. Async operations must be awaited on a multi-thread tokio runtime;
//! the pump and listener tasks they start are spawned onto it.

use crate::cbuf;
use crate::error::{BridgeError, BridgeResult};
use crate::listener::{self, ListenerHandle};
use crate::overlay::{ListenMode, NodeFactory, OverlayError};
use crate::pump::{self, ConnHandle, PUMP_BUFFER_SIZE};
use crate::registry::{HandleKind, HandleRegistry};
use crate::server::{LogSink, ServerHandle};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

/// Length of each loopback credential
pub const CREDENTIAL_LEN: usize = 32;

/// Bridge-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Staging buffer per pump direction
    pub pump_buffer_size: usize,
    /// Worker threads for a runtime built on the bridge's behalf; `None` lets
    /// tokio decide
    pub worker_threads: Option<usize>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            pump_buffer_size: PUMP_BUFFER_SIZE,
            worker_threads: None,
        }
    }
}

impl BridgeOptions {
    /// Defaults overridden by `FDBRIDGE_PUMP_BUFFER` and `FDBRIDGE_WORKER_THREADS`.
    ///
    /// Unparsable or zero values are ignored.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(size) = env_usize("FDBRIDGE_PUMP_BUFFER") {
            options.pump_buffer_size = size;
        }
        if let Some(threads) = env_usize("FDBRIDGE_WORKER_THREADS") {
            options.worker_threads = Some(threads);
        }
        options
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(var = name, value = %value, "ignoring invalid setting");
            None
        }
    }
}

/// Registries and settings shared with the pump and listener tasks.
pub(crate) struct Shared {
    pub(crate) options: BridgeOptions,
    pub(crate) servers: HandleRegistry<ServerHandle>,
    pub(crate) listeners: HandleRegistry<ListenerHandle>,
    pub(crate) conns: HandleRegistry<ConnHandle>,
}

/// Live handle counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Registered servers
    pub servers: usize,
    /// Registered listeners
    pub listeners: usize,
    /// Registered connections
    pub connections: usize,
}

impl Counts {
    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.servers == 0 && self.listeners == 0 && self.connections == 0
    }
}

/// The descriptor bridge.
#[derive(Clone)]
pub struct Bridge {
    factory: Arc<dyn NodeFactory>,
    shared: Arc<Shared>,
}

impl Bridge {
    /// Create a bridge whose servers are built by `factory`.
    pub fn new(factory: impl NodeFactory + 'static, options: BridgeOptions) -> Self {
        Self::with_factory(Arc::new(factory), options)
    }

    /// Like [`Bridge::new`] with an already shared factory.
    pub fn with_factory(factory: Arc<dyn NodeFactory>, options: BridgeOptions) -> Self {
        Self {
            factory,
            shared: Arc::new(Shared {
                options,
                servers: HandleRegistry::new(HandleKind::Server),
                listeners: HandleRegistry::new(HandleKind::Listener),
                conns: HandleRegistry::new(HandleKind::Connection),
            }),
        }
    }

    /// Bridge settings
    pub fn options(&self) -> &BridgeOptions {
        &self.shared.options
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Look up a server.
    pub fn server(&self, sd: i32) -> BridgeResult<Arc<ServerHandle>> {
        self.shared.servers.get(sd)
    }

    // ========================================================================
    // Server lifecycle
    // ========================================================================

    /// Create an unstarted server and return its descriptor.
    pub fn new_server(&self) -> i32 {
        let node = self.factory.create();
        let (sd, _) = self
            .shared
            .servers
            .allocate_with(|sd| ServerHandle::new(sd, node));
        tracing::debug!(server = sd, "server created");
        sd
    }

    /// Connect the server's node to the overlay.
    pub async fn start(&self, sd: i32) -> BridgeResult<()> {
        let server = self.server(sd)?;
        let result = server.ensure_started().await;
        server.record(result)
    }

    /// Connect and wait until the node is usable.
    pub async fn up(&self, sd: i32) -> BridgeResult<()> {
        let server = self.server(sd)?;
        let result = server.bring_up().await;
        server.record(result)
    }

    /// Remove the server, tear down everything it owns, then close its node.
    ///
    /// Teardown always completes; a failing node close is logged and
    /// reported afterwards.
    pub async fn close_server(&self, sd: i32) -> BridgeResult<()> {
        let server = self.server(sd)?;
        if !self.shared.servers.remove_occupant(sd, &server) {
            // A concurrent close got there first.
            return Err(BridgeError::bad_descriptor(HandleKind::Server, sd));
        }

        for (_, handle) in self.shared.listeners.snapshot() {
            if handle.server() == sd {
                listener::teardown(&self.shared, &handle);
            }
        }
        for (_, handle) in self.shared.conns.snapshot() {
            if handle.server() == sd {
                pump::close(&self.shared, &handle);
            }
        }

        let result = server.node().close().await;
        if let Err(e) = &result {
            server.log(format_args!("close failed: {e}"));
            tracing::warn!(server = sd, error = %e, "node close failed");
        }
        tracing::debug!(server = sd, "server closed");
        result.map_err(BridgeError::from)
    }

    /// Record `error` as the server's last error, if the server exists.
    ///
    /// For failures detected before an operation reaches the bridge, such as
    /// malformed arguments at an ABI boundary.
    pub fn report(&self, sd: i32, error: BridgeError) -> BridgeError {
        if let Ok(server) = self.server(sd) {
            server.set_last_error(&error);
        }
        error
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Set the state directory.
    pub fn set_dir(&self, sd: i32, dir: impl Into<PathBuf>) -> BridgeResult<()> {
        let dir = dir.into();
        self.configure(sd, |server| server.update_config(|c| c.dir = Some(dir)))
    }

    /// Set the overlay hostname.
    pub fn set_hostname(&self, sd: i32, hostname: impl Into<String>) -> BridgeResult<()> {
        let hostname = hostname.into();
        self.configure(sd, |server| server.update_config(|c| c.hostname = Some(hostname)))
    }

    /// Set the pre-authorized key.
    pub fn set_auth_key(&self, sd: i32, key: impl Into<String>) -> BridgeResult<()> {
        let key = key.into();
        self.configure(sd, |server| server.update_config(|c| c.auth_key = Some(key)))
    }

    /// Set the control server URL.
    pub fn set_control_url(&self, sd: i32, url: impl Into<String>) -> BridgeResult<()> {
        let url = url.into();
        self.configure(sd, |server| server.update_config(|c| c.control_url = Some(url)))
    }

    /// Mark the node ephemeral.
    pub fn set_ephemeral(&self, sd: i32, ephemeral: bool) -> BridgeResult<()> {
        self.configure(sd, |server| server.update_config(|c| c.ephemeral = ephemeral))
    }

    /// Redirect the server's own log lines.
    pub fn set_log_sink(&self, sd: i32, sink: LogSink) -> BridgeResult<()> {
        self.configure(sd, |server| server.set_log_sink(sink))
    }

    fn configure(&self, sd: i32, apply: impl FnOnce(&ServerHandle)) -> BridgeResult<()> {
        let server = self.server(sd)?;
        apply(&server);
        Ok(())
    }

    // ========================================================================
    // Listeners and connections
    // ========================================================================

    /// Listen on the overlay; returns the foreign-facing listener descriptor.
    pub async fn listen(&self, sd: i32, network: &str, addr: &str) -> BridgeResult<OwnedFd> {
        self.listen_with(sd, network, addr, ListenMode::Tailnet).await
    }

    /// Listen with public exposure as well.
    pub async fn listen_funnel(
        &self,
        sd: i32,
        network: &str,
        addr: &str,
        funnel_only: bool,
    ) -> BridgeResult<OwnedFd> {
        self.listen_with(sd, network, addr, ListenMode::Funnel { funnel_only })
            .await
    }

    async fn listen_with(
        &self,
        sd: i32,
        network: &str,
        addr: &str,
        mode: ListenMode,
    ) -> BridgeResult<OwnedFd> {
        let server = self.server(sd)?;
        let result: BridgeResult<OwnedFd> = async {
            server.ensure_started().await?;
            let ln = server.node().listen(network, addr, mode).await?;
            server.log(format_args!("listening on {} ({network})", ln.local_addr()));
            listener::spawn(&self.shared, sd, ln)
        }
        .await;
        server.record(result)
    }

    /// Receive the next accepted connection, blocking the calling thread.
    ///
    /// For callers that prefer this to `recvmsg` on the listener descriptor.
    /// Do not call from inside an async task.
    pub fn accept(&self, listener_fd: i32) -> BridgeResult<OwnedFd> {
        listener::accept(&self.shared, listener_fd, false)
    }

    /// Like [`Bridge::accept`], but fails with `EAGAIN` when nothing is queued.
    pub fn accept_nonblocking(&self, listener_fd: i32) -> BridgeResult<OwnedFd> {
        listener::accept(&self.shared, listener_fd, true)
    }

    /// Dial over the overlay; returns the foreign-facing connection fd.
    pub async fn dial(&self, sd: i32, network: &str, addr: &str) -> BridgeResult<OwnedFd> {
        let server = self.server(sd)?;
        let result: BridgeResult<OwnedFd> = async {
            server.ensure_started().await?;
            let conn = server.node().dial(network, addr).await?;
            let (_, external) = pump::spawn(&self.shared, sd, None, conn)?;
            Ok(OwnedFd::from(external))
        }
        .await;
        server.record(result)
    }

    /// Tear down a listener. The caller still closes its descriptor.
    pub fn close_listener(&self, listener_fd: i32) -> BridgeResult<()> {
        let handle = self.shared.listeners.get(listener_fd)?;
        listener::teardown(&self.shared, &handle);
        Ok(())
    }

    /// Remote address, port stripped, of a connection accepted on `listener_fd`.
    pub fn remote_addr(&self, listener_fd: i32, conn: i32) -> BridgeResult<String> {
        listener::remote_addr(&self.shared, listener_fd, conn)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Fill the loopback address and the two credentials.
    ///
    /// All three buffers are NUL-terminated on every path. Credential buffers
    /// need room for [`CREDENTIAL_LEN`] bytes plus the terminator.
    pub async fn loopback(
        &self,
        sd: i32,
        addr_out: &mut [u8],
        proxy_cred_out: &mut [u8],
        local_api_cred_out: &mut [u8],
    ) -> BridgeResult<()> {
        cbuf::clear(addr_out);
        cbuf::clear(proxy_cred_out);
        cbuf::clear(local_api_cred_out);

        let server = self.server(sd)?;
        let result: BridgeResult<()> = async {
            server.ensure_started().await?;
            let loopback = server.node().loopback().await?;
            for (name, cred) in [
                ("proxy credential", &loopback.proxy_credential),
                ("local API credential", &loopback.local_api_credential),
            ] {
                if cred.len() != CREDENTIAL_LEN {
                    return Err(BridgeError::from(OverlayError::Other(format!(
                        "{name} is {} bytes, want {CREDENTIAL_LEN}",
                        cred.len()
                    ))));
                }
            }
            cbuf::write_cstr(addr_out, "loopback address", &loopback.address)?;
            cbuf::write_cstr(proxy_cred_out, "proxy credential", &loopback.proxy_credential)?;
            cbuf::write_cstr(
                local_api_cred_out,
                "local API credential",
                &loopback.local_api_credential,
            )
        }
        .await;
        server.record(result)
    }

    /// Copy the server's last error message into `out`.
    ///
    /// Reading the message does not change it.
    pub fn error_message(&self, sd: i32, out: &mut [u8]) -> BridgeResult<()> {
        cbuf::clear(out);
        let server = self.server(sd)?;
        cbuf::write_cstr(out, "error message", &server.last_error())
    }

    /// Comma-separated overlay addresses of the server's node.
    pub fn ip_addrs(&self, sd: i32, out: &mut [u8]) -> BridgeResult<()> {
        cbuf::clear(out);
        let server = self.server(sd)?;
        let result = if !server.is_started() {
            Err(BridgeError::from(OverlayError::NotStarted))
        } else {
            let ips = server.node().addresses();
            let joined = ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            cbuf::write_cstr(out, "address list", &joined)
        };
        server.record(result)
    }

    /// Comma-separated DNS names the server's node holds certificates for.
    pub fn cert_domains(&self, sd: i32, out: &mut [u8]) -> BridgeResult<()> {
        cbuf::clear(out);
        let server = self.server(sd)?;
        let domains = server.node().cert_domains();
        let result = if domains.is_empty() {
            Err(BridgeError::from(OverlayError::Other("no certificate domains".into())))
        } else {
            cbuf::write_cstr(out, "domain list", &domains.join(","))
        };
        server.record(result)
    }

    /// Current registry sizes
    pub fn counts(&self) -> Counts {
        Counts {
            servers: self.shared.servers.len(),
            listeners: self.shared.listeners.len(),
            connections: self.shared.conns.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memnet::MemoryNetwork;

    fn bridge() -> Bridge {
        Bridge::new(MemoryNetwork::new(), BridgeOptions::default())
    }

    #[test]
    fn test_options_default() {
        let options = BridgeOptions::default();
        assert_eq!(options.pump_buffer_size, 64 * 1024);
        assert_eq!(options.worker_threads, None);
    }

    #[test]
    fn test_new_server_descriptors_are_seeded() {
        let bridge = bridge();
        let first = bridge.new_server();
        let second = bridge.new_server();
        assert_eq!(first, HandleKind::Server.seed());
        assert_eq!(second, first + 1);
        assert_eq!(bridge.counts().servers, 2);
    }

    #[test]
    fn test_setters_reach_config() {
        let bridge = bridge();
        let sd = bridge.new_server();
        bridge.set_dir(sd, "/tmp/state").unwrap();
        bridge.set_hostname(sd, "node-a").unwrap();
        bridge.set_auth_key(sd, "key").unwrap();
        bridge.set_control_url(sd, "https://control.example").unwrap();
        bridge.set_ephemeral(sd, true).unwrap();

        let config = bridge.server(sd).unwrap().config();
        assert_eq!(config.dir, Some(PathBuf::from("/tmp/state")));
        assert_eq!(config.hostname.as_deref(), Some("node-a"));
        assert_eq!(config.auth_key.as_deref(), Some("key"));
        assert_eq!(config.control_url.as_deref(), Some("https://control.example"));
        assert!(config.ephemeral);
    }

    #[test]
    fn test_setters_on_unknown_server() {
        let bridge = bridge();
        let err = bridge.set_hostname(12345, "x").unwrap_err();
        assert_eq!(err.status(), -libc::EBADF);
        assert!(bridge.set_log_sink(12345, LogSink::Discard).unwrap_err().is_bad_descriptor());
    }

    #[test]
    fn test_error_message_clears_buffer_on_bad_descriptor() {
        let bridge = bridge();
        let mut out = [b'x'; 8];
        let err = bridge.error_message(99, &mut out).unwrap_err();
        assert!(err.is_bad_descriptor());
        assert_eq!(out[0], 0);
    }

    #[tokio::test]
    async fn test_ip_addrs_after_start() {
        let bridge = bridge();
        let sd = bridge.new_server();
        bridge.set_log_sink(sd, LogSink::Discard).unwrap();

        let mut out = [0u8; 64];
        assert_eq!(bridge.ip_addrs(sd, &mut out).unwrap_err().status(), -1);

        bridge.start(sd).await.unwrap();
        bridge.ip_addrs(sd, &mut out).unwrap();
        let text = std::ffi::CStr::from_bytes_until_nul(&out).unwrap().to_str().unwrap();
        assert!(text.starts_with("100.64.0.1,fd7a:115c:a1e0::"));

        let mut tiny = [0u8; 4];
        let err = bridge.ip_addrs(sd, &mut tiny).unwrap_err();
        assert_eq!(err.status(), -libc::ERANGE);
        assert_eq!(tiny[3], 0);
    }

    #[tokio::test]
    async fn test_cert_domains_need_hostname() {
        let bridge = bridge();
        let sd = bridge.new_server();
        bridge.set_log_sink(sd, LogSink::Discard).unwrap();
        bridge.set_hostname(sd, "web").unwrap();
        bridge.up(sd).await.unwrap();

        let mut out = [0u8; 64];
        bridge.cert_domains(sd, &mut out).unwrap();
        let text = std::ffi::CStr::from_bytes_until_nul(&out).unwrap();
        assert_eq!(text.to_str().unwrap(), "web.memnet.internal");
    }

    #[tokio::test]
    async fn test_close_server_twice() {
        let bridge = bridge();
        let sd = bridge.new_server();
        bridge.close_server(sd).await.unwrap();
        assert!(bridge.close_server(sd).await.unwrap_err().is_bad_descriptor());
        assert!(bridge.counts().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_close_server_has_one_winner() {
        let bridge = bridge();
        let sd = bridge.new_server();

        let closes: Vec<_> = (0..8)
            .map(|_| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.close_server(sd).await })
            })
            .collect();
        let mut winners = 0;
        for close in closes {
            match close.await.unwrap() {
                Ok(()) => winners += 1,
                Err(e) => assert!(e.is_bad_descriptor()),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(bridge.counts().servers, 0);
    }
}
