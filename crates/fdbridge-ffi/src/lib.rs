//! C ABI for the descriptor bridge
//!
//! Exposes one process-wide [`Bridge`] to C callers. The API follows these
//! principles:
//! - Every object is an `int` descriptor; listeners and connections are real
//!   file descriptors the caller can poll, read, write and close
//! - `0` is success, negative values are `-errno` style codes, and `-1` means
//!   "see `fdbridge_errmsg`"
//! - Output buffers are always left NUL-terminated
//! - NULL or zero-length output buffers are programming errors and abort
//!
//! The bridge, its tokio runtime and the log subscriber are created on first
//! use. Logging is controlled by `FDBRIDGE_LOG` (an `EnvFilter` directive).

use fdbridge::{
    cbuf, Bridge, BridgeError, BridgeOptions, BridgeResult, LogSink, MemoryNetwork, NodeFactory,
    CREDENTIAL_LEN,
};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::future::Future;
use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::raw::{c_char, c_int};
use std::slice;
use std::sync::{Arc, LazyLock, OnceLock};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Global State
// ============================================================================

struct Global {
    runtime: Runtime,
    bridge: Bridge,
}

static FACTORY: OnceLock<Arc<dyn NodeFactory>> = OnceLock::new();
static GLOBAL: OnceLock<Global> = OnceLock::new();

impl Global {
    fn build() -> Self {
        init_logging();
        let factory = FACTORY
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(MemoryNetwork::shared()));
        let bridge = Bridge::with_factory(factory, BridgeOptions::from_env());

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("fdbridge-worker");
        if let Some(threads) = bridge.options().worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder.build().expect("failed to create tokio runtime");

        tracing::debug!(options = ?bridge.options(), "fdbridge initialized");
        Self { runtime, bridge }
    }
}

fn global() -> &'static Global {
    GLOBAL.get_or_init(Global::build)
}

fn bridge() -> &'static Bridge {
    &global().bridge
}

fn block_on<F: Future>(future: F) -> F::Output {
    global().runtime.block_on(future)
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("FDBRIDGE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    // A host application that already installed a subscriber keeps it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Install the overlay runtime that servers created through the C ABI use.
///
/// Must be called before the first `fdbridge_*` call; returns false if the
/// bridge is already running or a factory was installed before. Without it,
/// servers join the process-wide in-process network.
pub fn install_node_factory(factory: Arc<dyn NodeFactory>) -> bool {
    if GLOBAL.get().is_some() {
        return false;
    }
    FACTORY.set(factory).is_ok()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Borrow a C string argument.
unsafe fn arg_str<'a>(ptr: *const c_char, what: &str) -> BridgeResult<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument(format!("{what} is NULL")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| BridgeError::InvalidArgument(format!("{what} is not valid UTF-8")))
}

/// Borrow a required output buffer; NULL or empty aborts.
unsafe fn out_buf<'a>(ptr: *mut c_char, len: usize, what: &str) -> &'a mut [u8] {
    assert!(!ptr.is_null(), "{what}: NULL buffer");
    assert!(len > 0, "{what}: buffer length of 0");
    slice::from_raw_parts_mut(ptr as *mut u8, len)
}

/// Borrow a required `int` out-parameter; NULL aborts.
unsafe fn out_int<'a>(ptr: *mut c_int, what: &str) -> &'a mut c_int {
    assert!(!ptr.is_null(), "{what}: NULL out-parameter");
    &mut *ptr
}

fn status(result: BridgeResult<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => e.status(),
    }
}

/// Hand a new descriptor to the caller.
fn publish(result: BridgeResult<OwnedFd>, out: &mut c_int) -> c_int {
    match result {
        Ok(fd) => {
            *out = fd.into_raw_fd();
            0
        }
        Err(e) => e.status(),
    }
}

/// Reject an argument, recording the reason on the server.
fn rejected(sd: c_int, error: BridgeError) -> c_int {
    bridge().report(sd, error).status()
}

macro_rules! arg {
    ($sd:expr, $ptr:expr, $what:literal) => {
        match arg_str($ptr, $what) {
            Ok(value) => value,
            Err(e) => return rejected($sd, e),
        }
    };
}

// ============================================================================
// Server Lifecycle
// ============================================================================

/// Create a new server.
///
/// # Returns
/// * Server descriptor (always positive)
#[no_mangle]
pub extern "C" fn fdbridge_new() -> c_int {
    bridge().new_server()
}

/// Connect the server to the overlay without waiting for it to be usable.
///
/// # Returns
/// * `0` on success, `-EBADF` for an unknown server, `-1` otherwise
#[no_mangle]
pub extern "C" fn fdbridge_start(sd: c_int) -> c_int {
    status(block_on(bridge().start(sd)))
}

/// Connect the server and wait until it is usable.
#[no_mangle]
pub extern "C" fn fdbridge_up(sd: c_int) -> c_int {
    status(block_on(bridge().up(sd)))
}

/// Close the server together with every listener and connection it owns.
///
/// # Returns
/// * `0` on success, `-EBADF` for an unknown server
/// * `-1` if the overlay reported a failure while closing; the server is
///   gone either way
#[no_mangle]
pub extern "C" fn fdbridge_close(sd: c_int) -> c_int {
    status(block_on(bridge().close_server(sd)))
}

// ============================================================================
// Configuration
// ============================================================================

/// Set the state directory. Takes effect at start.
///
/// # Safety
/// `dir` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_set_dir(sd: c_int, dir: *const c_char) -> c_int {
    let dir = arg!(sd, dir, "dir");
    status(bridge().set_dir(sd, dir))
}

/// Set the overlay hostname. Takes effect at start.
///
/// # Safety
/// `hostname` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_set_hostname(sd: c_int, hostname: *const c_char) -> c_int {
    let hostname = arg!(sd, hostname, "hostname");
    status(bridge().set_hostname(sd, hostname))
}

/// Set the auth key. Takes effect at start.
///
/// # Safety
/// `authkey` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_set_authkey(sd: c_int, authkey: *const c_char) -> c_int {
    let authkey = arg!(sd, authkey, "authkey");
    status(bridge().set_auth_key(sd, authkey))
}

/// Set the control server URL. Takes effect at start.
///
/// # Safety
/// `control_url` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_set_control_url(sd: c_int, control_url: *const c_char) -> c_int {
    let control_url = arg!(sd, control_url, "control_url");
    status(bridge().set_control_url(sd, control_url))
}

/// Mark the node ephemeral (`e != 0`).
#[no_mangle]
pub extern "C" fn fdbridge_set_ephemeral(sd: c_int, e: c_int) -> c_int {
    status(bridge().set_ephemeral(sd, e != 0))
}

/// Send the server's log lines to `fd`, or discard them if `fd` is `-1`.
///
/// The descriptor is duplicated; the caller keeps ownership of `fd`.
#[no_mangle]
pub extern "C" fn fdbridge_set_logfd(sd: c_int, fd: c_int) -> c_int {
    let sink = if fd == -1 {
        LogSink::Discard
    } else {
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return rejected(sd, BridgeError::Io(io::Error::last_os_error()));
        }
        LogSink::Fd(unsafe { File::from_raw_fd(dup) })
    };
    status(bridge().set_log_sink(sd, sink))
}

// ============================================================================
// Listeners and Connections
// ============================================================================

/// Listen on the overlay.
///
/// `*listener_out` receives a descriptor that becomes readable when a
/// connection arrives; receive it with `fdbridge_accept` or `recvmsg`
/// (`SCM_RIGHTS`). Close the listener with `close` or
/// `fdbridge_close_listener`.
///
/// # Safety
/// String arguments must be NULL or valid NUL-terminated strings;
/// `listener_out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_listen(
    sd: c_int,
    network: *const c_char,
    addr: *const c_char,
    listener_out: *mut c_int,
) -> c_int {
    let out = out_int(listener_out, "fdbridge_listen");
    *out = -1;
    let network = arg!(sd, network, "network");
    let addr = arg!(sd, addr, "addr");
    publish(block_on(bridge().listen(sd, network, addr)), out)
}

/// Listen on the overlay and the public internet.
///
/// With `funnel_only != 0` connections from the overlay itself are refused.
///
/// # Safety
/// As for [`fdbridge_listen`].
#[no_mangle]
pub unsafe extern "C" fn fdbridge_listen_funnel(
    sd: c_int,
    network: *const c_char,
    addr: *const c_char,
    funnel_only: c_int,
    listener_out: *mut c_int,
) -> c_int {
    let out = out_int(listener_out, "fdbridge_listen_funnel");
    *out = -1;
    let network = arg!(sd, network, "network");
    let addr = arg!(sd, addr, "addr");
    publish(
        block_on(bridge().listen_funnel(sd, network, addr, funnel_only != 0)),
        out,
    )
}

/// Accept a connection, blocking until one arrives.
///
/// # Returns
/// * `0` with `*conn_out` set
/// * `-EBADF` if the listener is unknown or has been closed
///
/// # Safety
/// `conn_out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_accept(listener: c_int, conn_out: *mut c_int) -> c_int {
    let out = out_int(conn_out, "fdbridge_accept");
    *out = -1;
    publish(bridge().accept(listener), out)
}

/// Accept a connection if one is queued; `-EAGAIN` otherwise.
///
/// # Safety
/// `conn_out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_accept_nonblocking(listener: c_int, conn_out: *mut c_int) -> c_int {
    let out = out_int(conn_out, "fdbridge_accept_nonblocking");
    *out = -1;
    publish(bridge().accept_nonblocking(listener), out)
}

/// Dial over the overlay.
///
/// # Safety
/// String arguments must be NULL or valid NUL-terminated strings;
/// `conn_out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_dial(
    sd: c_int,
    network: *const c_char,
    addr: *const c_char,
    conn_out: *mut c_int,
) -> c_int {
    let out = out_int(conn_out, "fdbridge_dial");
    *out = -1;
    let network = arg!(sd, network, "network");
    let addr = arg!(sd, addr, "addr");
    publish(block_on(bridge().dial(sd, network, addr)), out)
}

/// Tear down a listener and close its descriptor.
#[no_mangle]
pub extern "C" fn fdbridge_close_listener(listener: c_int) -> c_int {
    let result = bridge().close_listener(listener);
    if result.is_ok() {
        unsafe { libc::close(listener) };
    }
    status(result)
}

/// Write the remote address (without port) of an accepted connection.
///
/// `conn` is the fd from `fdbridge_accept` or the descriptor carried in an
/// accept notification.
///
/// # Safety
/// `buf` must be valid for `buflen` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_getremoteaddr(
    listener: c_int,
    conn: c_int,
    buf: *mut c_char,
    buflen: usize,
) -> c_int {
    let out = out_buf(buf, buflen, "fdbridge_getremoteaddr");
    cbuf::clear(out);
    let result = bridge()
        .remote_addr(listener, conn)
        .and_then(|addr| cbuf::write_cstr(out, "remote address", &addr));
    status(result)
}

// ============================================================================
// Queries
// ============================================================================

/// Start the loopback server and describe it.
///
/// # Returns
/// * `0` with all three outputs filled
/// * `-ERANGE` if the address does not fit in `addrlen` bytes
///
/// # Safety
/// `addr_out` must be valid for `addrlen` bytes; both credential buffers
/// must be valid for 33 bytes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_loopback(
    sd: c_int,
    addr_out: *mut c_char,
    addrlen: usize,
    proxy_cred_out: *mut c_char,
    local_api_cred_out: *mut c_char,
) -> c_int {
    let addr = out_buf(addr_out, addrlen, "fdbridge_loopback addr_out");
    let proxy = out_buf(proxy_cred_out, CREDENTIAL_LEN + 1, "fdbridge_loopback proxy_cred_out");
    let local = out_buf(
        local_api_cred_out,
        CREDENTIAL_LEN + 1,
        "fdbridge_loopback local_api_cred_out",
    );
    status(block_on(bridge().loopback(sd, addr, proxy, local)))
}

/// Copy the server's last error message.
///
/// # Returns
/// * `0` on success, `-EBADF` for an unknown server
/// * `-ERANGE` if the message was truncated
///
/// # Safety
/// `buf` must be valid for `buflen` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_errmsg(sd: c_int, buf: *mut c_char, buflen: usize) -> c_int {
    let out = out_buf(buf, buflen, "fdbridge_errmsg");
    status(bridge().error_message(sd, out))
}

/// Comma-separated overlay addresses of a started server.
///
/// # Safety
/// `buf` must be valid for `buflen` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_getips(sd: c_int, buf: *mut c_char, buflen: usize) -> c_int {
    let out = out_buf(buf, buflen, "fdbridge_getips");
    status(bridge().ip_addrs(sd, out))
}

/// Comma-separated DNS names the server can hold certificates for.
///
/// # Safety
/// `buf` must be valid for `buflen` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn fdbridge_cert_domains(sd: c_int, buf: *mut c_char, buflen: usize) -> c_int {
    let out = out_buf(buf, buflen, "fdbridge_cert_domains");
    status(bridge().cert_domains(sd, out))
}

// ============================================================================
// Version Information
// ============================================================================

/// Library version string. Static; do not free.
#[no_mangle]
pub extern "C" fn fdbridge_version() -> *const c_char {
    static VERSION: LazyLock<CString> =
        LazyLock::new(|| CString::new(fdbridge::VERSION).unwrap_or_default());
    VERSION.as_ptr()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::thread;
    use std::time::Duration;

    fn c(s: &str) -> std::ffi::CString {
        std::ffi::CString::new(s).unwrap()
    }

    fn text(buf: &[u8]) -> &str {
        CStr::from_bytes_until_nul(buf).unwrap().to_str().unwrap()
    }

    fn server(hostname: &str) -> c_int {
        let sd = fdbridge_new();
        assert_eq!(fdbridge_set_logfd(sd, -1), 0);
        let name = c(hostname);
        unsafe {
            assert_eq!(fdbridge_set_hostname(sd, name.as_ptr()), 0);
        }
        assert_eq!(fdbridge_up(sd), 0);
        sd
    }

    fn errmsg(sd: c_int) -> String {
        let mut buf = [0u8; 256];
        unsafe {
            fdbridge_errmsg(sd, buf.as_mut_ptr() as *mut c_char, buf.len());
        }
        text(&buf).to_string()
    }

    #[test]
    fn test_version() {
        let version = unsafe { CStr::from_ptr(fdbridge_version()) };
        assert_eq!(version.to_str().unwrap(), fdbridge::VERSION);
    }

    #[test]
    fn test_server_lifecycle() {
        let sd = fdbridge_new();
        assert!(sd > 0);
        assert_eq!(fdbridge_set_ephemeral(sd, 1), 0);
        assert_eq!(fdbridge_start(sd), 0);
        assert_eq!(fdbridge_close(sd), 0);
        assert_eq!(fdbridge_close(sd), -libc::EBADF);
        assert_eq!(fdbridge_up(sd), -libc::EBADF);
    }

    #[test]
    fn test_errmsg_bad_descriptor_and_range() {
        let mut buf = [0xffu8; 8];
        let rc = unsafe { fdbridge_errmsg(-5, buf.as_mut_ptr() as *mut c_char, buf.len()) };
        assert_eq!(rc, -libc::EBADF);
        assert_eq!(buf[0], 0);

        let sd = server("ffi-range");
        let network = c("udp");
        let addr = c(":53");
        let mut ln = 0;
        let rc = unsafe { fdbridge_listen(sd, network.as_ptr(), addr.as_ptr(), &mut ln) };
        assert_eq!(rc, -1);
        assert_eq!(ln, -1);

        let mut one = [0xffu8; 1];
        let rc = unsafe { fdbridge_errmsg(sd, one.as_mut_ptr() as *mut c_char, 1) };
        assert_eq!(rc, -libc::ERANGE);
        assert_eq!(one[0], 0);
        assert!(errmsg(sd).contains("unsupported network"));
        fdbridge_close(sd);
    }

    #[test]
    fn test_null_string_is_recorded() {
        let sd = fdbridge_new();
        fdbridge_set_logfd(sd, -1);
        let rc = unsafe { fdbridge_set_hostname(sd, ptr::null()) };
        assert_eq!(rc, -1);
        assert_eq!(errmsg(sd), "invalid argument: hostname is NULL");
        fdbridge_close(sd);
    }

    #[test]
    fn test_listen_dial_accept_relay() {
        let alpha = server("ffi-alpha");
        let beta = server("ffi-beta");
        let tcp = c("tcp");

        let mut ln = -1;
        let port = c(":7000");
        assert_eq!(unsafe { fdbridge_listen(alpha, tcp.as_ptr(), port.as_ptr(), &mut ln) }, 0);

        let mut conn = -1;
        let target = c("ffi-alpha:7000");
        assert_eq!(unsafe { fdbridge_dial(beta, tcp.as_ptr(), target.as_ptr(), &mut conn) }, 0);

        let mut accepted = -1;
        assert_eq!(unsafe { fdbridge_accept(ln, &mut accepted) }, 0);

        let sent = unsafe { libc::write(conn, b"ping".as_ptr() as *const libc::c_void, 4) };
        assert_eq!(sent, 4);
        let mut got = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            let n = unsafe {
                libc::read(accepted, got[filled..].as_mut_ptr() as *mut libc::c_void, 4 - filled)
            };
            assert!(n > 0);
            filled += n as usize;
        }
        assert_eq!(&got, b"ping");

        let mut addr = [0u8; 64];
        let rc = unsafe {
            fdbridge_getremoteaddr(ln, accepted, addr.as_mut_ptr() as *mut c_char, addr.len())
        };
        assert_eq!(rc, 0);
        assert!(text(&addr).starts_with("100.64.0."));
        assert!(!text(&addr).contains(':'));

        let mut again = -1;
        assert_eq!(unsafe { fdbridge_accept_nonblocking(ln, &mut again) }, -libc::EAGAIN);

        unsafe {
            libc::close(conn);
            libc::close(accepted);
        }
        assert_eq!(fdbridge_close_listener(ln), 0);
        assert_eq!(fdbridge_close(alpha), 0);
        assert_eq!(fdbridge_close(beta), 0);
    }

    #[test]
    fn test_listener_fd_close_is_noticed() {
        let sd = server("ffi-watch");
        let tcp = c("tcp");
        let port = c(":7001");
        let mut ln = -1;
        assert_eq!(unsafe { fdbridge_listen(sd, tcp.as_ptr(), port.as_ptr(), &mut ln) }, 0);
        unsafe { libc::close(ln) };

        // The port frees up once the sentinel has torn the listener down.
        let mut relisten = -1;
        let mut rc = -1;
        for _ in 0..200 {
            rc = unsafe { fdbridge_listen(sd, tcp.as_ptr(), port.as_ptr(), &mut relisten) };
            if rc == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rc, 0);
        fdbridge_close(sd);
        unsafe { libc::close(relisten) };
    }

    #[test]
    fn test_loopback_and_queries() {
        let sd = server("ffi-lo");
        let mut addr = [0u8; 64];
        let mut proxy = [0u8; 33];
        let mut local = [0u8; 33];
        let rc = unsafe {
            fdbridge_loopback(
                sd,
                addr.as_mut_ptr() as *mut c_char,
                addr.len(),
                proxy.as_mut_ptr() as *mut c_char,
                local.as_mut_ptr() as *mut c_char,
            )
        };
        assert_eq!(rc, 0);
        assert!(text(&addr).starts_with("127.0.0.1:"));
        assert_eq!(text(&proxy).len(), 32);
        assert_eq!(text(&local).len(), 32);

        let mut ips = [0u8; 128];
        let rc = unsafe { fdbridge_getips(sd, ips.as_mut_ptr() as *mut c_char, ips.len()) };
        assert_eq!(rc, 0);
        assert_eq!(text(&ips).split(',').count(), 2);

        let mut domains = [0u8; 128];
        let rc = unsafe {
            fdbridge_cert_domains(sd, domains.as_mut_ptr() as *mut c_char, domains.len())
        };
        assert_eq!(rc, 0);
        assert_eq!(text(&domains), "ffi-lo.memnet.internal");
        fdbridge_close(sd);
    }

    #[test]
    fn test_logfd_receives_errors() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let sd = fdbridge_new();
        assert_eq!(fdbridge_set_logfd(sd, fds[1]), 0);
        unsafe { libc::close(fds[1]) };

        let rc = unsafe { fdbridge_set_dir(sd, ptr::null()) };
        assert_eq!(rc, -1);
        // Dropping the sink closes the duplicated write end.
        assert_eq!(fdbridge_close(sd), 0);

        let mut file = unsafe { File::from_raw_fd(fds[0]) };
        let mut out = String::new();
        io::Read::read_to_string(&mut file, &mut out).unwrap();
        assert!(out.contains("dir is NULL"), "{out}");
    }
}
