//! Kernel socket helpers
//!
//! Socket pairs, SCM_RIGHTS descriptor passing and half-close, on top of
//! `libc`. Writes never raise SIGPIPE: the bridge usually lives inside a
//! foreign process that has not ignored it.

use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::ptr;
use tokio::io::Interest;
use tokio::net::UnixStream;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Room for one `SCM_RIGHTS` descriptor, over-aligned for `cmsghdr`.
type ControlBuf = [u64; 8];

/// A connected pair of local stream sockets.
pub struct SocketPair {
    /// Bridge side, registered with the tokio reactor
    pub internal: UnixStream,
    /// Foreign side, left in blocking mode
    pub external: StdUnixStream,
}

/// Create a socket pair. Must be called from within a tokio runtime.
pub fn socket_pair() -> io::Result<SocketPair> {
    let (internal, external) = StdUnixStream::pair()?;
    suppress_sigpipe(&internal)?;
    suppress_sigpipe(&external)?;
    internal.set_nonblocking(true)?;
    Ok(SocketPair {
        internal: UnixStream::from_std(internal)?,
        external,
    })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn suppress_sigpipe(sock: &impl AsRawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn suppress_sigpipe(_sock: &impl AsRawFd) -> io::Result<()> {
    Ok(())
}

/// Shut down one or both directions of a socket.
pub fn shutdown(sock: &impl AsRawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    if unsafe { libc::shutdown(sock.as_raw_fd(), how) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Device and inode of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

/// Identify the open file behind `fd`.
///
/// Stable while any descriptor refers to the file; a recycled fd number
/// pointing elsewhere yields a different id.
pub fn file_id(fd: RawFd) -> io::Result<FileId> {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FileId {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
    })
}

/// Whether the peer has closed its end entirely, as opposed to `SHUT_WR`.
///
/// Never blocks. After a half-close only the read side is shut down and no
/// hangup is reported.
pub fn peer_hung_up(sock: &impl AsRawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd: sock.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc > 0 && pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0
}

fn send_raw(sock: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::send(sock, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Read from a reactor-registered stream; `Ok(0)` is end of stream.
pub async fn read(stream: &UnixStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write some of `buf` without raising SIGPIPE.
pub async fn write(stream: &UnixStream, buf: &[u8]) -> io::Result<usize> {
    let sock = stream.as_raw_fd();
    stream
        .async_io(Interest::WRITABLE, || send_raw(sock, buf))
        .await
}

/// Write all of `buf` without raising SIGPIPE.
pub async fn write_all(stream: &UnixStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write(stream, buf).await? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Send `payload` with `fd` attached as `SCM_RIGHTS`.
///
/// The receiver gets its own duplicate of `fd`; the caller still owns and
/// must close the original.
pub async fn send_fd(stream: &UnixStream, payload: &[u8], fd: RawFd) -> io::Result<()> {
    debug_assert!(!payload.is_empty(), "stream sockets drop ancillary data without payload");
    let sock = stream.as_raw_fd();
    let sent = stream
        .async_io(Interest::WRITABLE, || sendmsg_fd(sock, payload, fd))
        .await?;
    // The descriptor rode on the first byte; any tail is plain data.
    if sent < payload.len() {
        write_all(stream, &payload[sent..]).await?;
    }
    Ok(())
}

fn sendmsg_fd(sock: RawFd, payload: &[u8], fd: RawFd) -> io::Result<usize> {
    let mut control: ControlBuf = [0; 8];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    unsafe {
        let space = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
        debug_assert!(space <= mem::size_of::<ControlBuf>());

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);

        let n = libc::sendmsg(sock, &msg, SEND_FLAGS);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Receive into `buf` from a foreign-side socket, collecting a passed descriptor.
///
/// Blocks unless `nonblocking`, in which case an empty queue is `WouldBlock`.
/// Extra descriptors beyond the first are closed. `Ok((0, None))` is end of
/// stream.
pub fn recv_fd(sock: RawFd, buf: &mut [u8], nonblocking: bool) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut control: ControlBuf = [0; 8];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let flags = RECV_FLAGS | if nonblocking { libc::MSG_DONTWAIT } else { 0 };

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of::<ControlBuf>() as _;

        let n = loop {
            let n = libc::recvmsg(sock, &mut msg, flags);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut received: Option<OwnedFd> = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..len / mem::size_of::<RawFd>() {
                    let fd = OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i)));
                    if received.is_none() {
                        received = Some(fd);
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        if let Some(fd) = &received {
            libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok((n, received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[tokio::test]
    async fn test_pair_carries_bytes_both_ways() {
        let pair = socket_pair().unwrap();
        let mut external = pair.external;

        write_all(&pair.internal, b"ping").await.unwrap();
        let mut got = [0u8; 4];
        external.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        external.write_all(b"pong").unwrap();
        let mut got = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            filled += read(&pair.internal, &mut got[filled..]).await.unwrap();
        }
        assert_eq!(&got, b"pong");
    }

    #[tokio::test]
    async fn test_fd_passing() {
        let notify = socket_pair().unwrap();
        let (mut a, b) = StdUnixStream::pair().unwrap();

        send_fd(&notify.internal, &7i32.to_ne_bytes(), b.as_raw_fd()).await.unwrap();
        drop(b);

        let mut payload = [0u8; 4];
        let (n, fd) = recv_fd(notify.external.as_raw_fd(), &mut payload, false).unwrap();
        assert_eq!(n, 4);
        assert_eq!(i32::from_ne_bytes(payload), 7);

        let mut passed = StdUnixStream::from(fd.expect("descriptor attached"));
        a.write_all(b"via scm_rights").unwrap();
        let mut got = [0u8; 14];
        passed.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"via scm_rights");
    }

    #[tokio::test]
    async fn test_recv_nonblocking_empty_would_block() {
        let pair = socket_pair().unwrap();
        let mut buf = [0u8; 4];
        let err = recv_fd(pair.external.as_raw_fd(), &mut buf, true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_shutdown_write_gives_peer_eof() {
        let pair = socket_pair().unwrap();
        shutdown(&pair.internal, Shutdown::Write).unwrap();

        let mut external = pair.external;
        let mut buf = [0u8; 8];
        assert_eq!(external.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_file_id_follows_the_file() {
        let (a, b) = StdUnixStream::pair().unwrap();
        let id = file_id(a.as_raw_fd()).unwrap();
        assert_eq!(file_id(a.try_clone().unwrap().as_raw_fd()).unwrap(), id);
        assert_ne!(file_id(b.as_raw_fd()).unwrap(), id);
    }

    #[tokio::test]
    async fn test_hangup_distinguishes_close_from_half_close() {
        let pair = socket_pair().unwrap();
        assert!(!peer_hung_up(&pair.internal));

        shutdown(&pair.external, Shutdown::Write).unwrap();
        assert!(!peer_hung_up(&pair.internal));

        drop(pair.external);
        assert!(peer_hung_up(&pair.internal));
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_errors_without_signal() {
        let pair = socket_pair().unwrap();
        drop(pair.external);

        let err = write_all(&pair.internal, b"nobody home").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
