//! Shared helpers for bridge integration tests

#![allow(dead_code)]

use fdbridge::{Bridge, BridgeOptions, BridgeResult, LogSink, MemoryNetwork};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// A bridge on a private network with two started servers, `alpha` and `beta`.
pub struct Fixture {
    pub bridge: Bridge,
    pub net: MemoryNetwork,
    pub alpha: i32,
    pub beta: i32,
}

pub async fn fixture() -> Fixture {
    let net = MemoryNetwork::new();
    let bridge = Bridge::new(net.clone(), BridgeOptions::default());
    let alpha = server(&bridge, "alpha").await;
    let beta = server(&bridge, "beta").await;
    Fixture {
        bridge,
        net,
        alpha,
        beta,
    }
}

pub async fn server(bridge: &Bridge, hostname: &str) -> i32 {
    let sd = bridge.new_server();
    bridge.set_log_sink(sd, LogSink::Discard).unwrap();
    bridge.set_hostname(sd, hostname).unwrap();
    bridge.start(sd).await.unwrap();
    sd
}

/// Blocking accept, run off the async workers.
pub async fn accept(bridge: &Bridge, listener: &OwnedFd) -> BridgeResult<OwnedFd> {
    let bridge = bridge.clone();
    let fd = listener.as_raw_fd();
    tokio::task::spawn_blocking(move || bridge.accept(fd))
        .await
        .unwrap()
}

/// Wrap a bridged fd for async use in the test body.
pub fn stream(fd: OwnedFd) -> UnixStream {
    let std = StdUnixStream::from(fd);
    std.set_nonblocking(true).unwrap();
    UnixStream::from_std(std).unwrap()
}

pub async fn read_to_end(stream: &mut UnixStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

pub async fn send(stream: &mut UnixStream, data: &[u8]) {
    stream.write_all(data).await.unwrap();
}

/// Poll until every registry is empty, failing after a few seconds.
pub async fn wait_until_empty(bridge: &Bridge) {
    for _ in 0..500 {
        if bridge.counts().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("handles still registered: {:?}", bridge.counts());
}

/// Poll until `check` holds, failing after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub fn cstr(buf: &[u8]) -> &str {
    std::ffi::CStr::from_bytes_until_nul(buf)
        .unwrap()
        .to_str()
        .unwrap()
}
