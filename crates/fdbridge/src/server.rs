//! Server facade state
//!
//! One [`ServerHandle`] per overlay node. It carries the node's pending
//! configuration, its log destination and the last error reported to the
//! foreign caller.

use crate::error::{BridgeError, BridgeResult};
use crate::overlay::{NodeConfig, OverlayNode};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a server's own log lines go
#[derive(Debug, Default)]
pub enum LogSink {
    /// Emit through `tracing` (the default)
    #[default]
    Tracing,
    /// Drop everything
    Discard,
    /// Write lines to a file or descriptor owned by the sink
    Fd(File),
}

/// A registered overlay node.
pub struct ServerHandle {
    descriptor: i32,
    node: Arc<dyn OverlayNode>,
    config: Mutex<NodeConfig>,
    log_sink: Mutex<LogSink>,
    last_error: Mutex<String>,
    started: AtomicBool,
}

impl ServerHandle {
    pub(crate) fn new(descriptor: i32, node: Arc<dyn OverlayNode>) -> Self {
        Self {
            descriptor,
            node,
            config: Mutex::new(NodeConfig::default()),
            log_sink: Mutex::new(LogSink::default()),
            last_error: Mutex::new(String::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Server descriptor
    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// The overlay node
    pub fn node(&self) -> &Arc<dyn OverlayNode> {
        &self.node
    }

    /// Copy of the node configuration
    pub fn config(&self) -> NodeConfig {
        self.config.lock().clone()
    }

    pub(crate) fn update_config(&self, update: impl FnOnce(&mut NodeConfig)) {
        update(&mut self.config.lock());
    }

    /// Message of the last failed operation; empty after a success.
    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    /// Store the outcome of an operation as the last error.
    pub(crate) fn record<T>(&self, result: BridgeResult<T>) -> BridgeResult<T> {
        match &result {
            Ok(_) => self.last_error.lock().clear(),
            Err(e) => self.set_last_error(e),
        }
        result
    }

    pub(crate) fn set_last_error(&self, error: &BridgeError) {
        *self.last_error.lock() = error.to_string();
        self.log(format_args!("{error}"));
    }

    pub(crate) fn set_log_sink(&self, sink: LogSink) {
        *self.log_sink.lock() = sink;
    }

    /// Start the node unless it already is.
    pub(crate) async fn ensure_started(&self) -> BridgeResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let config = self.config();
        self.node.start(&config).await?;
        self.started.store(true, Ordering::Release);
        self.log(format_args!("started"));
        Ok(())
    }

    /// Bring the node up; implies started.
    pub(crate) async fn bring_up(&self) -> BridgeResult<()> {
        let config = self.config();
        self.node.up(&config).await?;
        self.started.store(true, Ordering::Release);
        self.log(format_args!("up"));
        Ok(())
    }

    /// Whether `start` or `up` has succeeded
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Write a server-scoped line to this server's sink.
    pub fn log(&self, args: fmt::Arguments<'_>) {
        let mut sink = self.log_sink.lock();
        match &mut *sink {
            LogSink::Tracing => tracing::info!(server = self.descriptor, "{}", args),
            LogSink::Discard => {}
            LogSink::Fd(file) => {
                // A broken log destination must not fail the operation.
                let _ = writeln!(file, "fdbridge[{}]: {}", self.descriptor, args);
            }
        }
    }
}
