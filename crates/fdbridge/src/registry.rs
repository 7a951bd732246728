//! Thread-safe handle registry for bridge objects
//!
//! Maps integer descriptors to servers, listeners and connections. Each kind
//! lives in its own registry so the numeric spaces stay independent, and every
//! operation is a single atomic map operation: nothing here is held across I/O.
//!
//! Descriptors may be reused (counters wrap, kernel fd numbers get recycled),
//! so deletion on teardown paths goes through [`HandleRegistry::remove_occupant`],
//! which only removes the entry if it still holds the caller's object.

use crate::error::{BridgeError, BridgeResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which registry a descriptor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Overlay node instances
    Server,
    /// Bridged listeners (keyed by the foreign-facing fd)
    Listener,
    /// Bridged connections
    Connection,
}

impl HandleKind {
    /// First counter value for this kind.
    ///
    /// The offsets only make descriptors of different kinds easy to tell apart
    /// in logs; they carry no meaning.
    pub const fn seed(self) -> i32 {
        match self {
            HandleKind::Server => (42 << 16) + 1,
            HandleKind::Listener => (43 << 16) + 1,
            HandleKind::Connection => (44 << 16) + 1,
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Server => "server",
            HandleKind::Listener => "listener",
            HandleKind::Connection => "connection",
        })
    }
}

/// Thread-safe registry mapping descriptors to shared handles.
pub struct HandleRegistry<T> {
    kind: HandleKind,
    map: DashMap<i32, Arc<T>>,
    next: AtomicU64,
}

impl<T> HandleRegistry<T> {
    /// Create a new empty registry for `kind`.
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            map: DashMap::new(),
            next: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh counter descriptor and register the value built for it.
    ///
    /// The counter wraps back to the kind's seed and skips numbers that are
    /// still occupied, so a live descriptor is never handed out twice.
    pub fn allocate_with<F>(&self, build: F) -> (i32, Arc<T>)
    where
        F: FnOnce(i32) -> T,
    {
        let seed = self.kind.seed();
        let span = (i32::MAX - seed) as u64;
        loop {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            let descriptor = seed + (n % span) as i32;
            if let Entry::Vacant(slot) = self.map.entry(descriptor) {
                let value = Arc::new(build(descriptor));
                slot.insert(Arc::clone(&value));
                return (descriptor, value);
            }
        }
    }

    /// Register a value under an externally chosen descriptor.
    ///
    /// Returns the previous occupant, if any. For fd-keyed registries an
    /// occupant can only be left over from an fd the kernel already recycled,
    /// so the caller is expected to tear it down.
    pub fn insert(&self, descriptor: i32, value: Arc<T>) -> Option<Arc<T>> {
        self.map.insert(descriptor, value)
    }

    /// Look up a handle.
    pub fn get(&self, descriptor: i32) -> BridgeResult<Arc<T>> {
        self.map
            .get(&descriptor)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BridgeError::bad_descriptor(self.kind, descriptor))
    }

    /// Remove the entry if `pred` accepts the current occupant.
    pub fn remove_if<P>(&self, descriptor: i32, pred: P) -> Option<Arc<T>>
    where
        P: FnOnce(&Arc<T>) -> bool,
    {
        self.map
            .remove_if(&descriptor, |_, current| pred(current))
            .map(|(_, value)| value)
    }

    /// Remove the entry only if it still holds `occupant`.
    ///
    /// Returns true if this call removed it. Concurrent teardown paths race on
    /// this; exactly one of them sees `true`.
    pub fn remove_occupant(&self, descriptor: i32, occupant: &Arc<T>) -> bool {
        self.remove_if(descriptor, |current| Arc::ptr_eq(current, occupant))
            .is_some()
    }

    /// Check whether a descriptor is registered
    pub fn contains(&self, descriptor: i32) -> bool {
        self.map.contains_key(&descriptor)
    }

    /// Copy out all current entries.
    pub fn snapshot(&self) -> Vec<(i32, Arc<T>)> {
        self.map
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
