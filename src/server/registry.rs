// src/server/registry.rs

//! The registry mapping in-flight transfer endpoints to their inbound
//! datagram channels. Backs single-port mode only; in the default mode each
//! transfer owns a dedicated socket and never touches the registry.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Capacity of each transfer's inbound datagram channel. A full channel
/// stalls delivery of that transfer's own packets only; every transfer has
/// an independent channel.
const CHANNEL_CAPACITY: usize = 64;

/// Thread-safe endpoint-to-channel map. Lookups take the shared lock,
/// registration and removal the exclusive lock; no critical section spans
/// transfer I/O.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, mpsc::Sender<Bytes>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh channel for `addr` and returns its receiving end.
    /// An existing entry for the same endpoint is silently replaced; the
    /// displaced transfer observes its channel closing.
    pub fn insert(&self, addr: &SocketAddr) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.entries.write().insert(addr.to_string(), tx);
        rx
    }

    /// Non-blocking lookup of the inbound channel for `addr`.
    pub fn get(&self, addr: &SocketAddr) -> Option<mpsc::Sender<Bytes>> {
        self.entries.read().get(&addr.to_string()).cloned()
    }

    /// Deletes the entry for `addr` if present; no-op otherwise.
    pub fn remove(&self, addr: &SocketAddr) {
        self.entries.write().remove(&addr.to_string());
    }
}
