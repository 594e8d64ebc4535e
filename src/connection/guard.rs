// src/connection/guard.rs

//! Defines `TransferGuard`, an RAII guard for transfer resource management.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::server::ConnectionRegistry;

/// An RAII guard ensuring a transfer's registry entry is always released when
/// the dispatch scope is exited, whatever the handler did. Transfers on a
/// dedicated socket carry no registry entry and release nothing beyond the
/// socket itself, which closes when the connection drops.
pub(crate) struct TransferGuard {
    registry: Option<Arc<ConnectionRegistry>>,
    remote: SocketAddr,
}

impl TransferGuard {
    pub(crate) fn new(registry: Option<Arc<ConnectionRegistry>>, remote: SocketAddr) -> Self {
        Self { registry, remote }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            registry.remove(&self.remote);
            debug!("released registry entry for {}", self.remote);
        }
    }
}
