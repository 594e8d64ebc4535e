// src/server/mod.rs

//! The UDP server: configuration surface, receive loop, and lifecycle.
//!
//! One long-lived receive task owns the socket for reads; every classified
//! datagram is dispatched on its own task so a slow or failing transfer can
//! never stall acceptance of new requests.

mod dispatch;
mod registry;

pub use registry::ConnectionRegistry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::watch;
use tracing::debug;

use crate::core::TftpError;
use crate::core::handler::{ReadHandler, WriteHandler};
use crate::core::protocol::MAX_DATAGRAM_SIZE;
use dispatch::Dispatcher;

/// Per-packet retransmission limit applied to every transfer unless
/// configured otherwise.
pub const DEFAULT_RETRANSMIT: u32 = 10;

/// Address family the listening socket binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketFamily {
    /// Both IPv4 and IPv6 ("udp").
    #[default]
    DualStack,
    /// IPv4 only ("udp4").
    V4,
    /// IPv6 only ("udp6").
    V6,
}

/// Builds a [`Server`], validating the configuration at `build()`.
///
/// Configuration is fixed once the server is built; nothing about it can be
/// changed after the socket opens.
pub struct ServerBuilder {
    bind_addr: String,
    family: SocketFamily,
    retransmit: i32,
    single_port: bool,
}

impl ServerBuilder {
    /// The address family to listen on. Default: dual stack.
    pub fn family(mut self, family: SocketFamily) -> Self {
        self.family = family;
        self
    }

    /// The per-packet retransmission limit for all transfers. Negative
    /// values are rejected at `build()`. Default: 10.
    pub fn retransmit(mut self, limit: i32) -> Self {
        self.retransmit = limit;
        self
    }

    /// Service all transfers over the single listening port instead of the
    /// standard behavior of a fresh port per transfer. Default: disabled.
    pub fn single_port(mut self, enable: bool) -> Self {
        self.single_port = enable;
        self
    }

    pub fn build(self) -> Result<Server, TftpError> {
        if self.retransmit < 0 {
            return Err(TftpError::InvalidRetransmit);
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Server {
            bind_addr: self.bind_addr,
            family: self.family,
            retransmit: self.retransmit as u32,
            single_port: self.single_port,
            registry: self
                .single_port
                .then(|| Arc::new(ConnectionRegistry::new())),
            read_handler: None,
            write_handler: None,
            socket: RwLock::new(None),
            closing: AtomicBool::new(false),
            shutdown_tx,
        })
    }
}

/// A TFTP server.
///
/// A read handler, a write handler, or both can be registered. Requests for
/// an operation without a registered handler are answered with an "illegal
/// operation" error.
pub struct Server {
    bind_addr: String,
    family: SocketFamily,
    retransmit: u32,
    single_port: bool,
    registry: Option<Arc<ConnectionRegistry>>,
    read_handler: Option<Arc<dyn ReadHandler>>,
    write_handler: Option<Arc<dyn WriteHandler>>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.bind_addr)
            .field("family", &self.family)
            .field("retransmit", &self.retransmit)
            .field("single_port", &self.single_port)
            .field("registry", &self.registry.is_some())
            .field("read_handler", &self.read_handler.is_some())
            .field("write_handler", &self.write_handler.is_some())
            .field("socket", &self.socket.read().is_some())
            .field("closing", &self.closing.load(Ordering::SeqCst))
            .finish()
    }
}

impl Server {
    /// Starts building a server listening on `bind_addr` ("host:port"; with
    /// an empty host the server listens on all interfaces).
    pub fn builder(bind_addr: impl Into<String>) -> ServerBuilder {
        ServerBuilder {
            bind_addr: bind_addr.into(),
            family: SocketFamily::default(),
            retransmit: DEFAULT_RETRANSMIT as i32,
            single_port: false,
        }
    }

    /// Registers the read handler. Must be called before serving starts.
    pub fn read_handler(&mut self, handler: Arc<dyn ReadHandler>) {
        self.read_handler = Some(handler);
    }

    /// Registers the write handler. Must be called before serving starts.
    pub fn write_handler(&mut self, handler: Arc<dyn WriteHandler>) {
        self.write_handler = Some(handler);
    }

    /// The bound local endpoint. Available once the server has started.
    pub fn local_addr(&self) -> Result<SocketAddr, TftpError> {
        let guard = self.socket.read();
        let socket = guard.as_ref().ok_or(TftpError::AddressNotAvailable)?;
        Ok(socket.local_addr()?)
    }

    /// The connection registry, present in single-port mode only.
    pub fn registry(&self) -> Option<&Arc<ConnectionRegistry>> {
        self.registry.as_ref()
    }

    /// Resolves the configured address, opens the socket, and serves until
    /// closed or a fatal socket error occurs.
    pub async fn listen_and_serve(&self) -> Result<(), TftpError> {
        let addr = self.resolve_bind_addr().await?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TftpError::SocketOpen(Arc::new(e)))?;
        self.serve(socket).await
    }

    /// Runs the receive loop on a pre-opened socket.
    pub async fn serve(&self, socket: UdpSocket) -> Result<(), TftpError> {
        if self.read_handler.is_none() && self.write_handler.is_none() {
            return Err(TftpError::NoRegisteredHandlers);
        }

        let socket = Arc::new(socket);
        *self.socket.write() = Some(socket.clone());

        // Handlers are frozen into the dispatcher here; every dispatch task
        // shares this one snapshot.
        let dispatcher = Arc::new(Dispatcher {
            socket: socket.clone(),
            retransmit: self.retransmit,
            single_port: self.single_port,
            registry: self.registry.clone(),
            read_handler: self.read_handler.clone(),
            write_handler: self.write_handler.clone(),
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Reused for every read; each dispatch task gets its own copy sized
        // to the actual datagram.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    debug!("server closing, receive loop stopping");
                    return Ok(());
                }

                res = socket.recv_from(&mut buf) => {
                    let (len, remote) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            if self.closing.load(Ordering::SeqCst) {
                                return Ok(());
                            }
                            return Err(TftpError::Io(Arc::new(e)));
                        }
                    };

                    let dg = Bytes::copy_from_slice(&buf[..len]);
                    let dispatcher = dispatcher.clone();
                    // The opcode lives in the second byte; runts fall through
                    // to demux and are rejected there.
                    match dg.get(1).copied().unwrap_or(0) {
                        1 => {
                            tokio::spawn(async move {
                                dispatcher.dispatch_read_request(remote, dg).await;
                            });
                        }
                        2 => {
                            tokio::spawn(async move {
                                dispatcher.dispatch_write_request(remote, dg).await;
                            });
                        }
                        _ => {
                            tokio::spawn(async move {
                                dispatcher.demux_to_conn(remote, dg).await;
                            });
                        }
                    }
                }
            }
        }
    }

    /// Marks the server as closing and stops the receive loop. In-flight
    /// handlers are not interrupted; they observe their own channel or
    /// socket closing.
    pub fn close(&self) -> Result<(), TftpError> {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    async fn resolve_bind_addr(&self) -> Result<SocketAddr, TftpError> {
        // Accept the ":69" shorthand for all interfaces.
        let target = if self.bind_addr.starts_with(':') {
            match self.family {
                SocketFamily::V4 => format!("0.0.0.0{}", self.bind_addr),
                _ => format!("[::]{}", self.bind_addr),
            }
        } else {
            self.bind_addr.clone()
        };

        let candidates = lookup_host(&target)
            .await
            .map_err(|e| TftpError::AddressResolution(Arc::new(e)))?;
        let selected = candidates
            .into_iter()
            .find(|addr| match self.family {
                SocketFamily::DualStack => true,
                SocketFamily::V4 => addr.is_ipv4(),
                SocketFamily::V6 => addr.is_ipv6(),
            })
            .ok_or_else(|| {
                TftpError::AddressResolution(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no resolved address matches the configured family",
                )))
            })?;
        Ok(selected)
    }
}
