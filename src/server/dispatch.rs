// src/server/dispatch.rs

//! Opcode dispatch: routes each classified datagram to a fresh transfer or
//! to the established one it belongs to. One task per datagram; failures
//! stay contained to their task.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, error};

use super::registry::ConnectionRegistry;
use crate::connection::{TransferConn, TransferGuard};
use crate::core::TftpError;
use crate::core::handler::{ReadHandler, ReadRequest, WriteHandler, WriteRequest};
use crate::core::protocol::{Datagram, ErrorCode};

/// Immutable snapshot of everything a dispatch task needs, shared by all
/// tasks spawned from one receive loop.
pub(crate) struct Dispatcher {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) retransmit: u32,
    pub(crate) single_port: bool,
    pub(crate) registry: Option<Arc<ConnectionRegistry>>,
    pub(crate) read_handler: Option<Arc<dyn ReadHandler>>,
    pub(crate) write_handler: Option<Arc<dyn WriteHandler>>,
}

impl Dispatcher {
    /// Handles one read request. Without a registered read handler the
    /// request is rejected with "illegal operation" and nothing is allocated.
    pub(crate) async fn dispatch_read_request(&self, remote: SocketAddr, buf: Bytes) {
        let Some(handler) = self.read_handler.clone() else {
            debug!("no read handler registered, rejecting request from {remote}");
            self.send_error(remote, ErrorCode::IllegalOperation, "Server does not support read requests.")
                .await;
            return;
        };

        let Ok((mut conn, _guard)) = self.new_conn(remote, &buf).await else {
            return;
        };
        debug!(
            "new read request from {remote}: {:?} ({})",
            conn.filename(),
            conn.mode()
        );

        // Read-side options are best effort; a request with unusable values
        // proceeds as a plain RFC 1350 transfer.
        if let Err(e) = conn.parse_options() {
            debug!("ignoring unusable options from {remote}: {e}");
            conn.clear_negotiation();
        }

        let mut req = ReadRequest::new(conn);
        handler.serve(&mut req).await;
        // _guard drops here: the registry entry (if any) is released and the
        // connection's channel closes with it.
    }

    /// Handles one write request, mirroring the read path with one addition:
    /// option setup runs before the handler, and a setup failure is attached
    /// to the request for the handler to observe rather than dropped here.
    pub(crate) async fn dispatch_write_request(&self, remote: SocketAddr, buf: Bytes) {
        let Some(handler) = self.write_handler.clone() else {
            debug!("no write handler registered, rejecting request from {remote}");
            self.send_error(remote, ErrorCode::IllegalOperation, "Server does not support write requests.")
                .await;
            return;
        };

        let Ok((mut conn, _guard)) = self.new_conn(remote, &buf).await else {
            return;
        };
        debug!(
            "new write request from {remote}: {:?} ({})",
            conn.filename(),
            conn.mode()
        );

        if let Err(e) = conn.parse_options() {
            debug!("write setup failed for {remote}: {e}");
            conn.clear_negotiation();
            conn.set_setup_error(e);
        }

        let mut req = WriteRequest::new(conn);
        handler.receive(&mut req).await;
    }

    /// Routes a non-request datagram to the transfer it belongs to, or
    /// rejects it as coming from an unknown transfer ID.
    pub(crate) async fn demux_to_conn(&self, remote: SocketAddr, buf: Bytes) {
        if self.single_port
            && let Some(registry) = &self.registry
            && let Some(tx) = registry.get(&remote)
        {
            // Established transfer on the shared socket: deliver in arrival
            // order. A full channel applies backpressure to this transfer
            // alone.
            if tx.send(buf).await.is_err() {
                debug!("transfer channel for {remote} closed before delivery");
            }
            return;
        }

        // RFC 1350: a packet whose source TID matches no transfer is answered
        // with an error, while not disturbing any in-flight transfer.
        self.send_error(remote, ErrorCode::UnknownTransferId, "Unexpected TID")
            .await;
        debug!("unexpected datagram from {remote}");
    }

    /// Validates the initial request and constructs the transfer connection:
    /// a registry-backed virtual channel in single-port mode, a dedicated
    /// ephemeral socket otherwise. The returned guard releases the registry
    /// entry on every exit path.
    async fn new_conn(
        &self,
        remote: SocketAddr,
        buf: &[u8],
    ) -> Result<(TransferConn, TransferGuard), TftpError> {
        let (filename, mode, options) = match Datagram::parse(buf) {
            Ok(Datagram::Request {
                filename,
                mode,
                options,
                ..
            }) => (filename, mode, options),
            Ok(other) => {
                debug!("datagram from {remote} is not a request: {other}");
                return Err(TftpError::MalformedDatagram(
                    "expected a read or write request".to_string(),
                ));
            }
            Err(e) => {
                debug!("error decoding new request from {remote}: {e}");
                return Err(e);
            }
        };

        if self.single_port
            && let Some(registry) = &self.registry
        {
            // Sole registration point: the entry must exist before any
            // demultiplexed traffic for this transfer can arrive.
            let rx = registry.insert(&remote);
            let conn = TransferConn::shared(
                self.socket.clone(),
                rx,
                remote,
                filename,
                mode,
                options,
                self.retransmit,
            );
            let guard = TransferGuard::new(Some(registry.clone()), remote);
            Ok((conn, guard))
        } else {
            let conn = TransferConn::dedicated(remote, filename, mode, options, self.retransmit)
                .await
                .inspect_err(|e| {
                    error!("opening connection for new request from {remote}: {e}");
                })?;
            Ok((conn, TransferGuard::new(None, remote)))
        }
    }

    /// Best-effort error reply over the shared socket; failures are logged,
    /// never escalated.
    async fn send_error(&self, remote: SocketAddr, code: ErrorCode, message: &str) {
        let dg = Datagram::error(code, message);
        if let Err(e) = self.socket.send_to(&dg.to_bytes(), remote).await {
            debug!("failed to send error datagram to {remote}: {e}");
        }
    }
}
