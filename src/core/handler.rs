// src/core/handler.rs

//! Pluggable request handling: the read/write capability traits and the
//! per-dispatch request views handed to them.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::TransferConn;
use crate::core::TftpError;
use crate::core::protocol::{ErrorCode, TransferMode};

/// Serves inbound read requests by streaming file content to the client.
/// Any type with the single method qualifies; no further contract is implied.
#[async_trait]
pub trait ReadHandler: Send + Sync + 'static {
    async fn serve(&self, req: &mut ReadRequest);
}

/// Receives inbound write requests, consuming the client's upload.
#[async_trait]
pub trait WriteHandler: Send + Sync + 'static {
    async fn receive(&self, req: &mut WriteRequest);
}

/// A read request, alive for the duration of one handler invocation.
pub struct ReadRequest {
    conn: TransferConn,
    name: String,
}

impl ReadRequest {
    pub(crate) fn new(conn: TransferConn) -> Self {
        let name = conn.filename().to_string();
        Self { conn, name }
    }

    /// The requested filename, exactly as the client sent it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client's endpoint (its transfer ID).
    pub fn addr(&self) -> SocketAddr {
        self.conn.remote()
    }

    pub fn mode(&self) -> TransferMode {
        self.conn.mode()
    }

    /// Streams the full content to the client in lock-step blocks.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TftpError> {
        self.conn.send_all(data).await
    }

    /// Reports a transfer-level failure (e.g. file not found) to the client.
    pub async fn send_error(&mut self, code: ErrorCode, message: &str) {
        self.conn.send_error(code, message).await;
    }
}

/// A write request, alive for the duration of one handler invocation.
pub struct WriteRequest {
    conn: TransferConn,
    name: String,
}

impl WriteRequest {
    pub(crate) fn new(conn: TransferConn) -> Self {
        let name = conn.filename().to_string();
        Self { conn, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.conn.remote()
    }

    pub fn mode(&self) -> TransferMode {
        self.conn.mode()
    }

    /// The transfer size the client announced via the `tsize` option.
    ///
    /// Fails with the request's setup error if option parsing failed, or
    /// with `SizeNotNegotiated` if the client sent no size. The handler
    /// decides whether either case is fatal to the transfer.
    pub fn size(&self) -> Result<u64, TftpError> {
        self.conn.size()
    }

    /// The option-setup error attached by the dispatch layer, if any.
    pub fn setup_error(&self) -> Option<&TftpError> {
        self.conn.setup_error()
    }

    /// Acknowledges the request and consumes the full upload.
    pub async fn recv_all(&mut self) -> Result<Bytes, TftpError> {
        self.conn.recv_all().await
    }

    /// Reports a transfer-level failure (e.g. disk full) to the client.
    pub async fn send_error(&mut self, code: ErrorCode, message: &str) {
        self.conn.send_error(code, message).await;
    }
}
