// src/connection/mod.rs

//! Per-transfer network channel and the lock-step transfer engine driven by
//! request handlers.
//!
//! A `TransferConn` is produced by the dispatch layer in one of two shapes: a
//! dedicated ephemeral socket owned by this transfer alone, or a virtual
//! channel multiplexed over the server's shared socket and fed by the
//! connection registry.

mod guard;

pub(crate) use guard::TransferGuard;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;

use crate::core::TftpError;
use crate::core::protocol::{
    DEFAULT_BLOCK_SIZE, Datagram, ErrorCode, MAX_BLOCK_SIZE, MAX_DATAGRAM_SIZE, MIN_BLOCK_SIZE,
    OPTION_BLKSIZE, OPTION_TIMEOUT, OPTION_TSIZE, TransferMode,
};

/// Per-packet receive timeout before a retransmission, unless the client
/// negotiates its own with the `timeout` option.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The network channel backing one transfer.
enum TransferChannel {
    /// Ephemeral socket for this transfer's exclusive use.
    Dedicated { socket: UdpSocket, buf: Box<[u8]> },
    /// Virtual channel over the shared server socket; inbound datagrams
    /// arrive via the registry-owned channel.
    Shared {
        socket: Arc<UdpSocket>,
        rx: mpsc::Receiver<Bytes>,
    },
}

/// One transfer's connection state: remote endpoint, negotiated parameters,
/// and the underlying channel. Owned by the dispatch flow that created it
/// until handed to a handler; teardown is guaranteed by the dispatch scope.
pub struct TransferConn {
    remote: SocketAddr,
    filename: String,
    mode: TransferMode,
    options: Vec<(String, String)>,
    negotiated: Vec<(String, String)>,
    block_size: usize,
    timeout: Duration,
    retransmit: u32,
    tsize: Option<u64>,
    setup_error: Option<TftpError>,
    channel: TransferChannel,
}

impl TransferConn {
    /// Opens a dedicated ephemeral socket for this transfer.
    pub(crate) async fn dedicated(
        remote: SocketAddr,
        filename: String,
        mode: TransferMode,
        options: Vec<(String, String)>,
        retransmit: u32,
    ) -> Result<Self, TftpError> {
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TftpError::SocketOpen(Arc::new(e)))?;
        let channel = TransferChannel::Dedicated {
            socket,
            buf: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        };
        Ok(Self::new(channel, remote, filename, mode, options, retransmit))
    }

    /// Builds a virtual connection over the shared socket, fed by `rx`.
    pub(crate) fn shared(
        socket: Arc<UdpSocket>,
        rx: mpsc::Receiver<Bytes>,
        remote: SocketAddr,
        filename: String,
        mode: TransferMode,
        options: Vec<(String, String)>,
        retransmit: u32,
    ) -> Self {
        Self::new(
            TransferChannel::Shared { socket, rx },
            remote,
            filename,
            mode,
            options,
            retransmit,
        )
    }

    fn new(
        channel: TransferChannel,
        remote: SocketAddr,
        filename: String,
        mode: TransferMode,
        options: Vec<(String, String)>,
        retransmit: u32,
    ) -> Self {
        Self {
            remote,
            filename,
            mode,
            options,
            negotiated: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            retransmit,
            tsize: None,
            setup_error: None,
            channel,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub(crate) fn set_setup_error(&mut self, err: TftpError) {
        self.setup_error = Some(err);
    }

    pub(crate) fn setup_error(&self) -> Option<&TftpError> {
        self.setup_error.as_ref()
    }

    /// Negotiated transfer size, or the setup error that prevented it.
    pub(crate) fn size(&self) -> Result<u64, TftpError> {
        if let Some(err) = &self.setup_error {
            return Err(err.clone());
        }
        self.tsize.ok_or(TftpError::SizeNotNegotiated)
    }

    /// Applies the recognized request options (`tsize`, `blksize`, `timeout`)
    /// to this connection. Unknown options are left unacknowledged.
    pub(crate) fn parse_options(&mut self) -> Result<(), TftpError> {
        let options = self.options.clone();
        for (name, value) in &options {
            match name.as_str() {
                OPTION_TSIZE => {
                    let size: u64 = value.parse().map_err(|_| TftpError::InvalidOption {
                        option: name.clone(),
                        value: value.clone(),
                    })?;
                    self.tsize = Some(size);
                    self.negotiated.push((name.clone(), value.clone()));
                }
                OPTION_BLKSIZE => {
                    let requested: usize = value.parse().map_err(|_| TftpError::InvalidOption {
                        option: name.clone(),
                        value: value.clone(),
                    })?;
                    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&requested) {
                        return Err(TftpError::InvalidOption {
                            option: name.clone(),
                            value: value.clone(),
                        });
                    }
                    self.block_size = requested;
                    self.negotiated.push((name.clone(), value.clone()));
                }
                OPTION_TIMEOUT => {
                    let secs: u64 = value
                        .parse()
                        .ok()
                        .filter(|s| (1..=255).contains(s))
                        .ok_or_else(|| TftpError::InvalidOption {
                            option: name.clone(),
                            value: value.clone(),
                        })?;
                    self.timeout = Duration::from_secs(secs);
                    self.negotiated.push((name.clone(), value.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reverts to RFC 1350 defaults, forgetting any acknowledged options.
    pub(crate) fn clear_negotiation(&mut self) {
        self.negotiated.clear();
        self.block_size = DEFAULT_BLOCK_SIZE;
        self.timeout = DEFAULT_TIMEOUT;
        self.tsize = None;
    }

    /// Streams `data` to the client in lock-step blocks, negotiating options
    /// first when any were acknowledged. A `tsize` probe is answered with the
    /// actual content length.
    pub(crate) async fn send_all(&mut self, data: &[u8]) -> Result<(), TftpError> {
        let oack = self.oack_options(Some(data.len() as u64));
        if !oack.is_empty() {
            self.send_expect_ack(Datagram::oack(oack), 0).await?;
        }
        let mut block: u16 = 1;
        let mut offset = 0usize;
        loop {
            let end = (offset + self.block_size).min(data.len());
            let payload = Bytes::copy_from_slice(&data[offset..end]);
            let len = payload.len();
            self.send_expect_ack(Datagram::data(block, payload), block)
                .await?;
            offset = end;
            block = block.wrapping_add(1);
            // A short (possibly empty) final block terminates the transfer.
            if len < self.block_size {
                return Ok(());
            }
        }
    }

    /// Acknowledges the write request and collects the full upload, ACKing
    /// each block in order and re-ACKing duplicates.
    pub(crate) async fn recv_all(&mut self) -> Result<Bytes, TftpError> {
        let opening = if self.negotiated.is_empty() {
            Datagram::ack(0)
        } else {
            Datagram::oack(self.oack_options(None))
        };
        self.send_datagram(&opening).await?;

        let mut out = BytesMut::new();
        let mut expected: u16 = 1;
        let mut attempts = 0u32;
        loop {
            match time::timeout(self.timeout, self.recv_datagram()).await {
                Ok(Ok(Datagram::Data { block, payload })) if block == expected => {
                    out.extend_from_slice(&payload);
                    self.send_datagram(&Datagram::ack(block)).await?;
                    if payload.len() < self.block_size {
                        return Ok(out.freeze());
                    }
                    expected = expected.wrapping_add(1);
                    attempts = 0;
                }
                Ok(Ok(Datagram::Data { block, .. })) if block.wrapping_add(1) == expected => {
                    // The client missed our ACK; repeat it.
                    self.send_datagram(&Datagram::ack(block)).await?;
                }
                Ok(Ok(Datagram::Error { code, message })) => {
                    return Err(TftpError::RemoteError { code, message });
                }
                Ok(Ok(other)) => {
                    debug!(
                        "ignoring out-of-sequence datagram from {}: {other}",
                        self.remote
                    );
                }
                Ok(Err(e @ (TftpError::Io(_) | TftpError::ChannelClosed))) => return Err(e),
                Ok(Err(e)) => {
                    debug!("discarding undecodable datagram from {}: {e}", self.remote);
                }
                Err(_) => {
                    attempts += 1;
                    if attempts > self.retransmit {
                        return Err(TftpError::RetransmitExceeded);
                    }
                    // Repeat the last reply so the client retries its send.
                    let resend = if expected == 1 {
                        opening.clone()
                    } else {
                        Datagram::ack(expected.wrapping_sub(1))
                    };
                    self.send_datagram(&resend).await?;
                }
            }
        }
    }

    /// Best-effort error report to the client; send failures are logged only.
    pub(crate) async fn send_error(&self, code: ErrorCode, message: &str) {
        let dg = Datagram::error(code, message);
        if let Err(e) = self.send_datagram(&dg).await {
            debug!("failed to send error datagram to {}: {e}", self.remote);
        }
    }

    /// Sends `dg` and waits for the matching ACK, retransmitting on timeout
    /// up to the configured limit.
    async fn send_expect_ack(&mut self, dg: Datagram, want_block: u16) -> Result<(), TftpError> {
        let mut attempts = 0u32;
        loop {
            self.send_datagram(&dg).await?;
            match time::timeout(self.timeout, self.recv_ack(want_block)).await {
                Ok(result) => return result,
                Err(_) => {
                    attempts += 1;
                    if attempts > self.retransmit {
                        return Err(TftpError::RetransmitExceeded);
                    }
                    debug!(
                        "timeout waiting for ACK {want_block} from {}, retransmitting ({attempts}/{})",
                        self.remote, self.retransmit
                    );
                }
            }
        }
    }

    /// Consumes inbound datagrams until the matching ACK or a fatal error.
    async fn recv_ack(&mut self, want_block: u16) -> Result<(), TftpError> {
        loop {
            match self.recv_datagram().await {
                Ok(Datagram::Ack { block }) if block == want_block => return Ok(()),
                Ok(Datagram::Error { code, message }) => {
                    return Err(TftpError::RemoteError { code, message });
                }
                Ok(other) => {
                    debug!(
                        "ignoring out-of-sequence datagram from {}: {other}",
                        self.remote
                    );
                }
                Err(e @ (TftpError::Io(_) | TftpError::ChannelClosed)) => return Err(e),
                Err(e) => {
                    debug!("discarding undecodable datagram from {}: {e}", self.remote);
                }
            }
        }
    }

    async fn send_datagram(&self, dg: &Datagram) -> Result<(), TftpError> {
        let buf = dg.to_bytes();
        let socket = match &self.channel {
            TransferChannel::Dedicated { socket, .. } => socket,
            TransferChannel::Shared { socket, .. } => socket.as_ref(),
        };
        socket.send_to(&buf, self.remote).await?;
        Ok(())
    }

    async fn recv_datagram(&mut self) -> Result<Datagram, TftpError> {
        let remote = self.remote;
        match &mut self.channel {
            TransferChannel::Dedicated { socket, buf } => loop {
                let (len, from) = socket.recv_from(buf).await?;
                if from != remote {
                    // RFC 1350: answer a mismatched source TID with an error
                    // without disturbing this transfer.
                    let reply = Datagram::error(ErrorCode::UnknownTransferId, "Unexpected TID");
                    let _ = socket.send_to(&reply.to_bytes(), from).await;
                    debug!("dropping datagram from unexpected source {from}");
                    continue;
                }
                return Datagram::parse(&buf[..len]);
            },
            TransferChannel::Shared { rx, .. } => {
                let raw = rx.recv().await.ok_or(TftpError::ChannelClosed)?;
                Datagram::parse(&raw)
            }
        }
    }

    /// The options to acknowledge, with a `tsize` probe rewritten to the
    /// actual transfer size when one is known.
    fn oack_options(&self, tsize_reply: Option<u64>) -> Vec<(String, String)> {
        self.negotiated
            .iter()
            .map(|(name, value)| {
                if name == OPTION_TSIZE
                    && let Some(size) = tsize_reply
                {
                    (name.clone(), size.to_string())
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect()
    }
}
