// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// `std::io::Error` values are wrapped in an `Arc` so the enum stays cheaply
/// cloneable; a per-transfer error may need to be both logged and attached to
/// a request for the handler to inspect.
#[derive(Error, Debug, Clone)]
pub enum TftpError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("invalid network family, must be one of \"udp\", \"udp4\", \"udp6\"")]
    InvalidNetwork,

    #[error("retransmission limit must not be negative")]
    InvalidRetransmit,

    #[error("resolving server address: {0}")]
    AddressResolution(Arc<std::io::Error>),

    #[error("opening network connection: {0}")]
    SocketOpen(Arc<std::io::Error>),

    #[error("no read or write handlers registered")]
    NoRegisteredHandlers,

    #[error("server address is not available before the socket is opened")]
    AddressNotAvailable,

    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("invalid transfer mode {0:?}")]
    InvalidMode(String),

    #[error("invalid value {value:?} for option {option:?}")]
    InvalidOption { option: String, value: String },

    #[error("transfer size was not negotiated")]
    SizeNotNegotiated,

    #[error("retransmission limit exceeded")]
    RetransmitExceeded,

    #[error("remote error {code}: {message}")]
    RemoteError { code: u16, message: String },

    #[error("transfer channel closed")]
    ChannelClosed,
}

impl From<std::io::Error> for TftpError {
    fn from(e: std::io::Error) -> Self {
        TftpError::Io(Arc::new(e))
    }
}
