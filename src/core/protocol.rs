// src/core/protocol.rs

//! TFTP datagram encoding and decoding (RFC 1350, with the option extension
//! of RFC 2347 and the `blksize`/`tsize`/`timeout` options of RFC 2348/2349).

use std::fmt;
use std::str::{self, FromStr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::TftpError;

/// Largest legal TFTP datagram; the server's receive buffer is sized to this.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Data block size when none is negotiated (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Valid range for a negotiated `blksize` (RFC 2348).
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;

pub const OPTION_BLKSIZE: &str = "blksize";
pub const OPTION_TIMEOUT: &str = "timeout";
pub const OPTION_TSIZE: &str = "tsize";

/// The six TFTP packet types, two bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rrq => "RRQ",
            Self::Wrq => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Oack => "OACK",
        };
        f.write_str(name)
    }
}

/// Error codes carried by ERROR datagrams (RFC 1350 §5, RFC 2347 for code 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// The transfer mode named in a request. The engine treats payload bytes as
/// opaque octets in every mode; the mode is recorded for handlers that care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    Netascii,
    #[default]
    Octet,
    Mail,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Netascii => "netascii",
            Self::Octet => "octet",
            Self::Mail => "mail",
        }
    }
}

impl FromStr for TransferMode {
    type Err = TftpError;

    // Mode matching is case-insensitive per RFC 1350.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("netascii") {
            Ok(Self::Netascii)
        } else if s.eq_ignore_ascii_case("octet") {
            Ok(Self::Octet)
        } else if s.eq_ignore_ascii_case("mail") {
            Ok(Self::Mail)
        } else {
            Err(TftpError::InvalidMode(s.to_string()))
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parsed TFTP datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Request {
        opcode: Opcode,
        filename: String,
        mode: TransferMode,
        options: Vec<(String, String)>,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: Vec<(String, String)>,
    },
}

impl Datagram {
    /// Parses and validates a raw datagram buffer.
    pub fn parse(buf: &[u8]) -> Result<Datagram, TftpError> {
        if buf.len() < 4 {
            return Err(TftpError::MalformedDatagram(format!(
                "{} bytes is shorter than the minimum datagram",
                buf.len()
            )));
        }
        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let Some(opcode) = Opcode::from_u16(raw) else {
            return Err(TftpError::UnknownOpcode(raw));
        };
        let body = &buf[2..];
        match opcode {
            Opcode::Rrq | Opcode::Wrq => Self::parse_request(opcode, body),
            Opcode::Data => Ok(Datagram::Data {
                block: u16::from_be_bytes([body[0], body[1]]),
                payload: Bytes::copy_from_slice(&body[2..]),
            }),
            Opcode::Ack => {
                if body.len() != 2 {
                    return Err(TftpError::MalformedDatagram(
                        "ACK must be exactly 4 bytes".to_string(),
                    ));
                }
                Ok(Datagram::Ack {
                    block: u16::from_be_bytes([body[0], body[1]]),
                })
            }
            Opcode::Error => {
                let code = u16::from_be_bytes([body[0], body[1]]);
                let message = cstr_field(&body[2..])?;
                Ok(Datagram::Error {
                    code,
                    message: message.to_string(),
                })
            }
            Opcode::Oack => Ok(Datagram::Oack {
                options: parse_option_pairs(split_fields(body)?)?,
            }),
        }
    }

    fn parse_request(opcode: Opcode, body: &[u8]) -> Result<Datagram, TftpError> {
        let fields = split_fields(body)?;
        if fields.len() < 2 {
            return Err(TftpError::MalformedDatagram(
                "request is missing filename or mode".to_string(),
            ));
        }
        let filename = fields[0];
        if filename.is_empty() {
            return Err(TftpError::MalformedDatagram("empty filename".to_string()));
        }
        let mode = fields[1].parse::<TransferMode>()?;
        let options = parse_option_pairs(fields[2..].to_vec())?;
        Ok(Datagram::Request {
            opcode,
            filename: filename.to_string(),
            mode,
            options,
        })
    }

    pub fn ack(block: u16) -> Datagram {
        Datagram::Ack { block }
    }

    pub fn data(block: u16, payload: Bytes) -> Datagram {
        Datagram::Data { block, payload }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Datagram {
        Datagram::Error {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    pub fn oack(options: Vec<(String, String)>) -> Datagram {
        Datagram::Oack { options }
    }

    /// Encodes the datagram into a wire buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DEFAULT_BLOCK_SIZE + 4);
        match self {
            Datagram::Request {
                opcode,
                filename,
                mode,
                options,
            } => {
                buf.put_u16(*opcode as u16);
                put_cstr(&mut buf, filename);
                put_cstr(&mut buf, mode.as_str());
                for (name, value) in options {
                    put_cstr(&mut buf, name);
                    put_cstr(&mut buf, value);
                }
            }
            Datagram::Data { block, payload } => {
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.extend_from_slice(payload);
            }
            Datagram::Ack { block } => {
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block);
            }
            Datagram::Error { code, message } => {
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(*code);
                put_cstr(&mut buf, message);
            }
            Datagram::Oack { options } => {
                buf.put_u16(Opcode::Oack as u16);
                for (name, value) in options {
                    put_cstr(&mut buf, name);
                    put_cstr(&mut buf, value);
                }
            }
        }
        buf.freeze()
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datagram::Request {
                opcode,
                filename,
                mode,
                options,
            } => {
                write!(f, "{opcode} {filename:?} {mode}")?;
                for (name, value) in options {
                    write!(f, " {name}={value}")?;
                }
                Ok(())
            }
            Datagram::Data { block, payload } => {
                write!(f, "DATA block={block} len={}", payload.len())
            }
            Datagram::Ack { block } => write!(f, "ACK block={block}"),
            Datagram::Error { code, message } => write!(f, "ERROR code={code} {message:?}"),
            Datagram::Oack { options } => {
                write!(f, "OACK")?;
                for (name, value) in options {
                    write!(f, " {name}={value}")?;
                }
                Ok(())
            }
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Splits a sequence of NUL-terminated strings, requiring the trailing NUL.
fn split_fields(body: &[u8]) -> Result<Vec<&str>, TftpError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if body.last() != Some(&0) {
        return Err(TftpError::MalformedDatagram(
            "missing trailing NUL terminator".to_string(),
        ));
    }
    body[..body.len() - 1]
        .split(|b| *b == 0)
        .map(|field| {
            str::from_utf8(field)
                .map_err(|_| TftpError::MalformedDatagram("field is not valid UTF-8".to_string()))
        })
        .collect()
}

fn parse_option_pairs(fields: Vec<&str>) -> Result<Vec<(String, String)>, TftpError> {
    if fields.len() % 2 != 0 {
        return Err(TftpError::MalformedDatagram(
            "option name without a value".to_string(),
        ));
    }
    Ok(fields
        .chunks_exact(2)
        .map(|pair| (pair[0].to_ascii_lowercase(), pair[1].to_string()))
        .collect())
}

/// Reads a single NUL-terminated string, ignoring anything after the NUL.
fn cstr_field(body: &[u8]) -> Result<&str, TftpError> {
    let end = body.iter().position(|b| *b == 0).ok_or_else(|| {
        TftpError::MalformedDatagram("missing trailing NUL terminator".to_string())
    })?;
    str::from_utf8(&body[..end])
        .map_err(|_| TftpError::MalformedDatagram("field is not valid UTF-8".to_string()))
}
