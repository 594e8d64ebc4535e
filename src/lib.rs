// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod server;

// Re-export
pub use crate::core::TftpError;
pub use crate::core::handler::{ReadHandler, ReadRequest, WriteHandler, WriteRequest};
pub use crate::server::{Server, ServerBuilder, SocketFamily};
