// src/config.rs

//! Daemon configuration: loading, defaults, and validation.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::TftpError;
use crate::server::SocketFamily;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// "host:port" to listen on; an empty host means all interfaces.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// One of "udp", "udp4", "udp6".
    #[serde(default = "default_family")]
    pub family: String,
    /// Per-packet retransmission limit.
    #[serde(default = "default_retransmit")]
    pub retransmit: i32,
    /// Service all transfers over the listening port rather than a fresh
    /// ephemeral port per transfer.
    #[serde(default)]
    pub single_port: bool,
    /// Directory served for reads and written to for writes.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind() -> String {
    "0.0.0.0:69".to_string()
}
fn default_family() -> String {
    "udp".to_string()
}
fn default_retransmit() -> i32 {
    10
}
fn default_root_dir() -> PathBuf {
    PathBuf::from("./tftp_root")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            family: default_family(),
            retransmit: default_retransmit(),
            single_port: false,
            root_dir: default_root_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TftpError> {
        self.socket_family()?;
        if self.retransmit < 0 {
            return Err(TftpError::InvalidRetransmit);
        }
        Ok(())
    }

    /// Maps the configured family string onto the server's address family.
    pub fn socket_family(&self) -> Result<SocketFamily, TftpError> {
        match self.family.as_str() {
            "udp" => Ok(SocketFamily::DualStack),
            "udp4" => Ok(SocketFamily::V4),
            "udp6" => Ok(SocketFamily::V6),
            _ => Err(TftpError::InvalidNetwork),
        }
    }
}
