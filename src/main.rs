// src/main.rs

//! The garnet-tftp daemon: a filesystem-backed TFTP server built on the
//! library's dispatch layer.

use std::env;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use garnet_tftp::config::Config;
use garnet_tftp::core::handler::{ReadHandler, ReadRequest, WriteHandler, WriteRequest};
use garnet_tftp::core::protocol::ErrorCode;
use garnet_tftp::server::Server;

/// Serves and stores files under a single root directory.
struct FsHandler {
    root: PathBuf,
}

impl FsHandler {
    /// Resolves `name` under the root, refusing anything that would escape it.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let rel = Path::new(name);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return None;
        }
        Some(self.root.join(rel))
    }
}

#[async_trait]
impl ReadHandler for FsHandler {
    async fn serve(&self, req: &mut ReadRequest) {
        let Some(path) = self.resolve(req.name()) else {
            warn!("read request for {:?} escapes the served root", req.name());
            req.send_error(ErrorCode::AccessViolation, "Filename outside served root")
                .await;
            return;
        };
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to open {path:?}: {e}");
                req.send_error(ErrorCode::FileNotFound, "File not found")
                    .await;
                return;
            }
        };
        if let Err(e) = req.send(&data).await {
            warn!("read transfer to {} failed: {e}", req.addr());
        }
    }
}

#[async_trait]
impl WriteHandler for FsHandler {
    async fn receive(&self, req: &mut WriteRequest) {
        let Some(path) = self.resolve(req.name()) else {
            warn!("write request for {:?} escapes the served root", req.name());
            req.send_error(ErrorCode::AccessViolation, "Filename outside served root")
                .await;
            return;
        };
        let data = match req.recv_all().await {
            Ok(data) => data,
            Err(e) => {
                warn!("write transfer from {} failed: {e}", req.addr());
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, &data).await {
            warn!("failed to store {path:?}: {e}");
            req.send_error(ErrorCode::DiskFull, "Failed to store file")
                .await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    // The configuration path can be provided via a --config flag; otherwise
    // defaults apply when no file is present.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("garnet-tftp.toml");

    let config = if Path::new(config_path).exists() {
        match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from {config_path:?}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    let handler = Arc::new(FsHandler {
        root: config.root_dir.clone(),
    });

    let mut server = Server::builder(config.bind.clone())
        .family(config.socket_family()?)
        .retransmit(config.retransmit)
        .single_port(config.single_port)
        .build()?;
    server.read_handler(handler.clone());
    server.write_handler(handler);

    info!(
        "garnet-tftp listening on {}, serving {}",
        config.bind,
        config.root_dir.display()
    );
    if let Err(e) = server.listen_and_serve().await {
        error!("server terminated: {e}");
        return Err(e.into());
    }
    Ok(())
}
