//! foliod: document broker daemon.
//!
//! Listens for browser clients and rendering engines, serves `file://`
//! documents, and saves every open document on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use folio_broker::{BrokerConfig, DocumentServer, LocalStorage, ServerConfig};

/// Daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "foliod")]
#[command(about = "Collaborative document broker")]
struct Args {
    /// Address browser clients connect to
    #[arg(long, default_value = "127.0.0.1:9980", value_name = "ADDR")]
    client_addr: String,

    /// Address rendering engines connect to
    #[arg(long, default_value = "127.0.0.1:9981", value_name = "ADDR")]
    engine_addr: String,

    /// Directory for per-document work copies
    #[arg(long, value_name = "PATH")]
    work_dir: Option<PathBuf>,

    /// Seconds without edits before a modified document is saved
    #[arg(long, default_value_t = 30)]
    idle_save_secs: u64,

    /// Longest time a modified document stays unsaved, in seconds
    #[arg(long, default_value_t = 300)]
    max_save_interval_secs: u64,

    /// Tile cache ceiling per document, in KiB
    #[arg(long, default_value_t = 512)]
    tile_cache_kib: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let defaults = BrokerConfig::default();
        ServerConfig {
            client_bind_addr: self.client_addr.clone(),
            engine_bind_addr: self.engine_addr.clone(),
            broker: BrokerConfig {
                idle_save_threshold: Duration::from_secs(self.idle_save_secs),
                max_save_interval: Duration::from_secs(self.max_save_interval_secs),
                max_tile_cache_size: self.tile_cache_kib * 1024,
                work_root: self.work_dir.clone().unwrap_or(defaults.work_root.clone()),
                ..defaults
            },
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = args.server_config();
    info!(
        "Starting foliod (work dir {})",
        config.broker.work_root.display()
    );
    tokio::fs::create_dir_all(&config.broker.work_root).await?;

    let server = DocumentServer::new(config, Arc::new(LocalStorage::new()));
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            let saved = server.shutdown().await;
            info!("Shut down after saving {saved} documents");
        }
    }
    Ok(())
}
