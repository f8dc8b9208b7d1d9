//! Chalk sync server
//!
//! Runs the collaborative whiteboard sync server over WebSocket.
//! Logging honours `RUST_LOG` (default `info`).

use chalk_sync::{CoordinatorConfig, ServerConfig, SyncServer};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Real-time sync server for collaborative whiteboards.
#[derive(Parser, Debug)]
#[command(name = "chalk-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CHALK_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; omit to keep whiteboards in memory
    #[arg(long, env = "CHALK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Skip fsync on every log append
    #[arg(long, env = "CHALK_NO_SYNC")]
    no_sync: bool,

    /// RocksDB block cache size in MiB
    #[arg(long, env = "CHALK_CACHE_MB", default_value_t = 64)]
    cache_mb: usize,

    /// Seconds without a heartbeat before a session is dropped
    #[arg(long, env = "CHALK_HEARTBEAT_TIMEOUT", default_value_t = 30)]
    heartbeat_timeout: u64,

    /// Take a snapshot after this many strokes
    #[arg(long, env = "CHALK_SNAPSHOT_EVERY", default_value_t = 100)]
    snapshot_every: u64,

    /// Take a snapshot at least this often (seconds) while strokes arrive
    #[arg(long, env = "CHALK_SNAPSHOT_INTERVAL", default_value_t = 60)]
    snapshot_interval: u64,

    /// Frames buffered per client before backpressure applies
    #[arg(long, env = "CHALK_OUTBOUND_BUFFER", default_value_t = 256)]
    outbound_buffer: usize,

    /// Persistence retries before a session is closed
    #[arg(long, env = "CHALK_APPEND_RETRIES", default_value_t = 3)]
    append_retries: u32,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: self.data_dir.clone(),
            block_cache_size: self.cache_mb * 1024 * 1024,
            sync_writes: !self.no_sync,
            coordinator: CoordinatorConfig {
                heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
                snapshot_every: self.snapshot_every,
                snapshot_interval: Duration::from_secs(self.snapshot_interval),
                outbound_buffer: self.outbound_buffer,
                append_retries: self.append_retries,
                ..CoordinatorConfig::default()
            },
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::debug!("{cli:?}");

    let server = match SyncServer::open(cli.server_config()) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to open storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            Ok(())
        }
    };
    server.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
