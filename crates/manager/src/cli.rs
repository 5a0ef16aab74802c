use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "ctsieve-manager", version, about = "CT ingestion manager")]
pub struct Cli {
    /// Address the HTTP API listens on.
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// SQLite database path.
    #[arg(long, env = "DB_PATH", default_value = "ctsieve.db")]
    pub db: PathBuf,

    /// JSON catalog of CT logs to load at startup.
    #[arg(long, env = "CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Duplicate-suppression cache capacity.
    #[arg(long, env = "CACHE_MAX_SIZE", default_value_t = 50_000)]
    pub cache_max_size: usize,

    /// Width of the job ranges each log is partitioned into.
    #[arg(long, env = "CHUNK_WIDTH", default_value_t = 16_384)]
    pub chunk_width: u64,

    /// Seconds without a heartbeat before an assignment counts as stalled.
    #[arg(long, env = "STALE_SECS", default_value_t = 300)]
    pub stale_secs: i64,

    /// Seconds without a heartbeat before an assignment is abandoned
    /// and its range returns to the pending pool.
    #[arg(long, env = "ABANDON_SECS", default_value_t = 900)]
    pub abandon_secs: i64,

    /// How often the background reaper sweeps assignments.
    #[arg(long, env = "REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,

    /// Verbose logging (RUST_LOG still takes precedence).
    #[arg(long, env = "DEBUG", default_value_t = false)]
    pub debug: bool,
}
