use std::path::PathBuf;

use clap::Parser;
use reqwest::Url;

fn default_manager_url() -> Url {
    Url::parse("http://127.0.0.1:8080").expect("default manager url must be valid")
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ctsieve-worker", version, about = "CT ingestion worker")]
pub struct Cli {
    /// Base URL of the manager API.
    #[arg(long, env = "MANAGER_URL", default_value_t = default_manager_url())]
    pub manager_url: Url,

    /// Public worker identity; auto-generated when unset.
    #[arg(long, env = "WORKER_NAME")]
    pub worker_name: Option<String>,

    /// Comma-separated outbound proxies for CT fetches, rotated per
    /// request.
    #[arg(long, env = "PROXIES", value_delimiter = ',', num_args = 0..)]
    pub proxies: Vec<String>,

    /// Verbose logging (RUST_LOG still takes precedence).
    #[arg(long, env = "DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Domain suffix to keep (with or without the leading dot).
    #[arg(long, env = "SUFFIX", default_value = ".jp")]
    pub suffix: String,

    /// Upload batch size; the manager rejects anything over 32.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 32)]
    pub batch_size: usize,

    /// Log categories to run, one fetch task each.
    #[arg(
        long,
        env = "CATEGORIES",
        value_delimiter = ',',
        default_values_t = [
            "google".to_string(),
            "cloudflare".to_string(),
            "digicert".to_string(),
            "letsencrypt".to_string(),
            "sectigo".to_string(),
        ]
    )]
    pub categories: Vec<String>,

    /// `get-entries` window size hint; logs may return fewer entries.
    #[arg(long, env = "FETCH_BATCH", default_value_t = 256)]
    pub fetch_batch: u64,

    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Flush a partial upload buffer after this long.
    #[arg(long, env = "FLUSH_SECS", default_value_t = 60)]
    pub flush_secs: u64,

    /// Directory failed uploads are spooled into.
    #[arg(long, env = "SPOOL_DIR", default_value = "pending/upload_failure")]
    pub spool_dir: PathBuf,

    /// Seconds between spool re-upload passes.
    #[arg(long, env = "SPOOL_INTERVAL_SECS", default_value_t = 300)]
    pub spool_interval_secs: u64,

    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[arg(long, env = "UPLOAD_TIMEOUT_SECS", default_value_t = 15)]
    pub upload_timeout_secs: u64,

    #[arg(long, env = "CONTROL_TIMEOUT_SECS", default_value_t = 10)]
    pub control_timeout_secs: u64,

    /// Transient-fetch retries before a range is reported failed.
    #[arg(long, env = "FETCH_RETRY_CAP", default_value_t = 8)]
    pub fetch_retry_cap: u32,

    /// Startup attempts to reach the manager before exiting with
    /// code 2.
    #[arg(long, env = "STARTUP_RETRIES", default_value_t = 5)]
    pub startup_retries: u32,
}
