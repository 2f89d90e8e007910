// Command line / environment configuration for colorize-gateway.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments for colorize-gateway
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    /// Hostname/IP to bind the server to.
    /// If this option is specified without value, it will default to "*", meaning the server will listen on all interfaces.
    #[arg(long, env = "COLORIZE_GATEWAY_HOST", default_value = "localhost", num_args = 0..=1, default_missing_value = "*")]
    pub host: String,

    /// Port number to listen on.
    #[arg(short, long, env = "COLORIZE_GATEWAY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Root directory for temporary uploads and colorized results.
    #[arg(long, env = "COLORIZE_GATEWAY_DATA_DIR", default_value = "./app_data")]
    pub data_dir: PathBuf,

    /// Redis URL for the shared rate-limit counters.
    /// Without it, counters live in process memory and are not shared between instances.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Endpoint of the remote colorization backend (multipart `image` in, PNG out).
    #[arg(long, env = "API_URL")]
    pub colorizer_url: String,

    /// Caller-side timeout for one colorization call.
    #[arg(long, env = "COLORIZE_GATEWAY_COLORIZE_TIMEOUT_SECS", default_value_t = 60)]
    pub colorize_timeout_secs: u64,

    /// Timeout for one round trip to the shared counter store.
    #[arg(long, env = "COLORIZE_GATEWAY_STORE_TIMEOUT_MS", default_value_t = 2000)]
    pub store_timeout_ms: u64,

    /// Length of the burst rate-limit window.
    #[arg(long, env = "COLORIZE_GATEWAY_BURST_WINDOW_SECS", default_value_t = 60)]
    pub burst_window_secs: u64,

    /// Units a client may consume within one burst window.
    #[arg(long, env = "COLORIZE_GATEWAY_BURST_LIMIT", default_value_t = 5)]
    pub burst_limit: u64,

    /// Units a client may consume within one day.
    #[arg(long, env = "COLORIZE_GATEWAY_DAILY_LIMIT", default_value_t = 25)]
    pub daily_limit: u64,

    /// Hard ceiling for a single uploaded image.
    #[arg(long, env = "COLORIZE_GATEWAY_MAX_UPLOAD_BYTES", default_value_t = 1024 * 1024)]
    pub max_upload_bytes: u64,

    /// Maximum number of files accepted by one colorize request.
    #[arg(long, env = "COLORIZE_GATEWAY_MAX_FILES_PER_REQUEST", default_value_t = 5)]
    pub max_files_per_request: usize,

    /// Size of the worker pool and of the colorizer concurrency cap.
    /// Defaults to five workers per core, capped at 32.
    #[arg(long, env = "COLORIZE_GATEWAY_WORKERS")]
    pub workers: Option<usize>,

    /// Sessions older than this are removed by the background reaper.
    #[arg(long, env = "COLORIZE_GATEWAY_SESSION_MAX_AGE_HOURS", default_value_t = 2)]
    pub session_max_age_hours: u64,

    /// How often the background reaper runs. 0 disables it.
    #[arg(long, env = "COLORIZE_GATEWAY_REAP_INTERVAL_SECS", default_value_t = 600)]
    pub reap_interval_secs: u64,

    /// Public URL of this backend, reported to the frontend by GET /config.
    #[arg(long, env = "BACKEND_URL")]
    pub public_backend_url: Option<String>,
}

impl AppConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .unwrap_or_else(default_worker_count)
    }

    pub fn colorize_timeout(&self) -> Duration {
        Duration::from_secs(self.colorize_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_hours * 3600)
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        (self.reap_interval_secs > 0).then(|| Duration::from_secs(self.reap_interval_secs))
    }
}

fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 5).min(32)
}
