// Web server module
// Handles HTTP API endpoints for admission checks, colorization and results

mod app;
mod error;
mod extract_request_data;
mod handlers;
mod headers;
mod listeners;
mod models;

pub use app::create_app;
pub use error::ApiError;
pub use extract_request_data::UploadLimits;
pub use listeners::create_listener;
pub use models::{ProcessingResult, result_url};

use crate::colorizer::{ColorizeError, RemoteColorizer};
use crate::config::AppConfig;
use crate::pipeline::ProcessingPipeline;
use crate::rate_limit::{
    CounterStore, MemoryCounterStore, RateLimitPolicy, RateLimiter, RedisCounterStore, StoreError,
    spawn_eviction_task,
};
use crate::session::{SessionStore, spawn_reaper};
use crate::upload::{ContentSniffer, MagicSniffer};
use crate::worker_pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const COUNTER_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub limiter: RateLimiter,
    pub sessions: SessionStore,
    pub pipeline: ProcessingPipeline,
    pub workers: WorkerPool,
    pub sniffer: Arc<dyn ContentSniffer>,
    pub limits: UploadLimits,
    pub public_backend_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cannot prepare data directory: {0}")]
    Storage(#[from] std::io::Error),
    #[error("invalid rate-limit store configuration: {0}")]
    CounterStore(#[from] StoreError),
    #[error("cannot create colorizer client: {0}")]
    Colorizer(#[from] ColorizeError),
}

/// Periodic tasks started alongside the server.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn stop(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

impl AppState {
    /// Builds the shared state and starts its background tasks. Must run inside a tokio runtime.
    pub fn from_config(config: &AppConfig) -> Result<(Self, BackgroundTasks), StartupError> {
        let mut background = BackgroundTasks::default();

        let store: Arc<dyn CounterStore> = match config.redis_url.as_deref() {
            Some(url) => {
                tracing::info!("Rate-limit counters are shared through Redis");
                Arc::new(RedisCounterStore::new(url, config.store_timeout())?)
            }
            None => {
                tracing::warn!(
                    "No Redis URL configured; rate-limit counters are kept in process memory and not shared between instances"
                );
                let store = MemoryCounterStore::new();
                background
                    .handles
                    .push(spawn_eviction_task(store.clone(), COUNTER_EVICTION_INTERVAL));
                Arc::new(store)
            }
        };
        let limiter = RateLimiter::new(
            store,
            RateLimitPolicy {
                burst_window_secs: config.burst_window_secs,
                burst_limit: config.burst_limit,
                daily_limit: config.daily_limit,
            },
        );

        let sessions = SessionStore::open(&config.data_dir)?;
        tracing::info!("Session data directory set to: {}", config.data_dir.display());

        let worker_count = config.worker_count();
        let workers = WorkerPool::new(worker_count);
        let colorizer = RemoteColorizer::new(&config.colorizer_url, config.colorize_timeout())?;
        tracing::info!("Colorizer endpoint: {}", colorizer.endpoint());
        let pipeline = ProcessingPipeline::new(
            Arc::new(colorizer),
            workers.clone(),
            worker_count,
            config.colorize_timeout(),
        );

        if let Some(interval) = config.reap_interval() {
            background.handles.push(spawn_reaper(
                sessions.clone(),
                workers.clone(),
                interval,
                config.session_max_age(),
            ));
        }

        let state = AppState {
            limiter,
            sessions,
            pipeline,
            workers,
            sniffer: Arc::new(MagicSniffer),
            limits: UploadLimits {
                max_upload_bytes: config.max_upload_bytes,
                max_files_per_request: config.max_files_per_request,
            },
            public_backend_url: config.public_backend_url.clone(),
        };
        Ok((state, background))
    }
}
