// Library entry point for colorize-gateway.
// Wires together admission control (client identity + rate limiting),
// the bounded upload/processing pipelines and the HTTP surface.

pub mod colorizer;
pub mod config;
pub mod identity;
pub mod image_codec;
pub mod pipeline;
pub mod rate_limit;
pub mod session;
pub mod shutdown_signal;
pub mod upload;
pub mod web;
pub mod worker_pool;

pub use config::AppConfig;
pub use web::{AppState, create_app};
