use super::{AppState, handlers};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::Level;

/// Room for multipart boundaries, part headers and the small text fields.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn create_app(state: AppState) -> Router {
    let per_file = usize::try_from(state.limits.max_upload_bytes).unwrap_or(usize::MAX);
    let body_limit = per_file
        .saturating_mul(state.limits.max_files_per_request.max(1))
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        // Admission
        .route("/upload/check", post(handlers::upload_check))
        // Colorization
        .route("/api/colorize", post(handlers::colorize))
        .route("/api/predict", post(handlers::predict))
        // Results
        .route("/api/result/{session_token}/{filename}", get(handlers::get_result))
        .route("/api/results/{session_token}", get(handlers::list_results))
        // Operations
        .route("/admin/cleanup", post(handlers::cleanup))
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::config))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::INFO)))
        .with_state(state)
}
