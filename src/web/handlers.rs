// API handlers for the web server

use super::{
    AppState,
    error::ApiError,
    extract_request_data::{ClientMeta, read_colorize_form, read_predict_image},
    models::*,
};
use crate::identity::{self, ClientKey};
use crate::pipeline::WorkItem;
use crate::rate_limit::AdmitError;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use std::time::{Duration, Instant};
use tracing::{debug, info};

static X_PROCESS_TIME_MS: HeaderName = HeaderName::from_static("x-process-time-ms");

/// Consumes `amount` units of the client's quota, recording the decision under `scope`.
pub(super) async fn admit(state: &AppState, key: &ClientKey, amount: u64, scope: &'static str) -> Result<(), ApiError> {
    match state.limiter.admit(key, amount).await {
        Ok(_) => {
            metrics::counter!("ratelimit_allowed_total", "scope" => scope).increment(1);
            Ok(())
        }
        Err(err) => {
            if matches!(err, AdmitError::RateLimitExceeded { .. }) {
                metrics::counter!("ratelimit_blocked_total", "scope" => scope).increment(1);
            }
            Err(err.into())
        }
    }
}

// --- POST /upload/check ---
// Charges the quota for files the client is about to upload
pub async fn upload_check(
    State(state): State<AppState>,
    ClientMeta(meta): ClientMeta,
    Json(payload): Json<UploadCheckRequest>,
) -> Result<Json<UploadCheckResponse>, ApiError> {
    debug!(
        "Upload check: current={}, new={}, total={}",
        payload.current_file_count, payload.new_file_count, payload.total_file_count
    );

    // Anything above the daily quota can never be admitted.
    let daily_limit = state.limiter.policy().daily_limit;
    if payload.new_file_count > daily_limit {
        return Err(ApiError::BadRequest(format!(
            "newFileCount must not exceed {}",
            daily_limit
        )));
    }

    let key = identity::resolve(&meta, payload.fingerprint.as_deref());
    admit(&state, &key, payload.new_file_count, "upload_check").await?;

    Ok(Json(UploadCheckResponse { allowed: true }))
}

// --- POST /api/colorize ---
// Colorizes up to `max_files_per_request` uploaded images into the caller's session
pub async fn colorize(
    State(state): State<AppState>,
    ClientMeta(meta): ClientMeta,
    mut multipart: Multipart,
) -> Result<Json<ProcessingResult>, ApiError> {
    let form = read_colorize_form(&mut multipart, &state, &meta).await?;
    let file_count = form.inputs.len();

    let session = state.sessions.allocate(form.session_token.as_deref()).await?;

    let indices = {
        let sessions = state.sessions.clone();
        let session = session.clone();
        state
            .workers
            .run(move || sessions.reserve_indices(&session, file_count as u64))
            .await?
            .map_err(|e| ApiError::InternalServerError(format!("Failed to scan session: {}", e)))?
    };

    let items = form
        .inputs
        .iter()
        .zip(indices)
        .map(|(input, index)| WorkItem {
            index,
            input: input.clone(),
            output: session.result_path(index),
        })
        .collect();

    info!(session = %session.token, files = file_count, "Colorizing batch");
    let report = state
        .pipeline
        .process_batch(&session.token, items)
        .await
        .ensure_any_succeeded()?;

    let colorized_images: Vec<String> = report
        .outcomes
        .iter()
        .filter_map(|outcome| outcome.result.as_ref().ok())
        .filter_map(|path| path.file_name().and_then(|n| n.to_str()))
        .map(|name| result_url(&session.token, name))
        .collect();
    let processed_count = report.processed_count();

    Ok(Json(ProcessingResult {
        success: true,
        message: format!(
            "Successfully processed {} of {} images",
            processed_count, file_count
        ),
        session_token: session.token,
        processed_count,
        colorized_images,
    }))
}

// --- GET /api/result/{session}/{file} ---
pub async fn get_result(
    State(state): State<AppState>,
    Path((session_token, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let path = state.sessions.result_file(&session_token, &filename).await?;
    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::InternalServerError(format!("Failed to read result: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], data).into_response())
}

// --- GET /api/results/{session} ---
pub async fn list_results(
    State(state): State<AppState>,
    Path(session_token): Path<String>,
) -> Result<Json<SessionResults>, ApiError> {
    let entries = state.sessions.list_results(&session_token).await?;
    let results = entries
        .into_iter()
        .map(|entry| ResultInfo::from_entry(&session_token, entry))
        .collect();

    Ok(Json(SessionResults {
        session_token,
        results,
    }))
}

// --- POST /admin/cleanup?max_age_hours=N ---
pub async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let max_age = Duration::from_secs(query.max_age_hours.unwrap_or(2).saturating_mul(3600));
    let sessions = state.sessions.clone();
    let report = state
        .workers
        .run(move || sessions.reap_older_than(max_age))
        .await?;

    info!(
        removed = report.removed,
        failed = report.failed,
        "Cleanup finished"
    );
    Ok(Json(CleanupResponse {
        message: format!("Cleaned up {} old sessions", report.removed),
        removed: report.removed,
        failed: report.failed,
    }))
}

// --- GET /health ---
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let backend = state.limiter.backend_name();
    Json(HealthResponse {
        status: "healthy",
        colorization_available: true,
        max_files_per_session: state.limiter.policy().daily_limit,
        redis: backend == "redis",
        limiter_backend: backend,
    })
}

// --- POST /api/predict ---
// Colorizes one image and returns it directly
pub async fn predict(
    State(state): State<AppState>,
    ClientMeta(meta): ClientMeta,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let started = Instant::now();

    let key = identity::resolve(&meta, None);
    admit(&state, &key, 1, "predict").await?;

    let (data, media_type) = read_predict_image(
        &mut multipart,
        state.limits.max_upload_bytes,
        state.sniffer.as_ref(),
    )
    .await?;
    let png = state
        .pipeline
        .colorize_bytes(data, Some(media_type.to_string()))
        .await?;

    let elapsed_ms = started.elapsed().as_millis().to_string();
    let elapsed_ms = HeaderValue::from_str(&elapsed_ms)
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (X_PROCESS_TIME_MS.clone(), elapsed_ms),
        ],
        png,
    )
        .into_response())
}

// --- GET /config ---
pub async fn config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        backend_url: state.public_backend_url.clone(),
    })
}
