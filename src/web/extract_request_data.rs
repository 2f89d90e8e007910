use super::AppState;
use super::error::ApiError;
use super::handlers::admit;
use super::headers::{XClientFingerprint, XForwardedFor};
use crate::identity::{self, RequestMetadata};
use crate::session::{SessionPaths, TempDirGuard};
use crate::upload::{self, ContentSniffer};
use axum::{
    extract::{ConnectInfo, FromRequestParts, Multipart, multipart::MultipartError},
    http::{StatusCode, request::Parts},
};
use bytes::Bytes;
use headers::HeaderMapExt;
use mime::Mime;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::debug;

/// Connection metadata used to derive the client's rate-limit key.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta(pub RequestMetadata);

impl<S> FromRequestParts<S> for ClientMeta
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientMeta(RequestMetadata {
            forwarded_for: parts.headers.typed_get::<XForwardedFor>().map(|h| h.0),
            peer: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            header_fingerprint: parts.headers.typed_get::<XClientFingerprint>().map(|h| h.0),
        }))
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::BadRequest(format!("Failed to process multipart request: {}", err))
    }
}

/// Limits applied while reading an upload form.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_upload_bytes: u64,
    pub max_files_per_request: usize,
}

/// Fields of a `/api/colorize` form, with its files already staged on disk.
pub struct ColorizeForm {
    pub session_token: Option<String>,
    pub inputs: Vec<PathBuf>,
    // Dropping the form removes the staged inputs.
    _staging: Option<TempDirGuard>,
}

struct Staging {
    paths: SessionPaths,
    guard: TempDirGuard,
}

/// Reads the colorize form, streaming each `files` field into a staging directory
/// private to this request.
///
/// Each file is admitted against the client's quota before any of it is written.
/// The client key uses the `fingerprint` field when it precedes the file. The staging
/// directory sits under `sessionToken` when that field precedes the first file, and
/// under a fresh token otherwise.
pub async fn read_colorize_form(
    multipart: &mut Multipart,
    state: &AppState,
    meta: &RequestMetadata,
) -> Result<ColorizeForm, ApiError> {
    let sessions = &state.sessions;
    let limits = state.limits;
    let mut session_token: Option<String> = None;
    let mut fingerprint: Option<String> = None;
    let mut staging: Option<Staging> = None;
    let mut inputs = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("sessionToken") => {
                let token = field.text().await.map_err(multipart_error)?;
                let token = token.trim();
                if !token.is_empty() {
                    // Rejects malformed tokens before anything else is read.
                    sessions.paths(Some(token))?;
                    session_token = Some(token.to_string());
                }
            }
            Some("fingerprint") => {
                let value = field.text().await.map_err(multipart_error)?;
                fingerprint = Some(value).filter(|v| !v.is_empty());
            }
            Some("files") => {
                if inputs.len() >= limits.max_files_per_request {
                    return Err(ApiError::PayloadTooLarge(format!(
                        "Too many files in one request (max {}).",
                        limits.max_files_per_request
                    )));
                }

                let key = identity::resolve(meta, fingerprint.as_deref());
                admit(state, &key, 1, "colorize_batch").await?;

                if staging.is_none() {
                    let paths = sessions.paths(session_token.as_deref())?;
                    let guard = sessions.stage(&paths).await?;
                    staging = Some(Staging { paths, guard });
                }
                let Some(Staging { guard, .. }) = staging.as_ref() else {
                    continue;
                };

                let dest = guard.input_path(inputs.len());
                let (size, detected) = upload::receive_to_file(
                    field,
                    &dest,
                    limits.max_upload_bytes,
                    state.sniffer.as_ref(),
                )
                .await?;
                debug!(
                    item = inputs.len(),
                    size,
                    media_type = %detected,
                    "Staged upload {}",
                    dest.display()
                );
                inputs.push(dest);
            }
            other => {
                debug!("Ignoring multipart field: {}", other.unwrap_or("unnamed"));
            }
        }
    }

    if inputs.is_empty() {
        return Err(ApiError::BadRequest("No images provided".to_string()));
    }

    let session_token = session_token.or_else(|| staging.as_ref().map(|s| s.paths.token.clone()));
    Ok(ColorizeForm {
        session_token,
        inputs,
        _staging: staging.map(|s| s.guard),
    })
}

/// Reads the `image` field of a predict form into memory.
pub async fn read_predict_image(
    multipart: &mut Multipart,
    limit: u64,
    sniffer: &dyn ContentSniffer,
) -> Result<(Bytes, Mime), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("image") {
            return Ok(upload::read_limited(field, limit, sniffer).await?);
        }
        debug!("Ignoring multipart field: {}", field.name().unwrap_or("unnamed"));
    }

    Err(ApiError::BadRequest(
        "Missing 'image' field in multipart request.".to_string(),
    ))
}
