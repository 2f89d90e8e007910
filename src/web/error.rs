// Error types for the HTTP surface

use crate::pipeline::{ItemError, NoItemsSucceeded};
use crate::rate_limit::{AdmitError, LimitScope};
use crate::session::SessionError;
use crate::upload::UploadError;
use crate::worker_pool::WorkerError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use serde_json::json;
use std::time::Duration;

/// API server error types
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    UnsupportedMediaType(String),
    TooManyRequests {
        message: String,
        retry_after_secs: u64,
    },
    InternalServerError(String),
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, retry_after) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            Self::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg, None),
            Self::UnsupportedMediaType(msg) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg, None),
            Self::TooManyRequests {
                message,
                retry_after_secs,
            } => (StatusCode::TOO_MANY_REQUESTS, message, Some(retry_after_secs)),
            Self::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            Self::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None),
        };

        let body = Json(json!({
            "error": {
                "status": status.as_u16(),
                "message": error_message,
            }
        }));

        match retry_after {
            Some(secs) => (
                status,
                TypedHeader(headers::RetryAfter::delay(Duration::from_secs(secs))),
                body,
            )
                .into_response(),
            None => (status, body).into_response(),
        }
    }
}

impl From<AdmitError> for ApiError {
    fn from(error: AdmitError) -> Self {
        match error {
            AdmitError::RateLimitExceeded {
                scope,
                retry_after_secs,
            } => Self::TooManyRequests {
                message: match scope {
                    LimitScope::Burst => "Rate limit exceeded. Try again in a minute.".to_string(),
                    LimitScope::Daily => "Daily quota reached. Try again tomorrow.".to_string(),
                },
                retry_after_secs,
            },
            AdmitError::LimiterUnavailable(_) => Self::ServiceUnavailable(
                "Rate limiting is temporarily unavailable. Please retry shortly.".to_string(),
            ),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::PayloadTooLarge { .. } => Self::PayloadTooLarge(error.to_string()),
            UploadError::UnsupportedMediaType { .. } => {
                Self::UnsupportedMediaType(error.to_string())
            }
            UploadError::EmptyPayload | UploadError::Stream(_) => {
                Self::BadRequest(error.to_string())
            }
            UploadError::Io(_) => Self::InternalServerError(error.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::InvalidToken | SessionError::InvalidFileName => {
                Self::BadRequest(error.to_string())
            }
            SessionError::NotFound => Self::NotFound(error.to_string()),
            SessionError::Io(_) => Self::InternalServerError(error.to_string()),
        }
    }
}

impl From<ItemError> for ApiError {
    fn from(error: ItemError) -> Self {
        match error {
            ItemError::DecodeFailure(_) => Self::BadRequest("Could not decode image".to_string()),
            ItemError::TransformFailure(_) | ItemError::EncodeFailure(_) => {
                Self::InternalServerError(error.to_string())
            }
        }
    }
}

impl From<NoItemsSucceeded> for ApiError {
    fn from(_: NoItemsSucceeded) -> Self {
        Self::InternalServerError("Failed to process any images".to_string())
    }
}

impl From<WorkerError> for ApiError {
    fn from(error: WorkerError) -> Self {
        Self::ServiceUnavailable(error.to_string())
    }
}
