// Request and response bodies of the HTTP API

use crate::session::ResultEntry;
use serde::{Deserialize, Serialize};

/// Pre-flight quota check sent by the frontend before uploading.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UploadCheckRequest {
    #[serde(default)]
    pub current_file_count: u64,
    #[serde(default)]
    pub new_file_count: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct UploadCheckResponse {
    pub allowed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProcessingResult {
    pub success: bool,
    pub message: String,
    pub session_token: String,
    pub processed_count: usize,
    pub colorized_images: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ResultInfo {
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub created: f64,
}

impl ResultInfo {
    pub fn from_entry(session_token: &str, entry: ResultEntry) -> Self {
        Self {
            url: result_url(session_token, &entry.filename),
            filename: entry.filename,
            size: entry.size,
            created: entry.created,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionResults {
    pub session_token: String,
    pub results: Vec<ResultInfo>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CleanupQuery {
    pub max_age_hours: Option<u64>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CleanupResponse {
    pub message: String,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Serialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: &'static str,
    pub colorization_available: bool,
    pub max_files_per_session: u64,
    pub redis: bool,
    pub limiter_backend: &'static str,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub backend_url: Option<String>,
}

pub fn result_url(session_token: &str, filename: &str) -> String {
    format!("/api/result/{}/{}", session_token, filename)
}
