// Client for the remote colorization backend.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ColorizeError {
    #[error("colorizer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("colorizer rejected the image: {0}")]
    Rejected(String),
}

/// Turns a grayscale PNG into a colorized image.
#[async_trait]
pub trait Colorizer: Send + Sync {
    async fn colorize(&self, png: Vec<u8>) -> Result<Bytes, ColorizeError>;
}

/// Posts the image as multipart field `image` and expects the result as the response body.
pub struct RemoteColorizer {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteColorizer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ColorizeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Colorizer for RemoteColorizer {
    async fn colorize(&self, png: Vec<u8>) -> Result<Bytes, ColorizeError> {
        let part = reqwest::multipart::Part::bytes(png)
            .file_name("input.png")
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(&self.endpoint)
            .header(header::ACCEPT, "image/png")
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(ColorizeError::Rejected("empty response body".to_string()));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        extract::Multipart,
        http::{HeaderMap, StatusCode},
        routing::post,
    };

    async fn echo(headers: HeaderMap, mut multipart: Multipart) -> Result<Vec<u8>, StatusCode> {
        let agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let accept = headers
            .get("accept")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !agent.starts_with("colorize-gateway/") || accept != "image/png" {
            return Err(StatusCode::BAD_REQUEST);
        }

        while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
            if field.name() == Some("image")
                && field.file_name() == Some("input.png")
                && field.content_type() == Some("image/png")
            {
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                return Ok(data.to_vec());
            }
        }
        Err(StatusCode::UNPROCESSABLE_ENTITY)
    }

    async fn spawn_backend() -> String {
        let app = Router::new()
            .route("/predict.bin", post(echo))
            .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_sends_multipart_image_and_returns_body() {
        let base = spawn_backend().await;
        let colorizer =
            RemoteColorizer::new(&format!("{}/predict.bin/", base), Duration::from_secs(5)).unwrap();
        assert!(colorizer.endpoint().ends_with("/predict.bin"));

        let out = colorizer.colorize(b"fake png".to_vec()).await.unwrap();
        assert_eq!(&out[..], b"fake png");
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let base = spawn_backend().await;
        let colorizer =
            RemoteColorizer::new(&format!("{}/broken", base), Duration::from_secs(5)).unwrap();

        let err = colorizer.colorize(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ColorizeError::Request(e) if e.is_status()));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_an_error() {
        let colorizer =
            RemoteColorizer::new("http://127.0.0.1:1/predict.bin", Duration::from_secs(2)).unwrap();
        assert!(colorizer.colorize(b"x".to_vec()).await.is_err());
    }
}
