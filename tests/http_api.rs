// End-to-end tests of the HTTP surface against an in-process colorizer.

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use colorize_gateway::{
    AppState, create_app,
    colorizer::{ColorizeError, Colorizer},
    pipeline::ProcessingPipeline,
    rate_limit::{MemoryCounterStore, RateLimitPolicy, RateLimiter, RedisCounterStore},
    session::SessionStore,
    upload::MagicSniffer,
    web::UploadLimits,
    worker_pool::WorkerPool,
};
use http_body_util::BodyExt;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const MAX_UPLOAD_BYTES: u64 = 64 * 1024;
const BOUNDARY: &str = "gateway-test-boundary";

struct EchoColorizer;

#[async_trait]
impl Colorizer for EchoColorizer {
    async fn colorize(&self, png: Vec<u8>) -> Result<Bytes, ColorizeError> {
        Ok(Bytes::from(png))
    }
}

struct TestServer {
    app: Router,
    workers: WorkerPool,
    dir: TempDir,
}

impl TestServer {
    fn new() -> Self {
        // A long burst window keeps window rollover from racing the assertions.
        Self::with_limiter(Self::default_limiter())
    }

    fn with_limiter(limiter: RateLimiter) -> Self {
        Self::with_parts(limiter, WorkerPool::new(4))
    }

    fn with_parts(limiter: RateLimiter, workers: WorkerPool) -> Self {
        let dir = TempDir::new().unwrap();
        let state = AppState {
            limiter,
            sessions: SessionStore::open(dir.path()).unwrap(),
            pipeline: ProcessingPipeline::new(
                Arc::new(EchoColorizer),
                workers.clone(),
                4,
                Duration::from_secs(5),
            ),
            workers: workers.clone(),
            sniffer: Arc::new(MagicSniffer),
            limits: UploadLimits {
                max_upload_bytes: MAX_UPLOAD_BYTES,
                max_files_per_request: 5,
            },
            public_backend_url: Some("https://colorize.example.test".to_string()),
        };
        Self {
            app: create_app(state),
            workers,
            dir,
        }
    }

    fn default_limiter() -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            RateLimitPolicy {
                burst_window_secs: 3600,
                ..RateLimitPolicy::default()
            },
        )
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    fn temp_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("tmp_sessions"))
            .unwrap()
            .count()
    }

    /// Input files currently staged under any session.
    fn staged_inputs(&self) -> usize {
        fn count(dir: &std::path::Path) -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .map(|entry| {
                            if entry.path().is_dir() {
                                count(&entry.path())
                            } else {
                                1
                            }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        count(&self.dir.path().join("tmp_sessions"))
    }
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a [u8]),
}

fn multipart(uri: &str, client_ip: &str, parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"photo_{}.png\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, i
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .header("x-forwarded-for", client_ip)
        .body(Body::from(body))
        .unwrap()
}

fn json_request(uri: &str, client_ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", client_ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 200]));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

async fn body_bytes(response: Response) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_health_reports_limiter_backend() {
    let server = TestServer::new();
    let response = server.send(get("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["redis"], false);
    assert_eq!(body["limiter_backend"], "memory");
    assert_eq!(body["max_files_per_session"], 25);
}

#[tokio::test]
async fn test_config_exposes_public_backend_url() {
    let server = TestServer::new();
    let body = body_json(server.send(get("/config")).await).await;
    assert_eq!(body, json!({ "backendUrl": "https://colorize.example.test" }));
}

#[tokio::test]
async fn test_upload_check_denies_past_burst_with_retry_after() {
    let server = TestServer::new();
    let check = |count: u64| {
        json_request(
            "/upload/check",
            "198.51.100.1",
            json!({
                "currentFileCount": 0,
                "newFileCount": count,
                "totalFileCount": count,
                "fingerprint": "device-1",
            }),
        )
    };

    let allowed = server.send(check(5)).await;
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(body_json(allowed).await, json!({ "allowed": true }));

    let denied = server.send(check(1)).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = denied.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=3600).contains(&retry_after));
    let body = body_json(denied).await;
    assert_eq!(body["error"]["status"], 429);

    // Another client is unaffected.
    let other = json_request(
        "/upload/check",
        "198.51.100.2",
        json!({ "newFileCount": 1 }),
    );
    assert_eq!(server.send(other).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_colorize_batch_then_fetch_and_list_results() {
    let server = TestServer::new();
    let png = sample_png(6, 4);

    let response = server
        .send(multipart(
            "/api/colorize",
            "198.51.100.3",
            &[Part::File("files", &png), Part::File("files", &png)],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["processed_count"], 2);
    let token = body["session_token"].as_str().unwrap().to_string();
    assert_eq!(
        body["colorized_images"],
        json!([
            format!("/api/result/{}/colorized_0.png", token),
            format!("/api/result/{}/colorized_1.png", token),
        ])
    );
    assert_eq!(server.temp_entries(), 0);

    // A follow-up batch in the same session continues the numbering.
    let response = server
        .send(multipart(
            "/api/colorize",
            "198.51.100.3",
            &[Part::Text("sessionToken", &token), Part::File("files", &png)],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["session_token"], token.as_str());
    assert_eq!(
        body["colorized_images"],
        json!([format!("/api/result/{}/colorized_2.png", token)])
    );

    let image = server
        .send(get(&format!("/api/result/{}/colorized_1.png", token)))
        .await;
    assert_eq!(image.status(), StatusCode::OK);
    assert_eq!(image.headers()[header::CONTENT_TYPE], "image/png");
    let decoded = image::load_from_memory(&body_bytes(image).await).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (6, 4));

    let listing = body_json(server.send(get(&format!("/api/results/{}", token))).await).await;
    assert_eq!(listing["session_token"], token.as_str());
    let names: Vec<_> = listing["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["filename"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["colorized_0.png", "colorized_1.png", "colorized_2.png"]);
}

#[tokio::test]
async fn test_colorize_rejects_oversized_file() {
    let server = TestServer::new();
    let mut big = sample_png(2, 2);
    big.resize(MAX_UPLOAD_BYTES as usize + 1, 0);

    let response = server
        .send(multipart("/api/colorize", "198.51.100.4", &[Part::File("files", &big)]))
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(server.temp_entries(), 0);
}

#[tokio::test]
async fn test_colorize_rejects_non_image() {
    let server = TestServer::new();
    let response = server
        .send(multipart(
            "/api/colorize",
            "198.51.100.5",
            &[Part::File("files", b"hello, this is not an image")],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_colorize_rejects_too_many_files() {
    let server = TestServer::new();
    let png = sample_png(2, 2);
    let parts: Vec<_> = (0..6).map(|_| Part::File("files", &png)).collect();

    let response = server
        .send(multipart("/api/colorize", "198.51.100.6", &parts))
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(server.temp_entries(), 0);
}

#[tokio::test]
async fn test_colorize_without_files_is_bad_request() {
    let server = TestServer::new();
    let response = server
        .send(multipart(
            "/api/colorize",
            "198.51.100.7",
            &[Part::Text("fingerprint", "abc")],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_colorize_with_malformed_token_is_bad_request() {
    let server = TestServer::new();
    let png = sample_png(2, 2);
    let response = server
        .send(multipart(
            "/api/colorize",
            "198.51.100.8",
            &[Part::Text("sessionToken", "../escape"), Part::File("files", &png)],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_with_no_decodable_items_fails() {
    let server = TestServer::new();
    // PNG signature followed by junk: passes the sniffer, fails decoding.
    let mut broken = sample_png(2, 2)[..8].to_vec();
    broken.extend_from_slice(&[0u8; 64]);

    let response = server
        .send(multipart(
            "/api/colorize",
            "198.51.100.9",
            &[Part::File("files", &broken), Part::File("files", &broken)],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "Failed to process any images");
}

#[tokio::test]
async fn test_batch_counts_against_quota() {
    let server = TestServer::new();
    let png = sample_png(2, 2);
    let parts: Vec<_> = (0..5).map(|_| Part::File("files", &png)).collect();

    let first = server
        .send(multipart("/api/colorize", "198.51.100.10", &parts))
        .await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = server
        .send(multipart("/api/colorize", "198.51.100.10", &parts[..1]))
        .await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(server.temp_entries(), 0);
}

#[tokio::test]
async fn test_unavailable_limiter_fails_closed() {
    let store = RedisCounterStore::new("redis://127.0.0.1:1/", Duration::from_millis(300)).unwrap();
    let server =
        TestServer::with_limiter(RateLimiter::new(Arc::new(store), RateLimitPolicy::default()));

    let response = server
        .send(json_request(
            "/upload/check",
            "198.51.100.11",
            json!({ "newFileCount": 1 }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_predict_returns_png_directly() {
    let server = TestServer::new();
    let png = sample_png(3, 3);

    let response = server
        .send(multipart("/api/predict", "198.51.100.12", &[Part::File("image", &png)]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    assert!(response.headers().contains_key("x-process-time-ms"));

    let decoded = image::load_from_memory(&body_bytes(response).await).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (3, 3));
}

#[tokio::test]
async fn test_missing_results_are_not_found() {
    let server = TestServer::new();
    assert_eq!(
        server.send(get("/api/results/unknown-session")).await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        server
            .send(get("/api/result/unknown-session/colorized_0.png"))
            .await
            .status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_cleanup_removes_sessions() {
    let server = TestServer::new();
    let png = sample_png(2, 2);
    let body = body_json(
        server
            .send(multipart("/api/colorize", "198.51.100.13", &[Part::File("files", &png)]))
            .await,
    )
    .await;
    let token = body["session_token"].as_str().unwrap().to_string();

    let kept = body_json(
        server
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/admin/cleanup")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await,
    )
    .await;
    assert_eq!(kept["message"], "Cleaned up 0 old sessions");

    let response = server
        .send(
            Request::builder()
                .method("POST")
                .uri("/admin/cleanup?max_age_hours=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Cleaned up 1 old sessions");

    assert_eq!(
        server.send(get(&format!("/api/results/{}", token))).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_upload_check_rejects_file_counts_beyond_daily_quota() {
    let server = TestServer::new();
    let check = |count: u64| {
        json_request(
            "/upload/check",
            "198.51.100.14",
            json!({ "newFileCount": count }),
        )
    };

    for hostile in [26, u64::MAX - 29, u64::MAX] {
        let response = server.send(check(hostile)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["status"], 400);
    }

    // Rejected counts consumed nothing, so the full burst is still available.
    assert_eq!(server.send(check(5)).await.status(), StatusCode::OK);
    assert_eq!(
        server.send(check(1)).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_limited_client_is_refused_before_files_are_staged() {
    let server = TestServer::new();
    let png = sample_png(2, 2);

    let check = json_request(
        "/upload/check",
        "198.51.100.15",
        json!({ "newFileCount": 4 }),
    );
    assert_eq!(server.send(check).await.status(), StatusCode::OK);

    let response = server
        .send(multipart(
            "/api/colorize",
            "198.51.100.15",
            &[
                Part::Text("sessionToken", "limited"),
                Part::File("files", &png),
                Part::File("files", &png),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(server.temp_entries(), 0);
    assert_eq!(
        server.send(get("/api/results/limited")).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_batches_on_one_session_keep_their_own_inputs() {
    let server = TestServer::with_parts(TestServer::default_limiter(), WorkerPool::new(1));

    // Occupy the only worker so neither batch can decode until both are staged.
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let blocker = {
        let workers = server.workers.clone();
        tokio::spawn(async move {
            workers
                .run(move || {
                    let _ = started_tx.send(());
                    let _ = release_rx.recv();
                })
                .await
        })
    };
    started_rx.await.unwrap();

    let wide = sample_png(6, 4);
    let square = sample_png(3, 3);
    let send = |client: &'static str, png: Vec<u8>| {
        let app = server.app.clone();
        tokio::spawn(async move {
            let request = multipart(
                "/api/colorize",
                client,
                &[Part::Text("sessionToken", "shared"), Part::File("files", &png)],
            );
            app.oneshot(request).await.unwrap()
        })
    };
    let first = send("198.51.100.16", wide);
    let second = send("198.51.100.17", square);

    let mut waited = 0;
    while server.staged_inputs() < 2 {
        assert!(waited < 500, "both batches should stage their inputs");
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    release_tx.send(()).unwrap();
    blocker.await.unwrap().unwrap();

    for (handle, expected) in [(first, (6, 4)), (second, (3, 3))] {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let url = body["colorized_images"][0].as_str().unwrap().to_string();

        let image = server.send(get(&url)).await;
        assert_eq!(image.status(), StatusCode::OK);
        let decoded = image::load_from_memory(&body_bytes(image).await).unwrap();
        assert_eq!((decoded.width(), decoded.height()), expected);
    }

    let listing = body_json(server.send(get("/api/results/shared")).await).await;
    assert_eq!(listing["results"].as_array().unwrap().len(), 2);
    assert_eq!(server.temp_entries(), 0);
}
