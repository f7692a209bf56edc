use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use common::config::Configuration;
use common::staging::{StagingConfig, StagingManager};
use server::{AppState, create_router};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestContext {
    app: Router,
    staging: Arc<StagingManager>,
    upload_dir: PathBuf,
    _temp_dir: TempDir,
}

async fn setup() -> TestContext {
    let temp_dir = TempDir::new().unwrap();
    let upload_dir = temp_dir.path().join("uploads");
    std::fs::create_dir_all(&upload_dir).unwrap();

    let mut config = Configuration::default();
    config.server.upload_dir = upload_dir.to_string_lossy().into_owned();
    config.staging = StagingConfig {
        staging_dir: temp_dir.path().join("staging"),
        // Sweeps are driven explicitly in these tests
        reclaim_delay: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
    };

    let staging = Arc::new(StagingManager::new(config.staging.clone()).await.unwrap());
    let app = create_router(AppState::new(Arc::clone(&staging), &config));

    TestContext {
        app,
        staging,
        upload_dir,
        _temp_dir: temp_dir,
    }
}

fn multipart_upload_request(filename: &str, content: &[u8]) -> Request<Body> {
    let boundary = "filedrop-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let ctx = setup().await;

    let response = ctx
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upload_stores_file_and_releases_staging() {
    let ctx = setup().await;

    let response = ctx
        .app
        .clone()
        .oneshot(multipart_upload_request("hello.txt", b"hello filedrop"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["uploaded"][0], "hello.txt");

    let stored = std::fs::read(ctx.upload_dir.join("hello.txt")).unwrap();
    assert_eq!(stored, b"hello filedrop");

    // The handler released the staged file; one sweep fully untracks it
    ctx.staging.sweep_now().await;
    assert_eq!(ctx.staging.tracked_files().await, 0);
    let staged_leftovers = std::fs::read_dir(ctx.staging.staging_dir())
        .unwrap()
        .count();
    assert_eq!(staged_leftovers, 0);
}

#[tokio::test]
async fn test_upload_sanitizes_client_filename() {
    let ctx = setup().await;

    let response = ctx
        .app
        .clone()
        .oneshot(multipart_upload_request("../../escape.txt", b"contained"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The file lands inside the upload directory under its base name
    assert!(ctx.upload_dir.join("escape.txt").is_file());
}

#[tokio::test]
async fn test_upload_without_file_field_is_rejected() {
    let ctx = setup().await;

    let boundary = "filedrop-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"comment\"\r\n\r\n\
         just text\r\n\
         --{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = ctx.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_download_roundtrip() {
    let ctx = setup().await;
    std::fs::write(ctx.upload_dir.join("report.pdf"), b"%PDF-1.7").unwrap();

    let response = ctx
        .app
        .oneshot(
            Request::builder()
                .uri("/download?file=report.pdf")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/pdf"
    );
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"report.pdf\""
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"%PDF-1.7");
}

#[tokio::test]
async fn test_download_missing_file_returns_404() {
    let ctx = setup().await;

    let response = ctx
        .app
        .oneshot(
            Request::builder()
                .uri("/download?file=absent.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_traversal_is_neutralized() {
    let ctx = setup().await;
    // A file outside the upload directory must stay unreachable
    std::fs::write(ctx._temp_dir.path().join("outside.txt"), b"secret").unwrap();

    let response = ctx
        .app
        .oneshot(
            Request::builder()
                .uri("/download?file=../outside.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_files() {
    let ctx = setup().await;
    std::fs::write(ctx.upload_dir.join("b.txt"), b"b").unwrap();
    std::fs::write(ctx.upload_dir.join("a.txt"), b"a").unwrap();

    let response = ctx
        .app
        .oneshot(Request::builder().uri("/files").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["files"], serde_json::json!(["a.txt", "b.txt"]));
}

#[tokio::test]
async fn test_delete_file() {
    let ctx = setup().await;
    let path = ctx.upload_dir.join("victim.txt");
    std::fs::write(&path, b"bytes").unwrap();

    let response = ctx
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/files?file=victim.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!path.exists());

    // Deleting again reports not found
    let response = ctx
        .app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/files?file=victim.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
