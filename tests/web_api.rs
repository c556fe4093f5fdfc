//! Integration tests for the print host HTTP API

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt; // for .collect().await
use makeme::job_lock::JobLock;
use makeme::model_pipeline::{CommandNormalizer, HttpFetcher};
use makeme::orchestrator::Orchestrator;
use makeme::web::api::{create_router, AppState, AppStateInner};
use makeme_shared::config::PathsConfig;
use makeme_shared::StaticCredentials;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt; // for `oneshot`

const GOOD_AUTH: &str = "Basic aHVib3Q6aXNhbGl2ZQ=="; // hubot:isalive
const BAD_AUTH: &str = "Basic aHVib3Q6d3Jvbmc="; // hubot:wrong

fn test_state(root: &Path) -> AppState {
    let paths = PathsConfig::under(root).resolve();
    let lock = JobLock::file(&paths.lock_file);
    let fetcher = HttpFetcher::new(Duration::from_secs(1), "makeme-test").unwrap();
    let normalizer = CommandNormalizer::new("cp", vec!["{inputs}".into(), "{output}".into()]);
    let orchestrator = Orchestrator::new(paths, lock, Arc::new(fetcher), Arc::new(normalizer), "sleep 30");
    Arc::new(AppStateInner {
        orchestrator,
        auth_backend: Box::new(StaticCredentials::new("hubot", "isalive")),
    })
}

fn print_request(auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/print")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_print_requires_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(dir.path()));

    let response = app
        .clone()
        .oneshot(print_request(None, json!({"url": "https://models.example/cube.stl"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let response = app
        .oneshot(print_request(Some(BAD_AUTH), json!({"url": "https://models.example/cube.stl"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!dir.path().join("tmp/make.lock").exists());
}

#[tokio::test]
async fn test_local_file_is_not_acceptable() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(dir.path()));

    let response = app
        .oneshot(print_request(
            Some(GOOD_AUTH),
            json!({"url": "file:///etc/passwd", "quality": null, "slicer_args": null}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    let json = json_body(response).await;
    assert_eq!(json["error"], "Need a remote file");
    assert_eq!(json["kind"], "invalid_input");
}

#[tokio::test]
async fn test_busy_lock_is_locked() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    state
        .orchestrator
        .lock()
        .acquire()
        .unwrap()
        .transfer(std::process::id())
        .unwrap();
    let app = create_router(state);

    let response = app
        .oneshot(print_request(Some(GOOD_AUTH), json!({"url": ["https://models.example/a.stl"]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::LOCKED);
    let json = json_body(response).await;
    assert_eq!(json["kind"], "conflict");
    assert_eq!(json["lock"]["state"], "held");
    assert_eq!(json["lock"]["owner_pid"], json!(std::process::id()));
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(dir.path()));
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/print")
        .header(header::AUTHORIZATION, GOOD_AUTH)
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_status_is_public_and_reads_the_log() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
    std::fs::write(dir.path().join("tmp/make.log"), "Sent 3/4 [75%]\n").unwrap();
    let app = create_router(test_state(dir.path()));

    let request = Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["progress"], 75);
    assert_eq!(json["locked"], false);
    assert_eq!(json["lock"]["state"], "free");

    let request = Request::builder().uri("/api/v1/log").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Sent 3/4 [75%]\n");
}

#[tokio::test]
async fn test_current_model() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(dir.path()));

    let request = Request::builder().uri("/api/v1/current_model").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"not found");

    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data/print.stl"), b"solid cube").unwrap();
    let request = Request::builder().uri("/api/v1/current_model").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/sla");
}
