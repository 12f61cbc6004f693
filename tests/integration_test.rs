//! Integration tests for the site API
//!
//! These tests drive the full router against a temporary redb database:
//! - Redirect resolution and its metrics
//! - Metrics reporting in every format
//! - KV export/import
//! - Image optimisation and alt text
//! - Error envelopes

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tower::ServiceExt;

use site_api::alt_text::AltTextGenerator;
use site_api::config::Config;
use site_api::database::init_db;
use site_api::error::AppError;
use site_api::route::create_app;
use site_api::state::AppState;
use site_api::tasks::BackgroundTasks;
use site_api::token::{issue_token, Claims};

const SECRET: &str = "integration-secret";
const ALT_TEXT: &str = "A colourful gradient test pattern";

struct StubAltText;

#[async_trait]
impl AltTextGenerator for StubAltText {
    async fn describe(&self, image: &[u8]) -> Result<String, AppError> {
        assert!(!image.is_empty());
        Ok(ALT_TEXT.to_string())
    }
}

fn test_config() -> Config {
    Config {
        jwt_secret: SECRET.to_string(),
        public_url: "http://test.local".to_string(),
        ..Config::default()
    }
}

/// Helper function to create a test application with a temporary database
fn setup_with_config(config: Config) -> (Router, AppState, NamedTempFile) {
    let temp_db = NamedTempFile::new().expect("Failed to create temp file");
    let db = init_db(temp_db.path().to_str().unwrap()).expect("Failed to initialize test database");

    let state = AppState::build(
        Arc::new(db),
        config,
        reqwest::Client::new(),
        Arc::new(StubAltText),
        BackgroundTasks::inline(),
    )
    .expect("Failed to build state");

    (create_app(state.clone()), state, temp_db)
}

fn setup_test_app() -> (Router, AppState, NamedTempFile) {
    setup_with_config(test_config())
}

fn token(scope: &str) -> String {
    issue_token(SECRET.as_bytes(), &Claims::new(scope)).unwrap()
}

fn get(uri: &str, scope: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(scope) = scope {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(scope)));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, scope: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token(scope)))
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap()
}

async fn body_bytes(body: Body) -> Vec<u8> {
    body.collect()
        .await
        .expect("Failed to read response body")
        .to_bytes()
        .to_vec()
}

/// Helper function to parse response body as JSON
async fn response_json(body: Body) -> Value {
    serde_json::from_slice(&body_bytes(body).await).expect("Failed to parse JSON")
}

async fn kv_value(state: &AppState, key: &str) -> Option<String> {
    state.kv.get(key).await.unwrap()
}

fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[tokio::test]
async fn test_redirect_found_counts_hit() {
    let (app, state, _temp_db) = setup_test_app();
    state.kv.put("redirect:gh", "https://github.com/x").await.unwrap();

    let response = app.oneshot(get("/go/gh", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://github.com/x"
    );
    assert_eq!(kv_value(&state, "metrics:redirect:gh:ok").await.as_deref(), Some("1"));
    assert!(kv_value(&state, "metrics:redirect:gh:last-hit").await.is_some());
    assert!(kv_value(&state, "metrics:redirect:gh:error").await.is_none());
}

#[tokio::test]
async fn test_redirect_unknown_slug() {
    let (app, state, _temp_db) = setup_test_app();

    let response = app.oneshot(get("/go/nope", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["status"], 404);
    assert!(body.get("result").is_none());
    assert!(body["timestamp"].is_string());
    assert_eq!(kv_value(&state, "metrics:redirect:nope:error").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_create_redirect_then_follow() {
    let (app, _state, _temp_db) = setup_test_app();

    let payload = json!({ "url": "https://example.com/blog", "slug": "blog" });
    let response = app
        .clone()
        .oneshot(post(
            "/api/admin/redirects",
            "admin:redirects",
            "application/json",
            payload.to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["status"], 201);
    assert_eq!(body["result"]["slug"], "blog");
    assert!(body["error"].is_null());

    let response = app.clone().oneshot(get("/go/blog", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    // Same slug again
    let response = app
        .clone()
        .oneshot(post(
            "/api/admin/redirects",
            "admin",
            "application/json",
            payload.to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // No slug: a random one is generated
    let response = app
        .oneshot(post(
            "/api/admin/redirects",
            "admin:redirects",
            "application/json",
            json!({ "url": "https://example.com/other" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["result"]["slug"].as_str().unwrap().len(), 6);
}

#[tokio::test]
async fn test_create_redirect_rejects_bad_url() {
    let (app, _state, _temp_db) = setup_test_app();

    let response = app
        .oneshot(post(
            "/api/admin/redirects",
            "admin:redirects",
            "application/json",
            json!({ "url": "not a url" }).to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_api_requests_are_counted() {
    let (app, state, _temp_db) = setup_test_app();

    let request = Request::builder()
        .uri("/api/metrics")
        .header(header::AUTHORIZATION, format!("Bearer {}", token("api:metrics")))
        .header(header::USER_AGENT, "curl/8.4.0")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(kv_value(&state, "metrics:ok").await.as_deref(), Some("1"));
    assert_eq!(
        kv_value(&state, "metrics:resources:metrics:ok").await.as_deref(),
        Some("1")
    );
    assert_eq!(kv_value(&state, "metrics:visitors:bot").await.as_deref(), Some("1"));

    // A failed request counts as an error, by kind
    let response = app
        .oneshot(get("/api/metrics?format=xml", Some("api:metrics")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(kv_value(&state, "metrics:error").await.as_deref(), Some("1"));
    assert_eq!(
        kv_value(&state, "metrics:errors:validation:count").await.as_deref(),
        Some("1")
    );
    assert!(kv_value(&state, "metrics:last-error").await.is_some());
    assert_eq!(kv_value(&state, "metrics:visitors:unknown").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_metrics_json_report() {
    let (app, _state, _temp_db) = setup_test_app();
    app.clone().oneshot(get("/go/gh", None)).await.unwrap();

    let response = app
        .oneshot(get("/api/metrics", Some("api:metrics")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["result"]["redirects"]["gh"]["error"], 1);
    assert_eq!(body["result"]["totals"]["total"], 0);
}

#[tokio::test]
async fn test_metrics_yaml_and_prometheus() {
    let (app, state, _temp_db) = setup_test_app();
    state.kv.put("redirect:gh", "https://github.com/x").await.unwrap();
    app.clone().oneshot(get("/go/gh", None)).await.unwrap();

    let response = app
        .clone()
        .oneshot(get("/api/metrics?format=yaml", Some("api")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("application/yaml"));
    let text = String::from_utf8(body_bytes(response.into_body()).await).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
    assert_eq!(doc["ok"], serde_yaml::Value::Bool(true));
    assert_eq!(doc["result"]["redirects"]["gh"]["ok"], serde_yaml::Value::Number(1.into()));

    let response = app
        .oneshot(get("/api/metrics?format=prometheus", Some("api:metrics")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = String::from_utf8(body_bytes(response.into_body()).await).unwrap();
    assert!(text.contains("# TYPE site_redirects_total counter"));
    assert!(text.contains("site_redirects_total{outcome=\"ok\",slug=\"gh\"} 1"));
    assert!(text.contains("# TYPE site_redirect_last_hit_timestamp_milliseconds gauge"));
}

#[tokio::test]
async fn test_dashboard_summary() {
    let (app, state, _temp_db) = setup_test_app();
    state.kv.put("redirect:gh", "https://github.com/x").await.unwrap();
    for _ in 0..3 {
        app.clone().oneshot(get("/go/gh", None)).await.unwrap();
    }

    let response = app
        .oneshot(get("/api/dashboard", Some("dashboard:metrics")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    let top = &body["result"]["topRedirects"][0];
    assert_eq!(top["slug"], "gh");
    assert_eq!(top["hits"], 3);
}

#[tokio::test]
async fn test_kv_import_then_export() {
    let (app, state, _temp_db) = setup_test_app();
    let document = r#"
_anchors:
  counters: &counters
    ok: 0
    error: 0
redirect:
  gh: https://github.com/x
metrics:
  redirect:
    gh:
      <<: *counters
      ok: 7
"#;

    let response = app
        .clone()
        .oneshot(post("/api/admin/kv/import", "admin:kv", "application/yaml", document))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["result"]["written"], 3);
    assert_eq!(body["result"]["skipped"], 0);

    assert_eq!(kv_value(&state, "metrics:redirect:gh:ok").await.as_deref(), Some("7"));
    assert_eq!(kv_value(&state, "metrics:redirect:gh:error").await.as_deref(), Some("0"));
    assert!(state.kv.list("_anchors").await.unwrap().is_empty());

    let response = app
        .clone()
        .oneshot(get("/api/admin/kv/export?format=json", Some("admin:kv")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let exported = response_json(response.into_body()).await;
    assert_eq!(exported["redirect"]["gh"], "https://github.com/x");
    assert_eq!(exported["metrics"]["redirect"]["gh"]["ok"], 7);

    let response = app
        .oneshot(get("/api/admin/kv/export", Some("admin")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response.into_body()).await).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
    assert_eq!(
        doc["redirect"]["gh"],
        serde_yaml::Value::String("https://github.com/x".to_string())
    );
}

#[tokio::test]
async fn test_kv_export_applies_configured_patterns() {
    let (app, state, _temp_db) = setup_with_config(Config {
        kv_export_patterns: vec!["^redirect:".to_string()],
        ..test_config()
    });
    state.kv.put("redirect:gh", "https://github.com/x").await.unwrap();
    state.kv.put("metrics:ok", "5").await.unwrap();

    let response = app
        .oneshot(get("/api/admin/kv/export?format=json", Some("admin:kv")))
        .await
        .unwrap();

    let exported = response_json(response.into_body()).await;
    assert_eq!(exported["redirect"]["gh"], "https://github.com/x");
    assert!(exported.get("metrics").is_none());
}

#[tokio::test]
async fn test_kv_import_rejects_invalid_document() {
    let (app, _state, _temp_db) = setup_test_app();

    let response = app
        .oneshot(post(
            "/api/admin/kv/import",
            "admin:kv",
            "application/yaml",
            "tags: [a, b]",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_optimise_inline_result() {
    let (app, _state, _temp_db) = setup_test_app();
    let payload = json!({ "image": STANDARD.encode(sample_png(64, 48)), "quality": 70 });

    let response = app
        .oneshot(post(
            "/api/images/optimise",
            "api:images",
            "application/json",
            payload.to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    let result = &body["result"];
    assert_eq!(result["width"], 64);
    assert_eq!(result["height"], 48);
    assert_eq!(result["quality"], 70);
    assert_eq!(result["lossy"], true);
    assert!(result["compressionRatio"].as_f64().unwrap() > 0.0);
    assert!(result.get("url").is_none());

    let webp = STANDARD.decode(result["image"].as_str().unwrap()).unwrap();
    assert_eq!(&webp[..4], b"RIFF");
    assert_eq!(result["size"], webp.len());
}

#[tokio::test]
async fn test_optimise_store_and_serve() {
    let (app, _state, _temp_db) = setup_test_app();
    let payload = json!({ "image": STANDARD.encode(sample_png(32, 32)), "store": true });

    let response = app
        .clone()
        .oneshot(post(
            "/api/images/optimise",
            "api",
            "application/json",
            payload.to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    let url = body["result"]["url"].as_str().unwrap();
    assert!(url.starts_with("http://test.local/images/"));
    assert!(url.ends_with(".webp"));
    assert!(body["result"].get("image").is_none());

    let path = url.trim_start_matches("http://test.local");
    let response = app.oneshot(get(path, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/webp");
    let bytes = body_bytes(response.into_body()).await;
    assert_eq!(&bytes[..4], b"RIFF");
}

#[tokio::test]
async fn test_optimise_multipart_upload() {
    let (app, _state, _temp_db) = setup_test_app();
    let boundary = "XBOUNDARYX";
    let png = sample_png(16, 16);

    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"lossy\"\r\n\r\nfalse\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"a.png\"\r\n\
             Content-Type: image/png\r\n\r\n",
            b = boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(&png);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    let response = app
        .oneshot(post(
            "/api/images/optimise",
            "api:images",
            &format!("multipart/form-data; boundary={}", boundary),
            body,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["result"]["lossy"], false);
    assert!(body["result"]["quality"].is_null());
    assert_eq!(body["result"]["width"], 16);
}

#[tokio::test]
async fn test_optimise_rejects_non_image() {
    let (app, _state, _temp_db) = setup_test_app();
    let payload = json!({ "image": STANDARD.encode(b"definitely not an image") });

    let response = app
        .oneshot(post(
            "/api/images/optimise",
            "api:images",
            "application/json",
            payload.to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_oversized_image_is_rejected() {
    let (app, _state, _temp_db) = setup_with_config(Config {
        max_image_bytes: 1024,
        ..test_config()
    });
    let payload = json!({ "image": STANDARD.encode(vec![0u8; 2048]) });

    let response = app
        .oneshot(post(
            "/api/images/optimise",
            "api:images",
            "application/json",
            payload.to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_alt_text_from_base64_body() {
    let (app, _state, _temp_db) = setup_test_app();
    let body = format!("data:image/png;base64,{}", STANDARD.encode(sample_png(40, 30)));

    let response = app
        .oneshot(post("/api/ai/alt", "ai:alt", "text/plain", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["result"]["altText"], ALT_TEXT);
    assert_eq!(body["result"]["width"], 40);
    assert_eq!(body["result"]["height"], 30);
}

#[tokio::test]
async fn test_alt_text_target_unreachable() {
    // No WebP file fits in 16 bytes, and the frame cannot shrink below 1024 px
    let config = Config {
        alt_target_bytes: 16,
        ..test_config()
    };
    let (app, state, _temp_db) = setup_with_config(config);
    let body = STANDARD.encode(sample_png(1100, 200));

    let response = app
        .oneshot(post("/api/ai/alt", "ai:alt", "text/plain", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["status"], 422);
    assert_eq!(body["error"], "image cannot be reduced below the size budget");
    assert_eq!(
        kv_value(&state, "metrics:errors:target-unreachable:count").await.as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn test_alt_text_requires_url() {
    let (app, _state, _temp_db) = setup_test_app();

    let response = app
        .oneshot(get("/api/ai/alt", Some("ai:alt")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_image_is_not_found() {
    let (app, _state, _temp_db) = setup_test_app();

    let response = app
        .oneshot(get("/images/0-0000000000000000.webp", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
