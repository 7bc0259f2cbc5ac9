//! Router-level tests: real stores on temp files, no dispatcher.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use easel_core::{CancelRegistry, CatalogStore, EventBus, QueueStore, RegistryStore};
use easel_server::{build_app, AppState, Config};

fn test_config(tmp: &std::path::Path) -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_owned(),
        storage_dir: tmp.join("data"),
        output_dir: tmp.join("output"),
        model_root: None,
        log_level: "info".to_owned(),
        production: false,
        cors_allowed_origins: None,
        require_api_key: false,
        dispatch_idle_ms: 500,
        registry_refresh_secs: 5,
        poll_interval_ms: 1000,
        unknown_backend_grace_secs: 30,
    }
}

async fn state_with(config: Config) -> AppState {
    std::fs::create_dir_all(&config.storage_dir).unwrap();
    let bus = EventBus::new();
    let queue = QueueStore::open(&config.storage_dir.join("queue.db"), bus.clone())
        .await
        .unwrap();
    let registry = RegistryStore::open(&config.storage_dir.join("registry.db"))
        .await
        .unwrap();
    let credentials = registry.credentials();
    let catalog = CatalogStore::open(&config.storage_dir.join("catalog.db"))
        .await
        .unwrap();
    AppState {
        config: Arc::new(config),
        queue,
        registry,
        credentials,
        catalog,
        bus,
        cancels: CancelRegistry::new(),
        started_at: Instant::now(),
    }
}

async fn test_app() -> (Router, AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let state = state_with(test_config(tmp.path())).await;
    (build_app(state.clone()), state, tmp)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn register_backend(app: &Router, alias: &str) {
    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/backends",
            serde_json::json!({ "alias": alias, "base_url": "http://backend.local/" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
}

fn generate_body(backend: &str) -> serde_json::Value {
    serde_json::json!({
        "target_backend": backend,
        "generation_params": {
            "prompt": "a quiet harbour",
            "checkpoint_name": "m.safetensors",
            "steps": 4,
        },
    })
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state, _tmp) = test_app().await;
    let resp = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn openapi_document_is_served() {
    let (app, _state, _tmp) = test_app().await;
    let resp = app
        .oneshot(get_request("/api-docs/openapi.json"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert!(json["paths"]["/api/v1/generate"].is_object());
    assert!(json["paths"]["/api/v2/generate"].is_object());
}

#[tokio::test]
async fn generate_unknown_backend_is_uniform_404() {
    let (app, _state, _tmp) = test_app().await;
    let resp = app
        .oneshot(json_request("POST", "/api/v1/generate", generate_body("ghost")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let json = body_json(resp).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "backend_not_found");
    assert!(json["message"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn generate_requires_a_checkpoint_reference() {
    let (app, _state, _tmp) = test_app().await;
    register_backend(&app, "A").await;

    let resp = app
        .oneshot(json_request(
            "POST",
            "/api/v1/generate",
            serde_json::json!({
                "target_backend": "A",
                "generation_params": { "prompt": "no checkpoint" },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "missing_required_field");
}

#[tokio::test]
async fn legacy_sd_checkpoint_is_accepted() {
    let (app, state, _tmp) = test_app().await;
    register_backend(&app, "A").await;

    let resp = app
        .oneshot(json_request(
            "POST",
            "/api/v1/generate",
            serde_json::json!({
                "target_backend": "A",
                "generation_params": { "prompt": "x", "sd_checkpoint": "models\\m.safetensors" },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let json = body_json(resp).await;

    let job = state
        .queue
        .get(json["job_id"].as_str().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.generation_params["checkpoint_name"], "models/m.safetensors");
}

#[tokio::test]
async fn admitted_jobs_list_with_positions() {
    let (app, _state, _tmp) = test_app().await;
    register_backend(&app, "A").await;

    let first = body_json(
        app.clone()
            .oneshot(json_request("POST", "/api/v1/generate", generate_body("A")))
            .await
            .unwrap(),
    )
    .await;
    let second = body_json(
        app.clone()
            .oneshot(json_request("POST", "/api/v1/generate", generate_body("A")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(first["queue_position"], 1);
    assert_eq!(second["queue_position"], 2);

    let list = body_json(
        app.clone()
            .oneshot(get_request("/api/v1/jobs?status=pending&order=asc"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(list["total"], 2);
    assert_eq!(list["jobs"][0]["job_id"], first["job_id"]);

    let status_uri = format!("/api/v1/jobs/{}/status", second["job_id"].as_str().unwrap());
    let status = body_json(app.clone().oneshot(get_request(&status_uri)).await.unwrap()).await;
    assert_eq!(status["queue_position"], 2);
    assert_eq!(status["status"], "pending");
}

#[tokio::test]
async fn v2_reports_dialect_and_rejects_unknown_one() {
    let (app, _state, _tmp) = test_app().await;
    register_backend(&app, "A").await;

    let mut body = generate_body("A");
    body["app_type"] = "forge".into();
    body["source_info"] = "browser_extension".into();
    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/v2/generate", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let json = body_json(resp).await;
    assert_eq!(json["app_type"], "forge");
    assert_eq!(json["target_backend"], "A");

    let mut body = generate_body("A");
    body["app_type"] = "comfy".into();
    let resp = app
        .oneshot(json_request("POST", "/api/v2/generate", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_then_delete_round_trip() {
    let (app, _state, _tmp) = test_app().await;
    register_backend(&app, "A").await;

    let admitted = body_json(
        app.clone()
            .oneshot(json_request("POST", "/api/v1/generate", generate_body("A")))
            .await
            .unwrap(),
    )
    .await;
    let job_id = admitted["job_id"].as_str().unwrap().to_owned();

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/cancel"),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["job"]["status"], "cancelled");

    // Cancelling again is an invalid transition, uniformly shaped.
    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/cancel"),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "invalid_transition");
    assert_eq!(json["details"]["current_status"], "cancelled");

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/jobs/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(get_request(&format!("/api/v1/jobs/{job_id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn backend_crud_validates() {
    let (app, _state, _tmp) = test_app().await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/backends",
            serde_json::json!({ "base_url": "http://x/" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/backends",
            serde_json::json!({ "alias": "A", "base_url": "not-a-url" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    register_backend(&app, "A").await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/v1/backends/A",
            serde_json::json!({ "alias": "B", "base_url": "http://x/" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/v1/backends/A",
            serde_json::json!({ "base_url": "http://updated/", "auth_username": "u", "auth_password": "p" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["base_url"], "http://updated/");
    assert_eq!(json["has_auth"], true);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/backends/A")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/backends/A")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_key_gate_applies_to_api_routes_only() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.require_api_key = true;
    let state = state_with(config).await;
    let app = build_app(state.clone());

    // Health stays open.
    let resp = app.clone().oneshot(get_request("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.clone().oneshot(get_request("/api/v1/jobs")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "unauthorized");

    let (_cred, plaintext) = state.credentials.create(None, None).await.unwrap();
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs")
                .header("x-api-key", &plaintext)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs")
                .header("x-api-key", "easel_wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn scan_requires_model_root_then_ingests() {
    let tmp = tempfile::tempdir().unwrap();

    let state = state_with(test_config(tmp.path())).await;
    let app = build_app(state);
    let resp = app
        .oneshot(json_request("POST", "/api/v1/models/scan", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Now with a root holding one checkpoint and its sidecar.
    let root = tmp.path().join("models");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("m.safetensors"), b"bytes").unwrap();
    std::fs::write(
        root.join("m.json"),
        serde_json::json!({ "modelVersionId": 7, "modelId": 3, "AutoV2": "aabbccddee" }).to_string(),
    )
    .unwrap();

    let mut config = test_config(&tmp.path().join("second"));
    config.model_root = Some(root.clone());
    let state = state_with(config).await;
    let app = build_app(state);

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/models/scan", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["stats"]["files_seen"], 1);
    assert_eq!(json["stats"]["inserted"], 1);

    let list = body_json(app.oneshot(get_request("/api/v1/models")).await.unwrap()).await;
    assert_eq!(list["count"], 1);
    assert_eq!(list["models"][0]["version_id"], 7);
}
