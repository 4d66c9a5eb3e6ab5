//! HTTP API tests driving the router in-process

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use serveml::deploy::dispatcher::ScriptedBuild;
use serveml::models::deployment::DeploymentStatus;
use serveml::server::serve::router;
use serveml::server::state::ServerState;
use tower::ServiceExt;

use crate::common::{harness, harness_with, Harness, HarnessOptions, PUBLIC_BASE_URL};

fn app(h: &Harness) -> Router {
    router(Arc::new(ServerState::new(h.orchestrator.clone())))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create(app: &Router, owner_id: &str, artifact_ref: &str) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        "/deployments",
        Some(json!({ "owner_id": owner_id, "artifact_ref": artifact_ref })),
        &[],
    )
    .await
}

#[tokio::test]
async fn test_health() {
    let h = harness().await;
    let (status, body) = send(&app(&h), "GET", "/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "serveml");

    let (status, body) = send(&app(&h), "GET", "/version", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].is_string());
    h.stop().await;
}

#[tokio::test]
async fn test_create_then_read() {
    let h = harness().await;
    let app = app(&h);
    let artifact = h.sklearn_artifact("iris.pkl").await;

    let (status, body) = send(
        &app,
        "POST",
        "/deployments",
        Some(json!({
            "owner_id": "user-1",
            "artifact_ref": artifact,
            "name": "iris classifier",
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["name"], "iris classifier");
    assert_eq!(body["version"], 0);
    assert!(body["endpoint_ref"].is_null());
    let id = body["id"].as_str().unwrap().to_string();

    h.wait_status(&id, DeploymentStatus::Active).await;
    let (status, body) = send(&app, "GET", &format!("/deployments/{}", id), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["framework"], "sklearn");
    assert_eq!(body["version"], 1);
    assert_eq!(
        body["endpoint_ref"],
        format!("{}/predict/{}", PUBLIC_BASE_URL, id)
    );
    h.stop().await;
}

#[tokio::test]
async fn test_error_kinds() {
    let h = harness_with(HarnessOptions {
        max_deployments_per_owner: 1,
        ..Default::default()
    })
    .await;
    let app = app(&h);

    let (status, body) = create(&app, "user-1", "sha256:missing").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "InvalidArtifact");

    let (status, body) = send(&app, "GET", "/deployments/dep-missing", None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "NotFound");

    let artifact = h.sklearn_artifact("iris.pkl").await;
    let (status, _) = create(&app, "user-1", &artifact).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, body) = create(&app, "user-1", &artifact).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["kind"], "QuotaExceeded");

    let (status, _) = send(
        &app,
        "POST",
        "/deployments",
        Some(json!({ "artifact_ref": artifact })),
        &[],
    )
    .await;
    assert!(status.is_client_error());
    h.stop().await;
}

#[tokio::test]
async fn test_idempotency_header() {
    let h = harness().await;
    let app = app(&h);
    let artifact = h.sklearn_artifact("iris.pkl").await;
    let other = h.sklearn_artifact("wine.pkl").await;

    let (status, first) = send(
        &app,
        "POST",
        "/deployments",
        Some(json!({
            "owner_id": "user-1",
            "artifact_ref": artifact,
            "idempotency_key": "ignored-body-key",
        })),
        &[("Idempotency-Key", "upload-1")],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, second) = send(
        &app,
        "POST",
        "/deployments",
        Some(json!({ "owner_id": "user-1", "artifact_ref": artifact })),
        &[("Idempotency-Key", "upload-1")],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["id"], second["id"]);

    let (status, body) = send(
        &app,
        "POST",
        "/deployments",
        Some(json!({ "owner_id": "user-1", "artifact_ref": other })),
        &[("Idempotency-Key", "upload-1")],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "IdempotencyConflict");
    h.stop().await;
}

#[tokio::test]
async fn test_list_filters() {
    let h = harness().await;
    let app = app(&h);
    let artifact = h.sklearn_artifact("iris.pkl").await;
    let (_, first) = create(&app, "user-1", &artifact).await;
    create(&app, "user-1", &artifact).await;
    create(&app, "user-2", &artifact).await;

    let first_id = first["id"].as_str().unwrap().to_string();
    h.wait_status(&first_id, DeploymentStatus::Active).await;
    send(&app, "DELETE", &format!("/deployments/{}", first_id), None, &[]).await;

    let (status, body) = send(&app, "GET", "/deployments?owner_id=user-1", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (_, body) = send(
        &app,
        "GET",
        "/deployments?owner_id=user-1&status=deleted",
        None,
        &[],
    )
    .await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["deployments"][0]["id"], first_id.as_str());

    // total counts every match, not just the page
    let (_, body) = send(&app, "GET", "/deployments?owner_id=user-1&limit=1", None, &[]).await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["deployments"].as_array().unwrap().len(), 1);

    let (_, body) = send(&app, "GET", "/deployments?limit=2&offset=2", None, &[]).await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["deployments"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app, "GET", "/deployments?status=sleeping", None, &[]).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "InvalidRequest");
    h.stop().await;
}

#[tokio::test]
async fn test_delete_and_redeploy() {
    let h = harness().await;
    let app = app(&h);
    let artifact = h.sklearn_artifact("iris.pkl").await;
    let (_, created) = create(&app, "user-1", &artifact).await;
    let id = created["id"].as_str().unwrap().to_string();
    h.wait_status(&id, DeploymentStatus::Active).await;

    let next = h.sklearn_artifact("iris-v2.pkl").await;
    let (status, body) = send(
        &app,
        "POST",
        &format!("/deployments/{}/redeploy", id),
        Some(json!({ "artifact_ref": next })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "validating");
    h.wait_for(&id, |r| r.status == DeploymentStatus::Active && r.version == 2)
        .await;

    let (status, body) = send(&app, "DELETE", &format!("/deployments/{}", id), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deleted");
    assert!(body["endpoint_ref"].is_null());

    let (status, body) = send(
        &app,
        "POST",
        &format!("/deployments/{}/redeploy", id),
        Some(json!({ "artifact_ref": next })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "InvalidTransition");
    h.stop().await;
}

#[tokio::test]
async fn test_build_callback() {
    let mut h = harness_with(HarnessOptions {
        run_executor: false,
        ..Default::default()
    })
    .await;
    let app = app(&h);
    h.backend.push(ScriptedBuild::Defer);
    let artifact = h.sklearn_artifact("iris.pkl").await;
    let (_, created) = create(&app, "user-1", &artifact).await;
    let id = created["id"].as_str().unwrap().to_string();
    h.drain_commands().await;

    let (status, body) = send(
        &app,
        "POST",
        "/callbacks/builds",
        Some(json!({
            "deployment_id": id,
            "attempt_number": 1,
            "outcome": "success",
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "InvalidRequest");

    let callback = json!({
        "deployment_id": id,
        "attempt_number": 1,
        "outcome": "success",
        "image_ref": "registry.test/models:callback",
    });
    let (status, body) = send(&app, "POST", "/callbacks/builds", Some(callback.clone()), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);

    let (_, body) = send(&app, "POST", "/callbacks/builds", Some(callback), &[]).await;
    assert_eq!(body["applied"], false);

    h.drain_commands().await;
    let (_, body) = send(&app, "GET", &format!("/deployments/{}", id), None, &[]).await;
    assert_eq!(body["status"], "active");

    let unknown = json!({
        "deployment_id": "dep-missing",
        "attempt_number": 1,
        "outcome": "success",
        "image_ref": "registry.test/models:callback",
    });
    let (status, _) = send(&app, "POST", "/callbacks/builds", Some(unknown), &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
