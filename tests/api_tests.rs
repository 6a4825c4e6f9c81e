//! HTTP API tests.
//!
//! Requests go straight into the router with `oneshot`, backed by a real
//! job manager and simulated master.

mod test_harness;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use jobmgr_lite::api::http::router;
use test_harness::TestJobManager;

fn app(jm: &TestJobManager) -> Router {
    router(jm.api().clone())
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(jm: &TestJobManager, instances: u32) -> String {
    let (status, body) = send(
        app(jm),
        "POST",
        "/api/jobs",
        Some(json!({
            "name": "web",
            "instance_count": instances,
            "command": "serve --port 8080",
            "resources": { "cpus": 0.5, "memory_mb": 256 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let jm = TestJobManager::start().await;
    let (status, body) = send(app(&jm), "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    jm.shutdown().await;
}

#[tokio::test]
async fn test_create_get_and_list() {
    let jm = TestJobManager::start().await;
    let job_id = create(&jm, 2).await;

    let (status, body) = send(app(&jm), "GET", &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], job_id.as_str());
    assert_eq!(body["goal_state"], "RUNNING");
    assert_eq!(body["spec"]["resources"]["memory_mb"], 256);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 2);

    let (status, body) = send(app(&jm), "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["name"], "web");
    assert_eq!(jobs[0]["instance_count"], 2);

    jm.shutdown().await;
}

#[tokio::test]
async fn test_invalid_spec_is_bad_request() {
    let jm = TestJobManager::start().await;
    let (status, body) = send(
        app(&jm),
        "POST",
        "/api/jobs",
        Some(json!({ "name": "web", "instance_count": 0, "command": "serve" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("instance"));
    jm.shutdown().await;
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let jm = TestJobManager::start().await;
    let missing = uuid::Uuid::new_v4();

    for (method, uri) in [
        ("GET", format!("/api/jobs/{}", missing)),
        ("POST", format!("/api/jobs/{}/stop", missing)),
        ("POST", format!("/api/jobs/{}/start", missing)),
        ("DELETE", format!("/api/jobs/{}", missing)),
    ] {
        let (status, _) = send(app(&jm), method, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
    }

    jm.shutdown().await;
}

#[tokio::test]
async fn test_stop_wait_and_delete() {
    let jm = TestJobManager::start().await;
    let job_id = create(&jm, 2).await;

    let (status, body) = send(
        app(&jm),
        "POST",
        &format!("/api/jobs/{}/wait", job_id),
        Some(json!({ "goal_state": "RUNNING", "timeout_ms": 10000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["converged"], true);
    assert_eq!(body["state_counts"]["RUNNING"], 2);

    // Live tasks block deletion
    let (status, _) = send(app(&jm), "DELETE", &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(app(&jm), "POST", &format!("/api/jobs/{}/stop", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["goal_state"], "KILLED");

    let (status, body) = send(
        app(&jm),
        "POST",
        &format!("/api/jobs/{}/wait", job_id),
        Some(json!({ "goal_state": "KILLED", "timeout_ms": 10000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state_counts"]["KILLED"], 2);

    let (status, _) = send(app(&jm), "DELETE", &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    jm.shutdown().await;
}

#[tokio::test]
async fn test_wait_timeout_is_request_timeout() {
    let jm = TestJobManager::start().await;
    jm.master.stop();
    let job_id = create(&jm, 1).await;

    let (status, body) = send(
        app(&jm),
        "POST",
        &format!("/api/jobs/{}/wait", job_id),
        Some(json!({ "goal_state": "RUNNING", "timeout_ms": 100 })),
    )
    .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert!(body["error"].as_str().unwrap().contains("Timed out"));

    jm.shutdown().await;
}
