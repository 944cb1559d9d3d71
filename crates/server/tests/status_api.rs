//! Status endpoint tests against an in-process router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use galadriel_core::{
    source::PollOutcome,
    testing::{fixtures, FixedMemoryMonitor, MockDataSource, MockSink},
    AdmissionConfig, AdmissionController, RunCoordinator,
};
use galadriel_server::api::create_router;
use galadriel_server::state::AppState;

struct TestResponse {
    status: StatusCode,
    body: String,
}

impl TestResponse {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("response is not JSON")
    }
}

async fn get(router: &Router, path: &str) -> TestResponse {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

async fn coordinator_with_results(count: u32) -> RunCoordinator {
    let source = MockDataSource::new();
    source.set_schedule(fixtures::day_schedule(count)).await;
    for n in 1..=count {
        source
            .script_polls(
                &format!("bel-{}", n),
                vec![Ok(PollOutcome::ResultsPosted(vec![]))],
            )
            .await;
    }
    RunCoordinator::new(
        fixtures::fast_config(),
        Arc::new(source),
        Arc::new(MockSink::new()),
        AdmissionController::new(
            AdmissionConfig::default(),
            Arc::new(FixedMemoryMonitor::new(25.0)),
        ),
    )
}

#[tokio::test]
async fn test_health_endpoint() {
    let coordinator = coordinator_with_results(1).await;
    let router = create_router(Arc::new(AppState::new(
        coordinator.status_handle(),
        "0123456789abcdef",
    )));

    let response = get(&router, "/api/v1/health").await;

    assert_eq!(response.status, StatusCode::OK);
    let json = response.json();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["config_hash"], "0123456789abcdef");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_status_before_run_starts() {
    let coordinator = coordinator_with_results(1).await;
    let router = create_router(Arc::new(AppState::new(coordinator.status_handle(), "hash")));

    let response = get(&router, "/api/v1/status").await;

    assert_eq!(response.status, StatusCode::OK);
    let json = response.json();
    assert_eq!(json["running"], false);
    assert_eq!(json["active_workers"], 0);
    assert!(json["run_id"].is_null());
    assert!(json["admission"].is_null());
}

#[tokio::test]
async fn test_status_after_run_reports_race_counts() {
    let coordinator = coordinator_with_results(2).await;
    let router = create_router(Arc::new(AppState::new(coordinator.status_handle(), "hash")));

    let summary = tokio::time::timeout(Duration::from_secs(10), coordinator.run())
        .await
        .expect("run did not finish")
        .unwrap();
    assert_eq!(summary.completed, 2);

    let json = get(&router, "/api/v1/status").await.json();
    assert_eq!(json["running"], false);
    assert_eq!(json["run_id"], summary.run_id.as_str());
    assert_eq!(json["races"]["completed"], 2);
    assert_eq!(json["races"]["upcoming"], 0);
    assert_eq!(json["admission"]["max_watch"], 12);
    assert_eq!(json["admission"]["active_preparation"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let coordinator = coordinator_with_results(1).await;
    let router = create_router(Arc::new(AppState::new(coordinator.status_handle(), "hash")));

    // Generate at least one labelled HTTP sample first.
    get(&router, "/api/v1/health").await;
    let response = get(&router, "/metrics").await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.contains("galadriel_run_active"));
    assert!(response.body.contains("galadriel_http_requests_total"));
    assert!(response.body.contains("/api/v1/health"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let coordinator = coordinator_with_results(1).await;
    let router = create_router(Arc::new(AppState::new(coordinator.status_handle(), "hash")));

    let response = get(&router, "/api/v1/races").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
