//! API Regression Tests
//!
//! Drives the full router (ops routes, versioned routes, trace layer) with
//! `oneshot` requests against real reducer state.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use phasecast::api::{create_app, ApiState};
use phasecast::lifecycle::Readiness;
use phasecast::metrics::PipelineMetrics;
use phasecast::reducers::{SummaryBoard, SummaryReducer};
use phasecast::{CycleRecord, PhaseLabel, PhaseReading};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn record(device: &str, real_power: f64) -> CycleRecord {
    let reading = |phase| PhaseReading {
        phase,
        voltage_rms: 230.0,
        current_rms: real_power / 230.0,
        real_power,
        reactive_power: 0.0,
        power_factor: 1.0,
        frequency: 50.0,
        apparent_power: real_power,
        voltage_dc_offset: 0.0,
        current_dc_offset: 0.0,
    };
    CycleRecord {
        timestamp: Utc::now(),
        device_id: device.to_string(),
        sequence: 0,
        phases: [reading(PhaseLabel::A), reading(PhaseLabel::B), reading(PhaseLabel::C)],
    }
}

struct SummaryProcess {
    app: Router,
    readiness: Readiness,
    reducer: SummaryReducer,
    received: Arc<AtomicU64>,
}

fn summary_process() -> SummaryProcess {
    let metrics = Arc::new(PipelineMetrics::new("summary").unwrap());
    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    metrics
        .counter_fn("records_received_total", "Records decoded", move || {
            counter.load(Ordering::Relaxed)
        })
        .unwrap();

    let board = Arc::new(SummaryBoard::new());
    let reducer = SummaryReducer::new(Duration::from_secs(1), Arc::clone(&board))
        .with_gauges(metrics.summary_gauges().unwrap());
    let readiness = Readiness::new();
    let state = ApiState::new("summary", metrics, readiness.clone()).with_board(board);

    SummaryProcess {
        app: create_app(state),
        readiness,
        reducer,
        received,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_str(&body).unwrap())
}

#[tokio::test]
async fn health_reports_role_and_version() {
    let process = summary_process();
    let (status, body) = get_json(&process.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["role"], "summary");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn ready_flips_with_readiness() {
    let process = summary_process();
    let (status, body) = get_json(&process.app, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
    assert!(body.get("state").is_none());

    process.readiness.set_ready(true);
    let (status, body) = get_json(&process.app, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn summary_endpoints_follow_the_board() {
    let process = summary_process();

    let (status, body) = get_json(&process.app, "/api/v1/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Array(Vec::new()));

    process.reducer.observe(&record("feeder-2", 200.0));
    process.reducer.observe(&record("feeder-1", 100.0));
    process.reducer.observe(&record("feeder-1", 300.0));
    process.reducer.close_window(Utc::now());

    let (status, body) = get_json(&process.app, "/api/v1/summary").await;
    assert_eq!(status, StatusCode::OK);
    let devices: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["device_id"].as_str().unwrap())
        .collect();
    assert_eq!(devices, vec!["feeder-1", "feeder-2"]);

    let (status, body) = get_json(&process.app, "/api/v1/summary/feeder-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["samples"], 2);
    assert_eq!(body["mean_real_power"], 200.0);

    let (status, body) = get_json(&process.app, "/api/v1/summary/feeder-9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("feeder-9"));
}

#[tokio::test]
async fn metrics_expose_probes_and_summary_gauges() {
    let process = summary_process();
    process.received.store(3, Ordering::Relaxed);
    process.reducer.observe(&record("feeder-1", 120.0));
    process.reducer.close_window(Utc::now());

    let response = process
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains(r#"phasecast_records_received_total{role="summary"} 3"#), "{text}");
    let gauge = text
        .lines()
        .find(|l| l.starts_with("phasecast_summary_mean_real_power_watts{"))
        .unwrap();
    assert!(gauge.contains(r#"device="feeder-1""#));
    assert!(gauge.ends_with(" 120"));
}

#[tokio::test]
async fn process_without_board_has_no_summaries() {
    let metrics = Arc::new(PipelineMetrics::new("timeseries").unwrap());
    let app = create_app(ApiState::new("timeseries", metrics, Readiness::new()));
    let (status, _) = get(&app, "/api/v1/summary").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&app, "/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
