//! API route handlers

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::lifecycle::Readiness;
use crate::metrics::PipelineMetrics;
use crate::publisher::PublisherStatus;
use crate::reducers::SummaryBoard;

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Process role (`publish`, `timeseries`, `summary`)
    pub role: &'static str,
    pub metrics: Arc<PipelineMetrics>,
    pub readiness: Readiness,
    /// Summary board, only in the summary process
    pub board: Option<Arc<SummaryBoard>>,
    /// Publisher view, only in the publish process
    pub publisher: Option<PublisherStatus>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(role: &'static str, metrics: Arc<PipelineMetrics>, readiness: Readiness) -> Self {
        Self {
            role,
            metrics,
            readiness,
            board: None,
            publisher: None,
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_board(mut self, board: Arc<SummaryBoard>) -> Self {
        self.board = Some(board);
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: PublisherStatus) -> Self {
        self.publisher = Some(publisher);
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn not_found(message: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

// ============================================================================
// Operational
// ============================================================================

/// GET /metrics
pub async fn get_metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Metrics rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub role: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// GET /health
pub async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        role: state.role,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub role: &'static str,
    /// Publisher only: `grace` or `emitting`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<usize>,
}

/// GET /ready
pub async fn get_ready(State(state): State<ApiState>) -> (StatusCode, Json<ReadyResponse>) {
    let ready = state.readiness.is_ready();
    let (publisher_state, subscribers) = match &state.publisher {
        Some(publisher) => (
            Some(if publisher.is_emitting() { "emitting" } else { "grace" }),
            Some(publisher.subscribers()),
        ),
        None => (None, None),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready,
            role: state.role,
            state: publisher_state,
            subscribers,
        }),
    )
}

// ============================================================================
// Summary
// ============================================================================

/// GET /api/v1/summary - latest stat for every device
pub async fn list_summaries(State(state): State<ApiState>) -> Response {
    match &state.board {
        Some(board) => Json(board.list()).into_response(),
        None => not_found(format!("no summaries in the {} process", state.role)),
    }
}

/// GET /api/v1/summary/:device
pub async fn get_summary(State(state): State<ApiState>, Path(device): Path<String>) -> Response {
    let Some(board) = &state.board else {
        return not_found(format!("no summaries in the {} process", state.role));
    };
    match board.get(&device) {
        Some(stat) => Json(stat).into_response(),
        None => not_found(format!("no summary for device '{device}'")),
    }
}
