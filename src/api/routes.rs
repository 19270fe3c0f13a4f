//! API route definitions

use axum::{routing::get, Router};

use super::handlers::{self, ApiState};

/// Operational endpoints served by every process.
pub fn ops_routes(state: ApiState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::get_metrics))
        .route("/health", get(handlers::get_health))
        .route("/ready", get(handlers::get_ready))
        .with_state(state)
}

/// Versioned data endpoints.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/summary", get(handlers::list_summaries))
        .route("/summary/:device", get(handlers::get_summary))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Readiness;
    use crate::metrics::PipelineMetrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_state() -> ApiState {
        ApiState::new(
            "timeseries",
            Arc::new(PipelineMetrics::new("timeseries").unwrap()),
            Readiness::new(),
        )
    }

    #[tokio::test]
    async fn test_ops_routes_health() {
        let app = ops_routes(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_summary_without_board_is_404() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/summary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
