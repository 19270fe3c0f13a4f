//! HTTP surface using Axum
//!
//! Every process serves the same operational endpoints; the summary
//! process additionally serves the latest window statistics:
//! - `/metrics` - Prometheus text exposition
//! - `/health` - liveness
//! - `/ready` - 503 until the process can do its job
//! - `/api/v1/summary`, `/api/v1/summary/:device` - latest summary stats

pub mod handlers;
mod routes;

pub use handlers::ApiState;

use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the complete application router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .merge(routes::ops_routes(state.clone()))
        .nest("/api/v1", routes::api_routes(state))
        .layer(TraceLayer::new_for_http())
}
