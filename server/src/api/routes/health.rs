//! Health check endpoint

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::api::ExpositionState;
use crate::core::pipeline::PipelineState;
use crate::domain::metrics::StatsSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub state: PipelineState,
    pub bus: &'static str,
    pub series: usize,
    pub stats: StatsSnapshot,
}

/// GET /health
///
/// 200 while the pipeline is running, 503 otherwise (starting or draining).
pub async fn health(State(state): State<ExpositionState>) -> impl IntoResponse {
    let pipeline = *state.pipeline_state.borrow();
    let (code, status) = if pipeline == PipelineState::Running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            state: pipeline,
            bus: state.bus_backend,
            series: state.aggregator.series_count(),
            stats: state.stats.snapshot(),
        }),
    )
}
