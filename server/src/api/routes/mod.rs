//! HTTP routes

pub mod health;
pub mod scrape;

use axum::Router;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::api::ExpositionState;

/// Build the exposition router
pub fn router(state: ExpositionState) -> Router {
    Router::new()
        .route("/metrics", get(scrape::scrape))
        .route("/health", get(health::health))
        .fallback(handle_404)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_404(req: Request) -> impl IntoResponse {
    tracing::debug!(method = %req.method(), uri = %req.uri(), "404 Not Found");
    (StatusCode::NOT_FOUND, "Not Found")
}
