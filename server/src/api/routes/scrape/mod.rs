//! Scrape endpoint
//!
//! `GET /metrics` renders the current snapshot. The format follows the
//! `Accept` header: OTLP protobuf, OTLP JSON, or Prometheus text (default).

pub mod otlp;
pub mod text;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use prost::Message;

use crate::api::ExpositionState;

/// Response format negotiated from `Accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpositionFormat {
    Text,
    Protobuf,
    Json,
}

impl ExpositionFormat {
    /// Pick a format from request headers
    ///
    /// Anything other than an explicit OTLP media type gets the text format,
    /// including `*/*` and a missing header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        for media in accept.split(',') {
            let media = media.split(';').next().unwrap_or("").trim();
            match media {
                "application/x-protobuf" | "application/protobuf" => {
                    return ExpositionFormat::Protobuf;
                }
                "application/json" => return ExpositionFormat::Json,
                _ => {}
            }
        }
        ExpositionFormat::Text
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExpositionFormat::Text => text::CONTENT_TYPE,
            ExpositionFormat::Protobuf => "application/x-protobuf",
            ExpositionFormat::Json => "application/json",
        }
    }
}

/// GET /metrics
pub async fn scrape(State(state): State<ExpositionState>, headers: HeaderMap) -> Response {
    let format = ExpositionFormat::from_headers(&headers);
    let snapshot = state.aggregator.snapshot();
    tracing::trace!(series = snapshot.series_count(), ?format, "Scrape");

    let body = match format {
        ExpositionFormat::Text => {
            let self_metrics = text::SelfMetrics {
                stats: state.stats.snapshot(),
                series: snapshot.series_count(),
            };
            text::render(&snapshot, Some(&self_metrics)).into_bytes()
        }
        ExpositionFormat::Protobuf => otlp::encode(&snapshot).encode_to_vec(),
        ExpositionFormat::Json => match serde_json::to_vec(&otlp::encode(&snapshot)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode JSON exposition");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, format.content_type())],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_format_negotiation() {
        assert_eq!(ExpositionFormat::from_headers(&HeaderMap::new()), ExpositionFormat::Text);
        assert_eq!(ExpositionFormat::from_headers(&accept("*/*")), ExpositionFormat::Text);
        assert_eq!(
            ExpositionFormat::from_headers(&accept("text/plain;version=0.0.4")),
            ExpositionFormat::Text
        );
        assert_eq!(
            ExpositionFormat::from_headers(&accept("application/x-protobuf")),
            ExpositionFormat::Protobuf
        );
        assert_eq!(
            ExpositionFormat::from_headers(&accept("application/protobuf; q=0.9")),
            ExpositionFormat::Protobuf
        );
        assert_eq!(
            ExpositionFormat::from_headers(&accept("text/html, application/json")),
            ExpositionFormat::Json
        );
    }
}
