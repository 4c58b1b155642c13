//! Metrics exporter
//!
//! Consumes OTLP metric batches from a message bus, aggregates them per
//! series and serves the result for Prometheus-style scraping.

pub mod api;
mod app;
pub mod core;
pub mod data;
pub mod domain;
pub mod utils;
