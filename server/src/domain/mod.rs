//! Domain logic
//!
//! - `metrics` - OTLP metrics decoding, aggregation and the bus consumer loop

pub mod metrics;
