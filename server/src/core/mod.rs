//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod pipeline;
pub mod shutdown;

pub use crate::app::CoreApp;
pub use cli::CliConfig;
pub use config::{AggregationConfig, AppConfig, BusBackend, BusConfig, ServerConfig};
pub use pipeline::{Pipeline, PipelineError, PipelineState, RunningPipeline};
pub use shutdown::ShutdownService;
