//! Utility functions for the application

pub mod otlp;
pub mod retry;
pub mod time;
