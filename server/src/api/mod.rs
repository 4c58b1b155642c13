//! Exposition API: scrape and health endpoints

pub mod routes;
mod server;

pub use server::{ExpositionServer, ExpositionState};
