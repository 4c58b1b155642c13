//! Data layer
//!
//! - `topics` - Message bus streams (in-memory and Redis)

pub mod topics;
