//! High-level API surfaces: the Messages API builder, model listing, and
//! raw Kiro payload passthrough.

pub mod messages;
pub mod models;
pub mod raw;
