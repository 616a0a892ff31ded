//! HTTP surface: the liveness endpoint.

pub mod health;

pub use health::{start_liveness_server, LivenessState};
