//! HTTP handlers for registry-service.

pub mod auth;
pub mod health;
pub mod routes;
pub mod stats;
pub mod teams;
pub mod tokens;

pub use auth::Authenticated;
pub use health::{health_check, metrics_handler, readiness_check};
