//! Registry Service - team-scoped API tokens and gateway routes, mirrored to an edge cache.

pub mod authz;
pub mod config;
pub mod handlers;
pub mod models;
pub mod reconcile;
pub mod services;
pub mod startup;
