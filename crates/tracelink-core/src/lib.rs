//! Shared service plumbing for Tracelink services: configuration loading,
//! tracing setup, health endpoints and HTTP middleware.

pub mod config;
pub mod health;
pub mod middleware;
pub mod serde;
pub mod tracing;
