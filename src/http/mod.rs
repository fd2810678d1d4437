//! HTTP layer: the axum router serving the Bazel remote-cache protocol,
//! health checks and metrics.

pub mod handler;
