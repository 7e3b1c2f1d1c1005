#![deny(missing_docs)]

//! Core library for the piiscan detection server.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Detection orchestration engine.
pub mod detection;
/// Detector port and backend implementations.
pub mod detectors;
/// Structured logging and tracing setup.
pub mod logging;
/// Scan metrics helpers.
pub mod metrics;
/// Per-request policy, on-disk defaults, and the policy store adapter.
pub mod policy;
