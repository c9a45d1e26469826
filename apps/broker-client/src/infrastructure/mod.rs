//! Infrastructure Layer - Adapters and process plumbing.
//!
//! Concrete transport implementations plus the ambient pieces the binary
//! wires up: configuration, tracing, metrics and the health endpoint.

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// In-memory broker gateway.
pub mod paper;

/// OpenTelemetry tracing integration.
pub mod telemetry;
