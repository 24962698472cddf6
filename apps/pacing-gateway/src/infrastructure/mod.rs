//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// Configuration loaded from the environment.
pub mod config;

/// HTTP surface: health, metrics and the request API.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// In-process simulated venue.
pub mod simulated;

/// OpenTelemetry tracing integration.
pub mod telemetry;
