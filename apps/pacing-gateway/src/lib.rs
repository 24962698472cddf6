#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Pacing Gateway - Market Data Request Admission and Scheduling
//!
//! Client-side admission control in front of a rate-limited market data
//! venue. Requests are queued per category, admitted against every pacing
//! restriction they fall under, dispatched on pooled venue sessions and
//! recovered through timeout, retry and session recycling.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Requests and the rules that pace them
//!   - `request`: Parameters, lifecycle state machine, result rows
//!   - `restriction`: Restriction classes, policies, accounting
//!   - `splitter`: Historical range splitting and multi-request merge
//!
//! - **Application**: Scheduling services and port definitions
//!   - `ports`: Venue transport, connector and callback sink
//!   - `services`: Gateway, schedulers, sessions, session pool
//!
//! - **Infrastructure**: Adapters and process plumbing
//!   - `config`: Environment configuration
//!   - `simulated`: In-process venue
//!   - `http`: Health, metrics and request API
//!   - `metrics`, `telemetry`: Prometheus and tracing
//!
//! # Request Flow
//!
//! ```text
//! place() ──► Scheduler queue ──► admission ──► SessionPool ──► venue
//!                 ▲    (per category)  (RestrictionManager)        │
//!                 │                                                ▼
//!                 └──── retry on TIMED_OUT ◄──── Session callbacks ┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Requests, restrictions and range splitting.
pub mod domain;

/// Application layer - Scheduling services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::request::{
    DataRequest, Instrument, LifecycleError, Priority, RequestId, RequestKind, RequestParams,
    RequestStatus, Row, ValidationError,
};
pub use domain::restriction::{
    Admission, PolicyTable, RestrictionClass, RestrictionManager, RestrictionPolicy,
};
pub use domain::splitter::{MultiRequest, RangeSplitter, SplitError, TradingDayBoundary};

// Services
pub use application::services::{
    Gateway, GatewayError, GatewayOptions, GatewayStats, RequestHandle, SchedulerCategory,
    SchedulerConfig, SessionPoolConfig, SessionRole,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, GatewayConfig};

// HTTP server
pub use infrastructure::http::{AppState, HttpServer, HttpServerError};

// Simulated venue
pub use infrastructure::simulated::{SimulatedVenue, SimulatedVenueConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
