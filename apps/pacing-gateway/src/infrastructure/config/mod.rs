//! Configuration Module
//!
//! Environment-driven configuration for the gateway, the session pool and
//! the simulated venue.

mod settings;

pub use settings::{
    ConfigError, ENV_PREFIX, GatewayConfig, LIMIT_PREFIX, PacingSettings, SchedulerSettings,
    ServerSettings, SessionSettings, SplitterSettings, VenueSettings,
};
