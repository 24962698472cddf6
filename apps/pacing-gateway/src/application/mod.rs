//! Application Layer - Scheduling services and port definitions.
//!
//! This layer drives domain requests through admission and onto venue
//! sessions, talking to the venue only through the ports.

/// Port interfaces for the venue transport.
pub mod ports;

/// Gateway, schedulers and session management.
pub mod services;
