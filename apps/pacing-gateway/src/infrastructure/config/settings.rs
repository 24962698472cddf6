//! Gateway Configuration Settings
//!
//! Configuration types for the pacing gateway, loaded from environment
//! variables. Every value is optional; unparsable numbers fall back to the
//! default while malformed policies, time zones and times are errors.

use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::application::services::{
    BackoffConfig, GatewayOptions, HandshakeWait, SchedulerConfig, SessionPoolConfig,
};
use crate::domain::restriction::{PolicyTable, RestrictionClass, RestrictionPolicy};
use crate::domain::splitter::{RangeSplitter, TradingDayBoundary};
use crate::infrastructure::simulated::SimulatedVenueConfig;

/// Prefix shared by every gateway variable.
pub const ENV_PREFIX: &str = "PACER_";

/// Prefix of per-class policy overrides, e.g. `PACER_LIMIT_SIMULTANEOUS_HISTORICAL=3`.
pub const LIMIT_PREFIX: &str = "PACER_LIMIT_";

// =============================================================================
// Settings
// =============================================================================

/// Venue endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueSettings {
    /// Venue host.
    pub host: String,
    /// Port for market data sessions.
    pub market_data_port: u16,
    /// Port for historical sessions.
    pub historical_port: u16,
    /// Port for reference sessions.
    pub reference_port: u16,
    /// Response latency of the simulated venue.
    pub simulated_latency: Duration,
    /// Interval between streamed rows on the simulated venue.
    pub simulated_stream_interval: Duration,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            market_data_port: 4002,
            historical_port: 4002,
            reference_port: 4002,
            simulated_latency: Duration::from_millis(25),
            simulated_stream_interval: Duration::from_millis(500),
        }
    }
}

/// Session establishment and reconnect settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Client identity probes before giving up.
    pub max_connect_attempts: u32,
    /// Wait for the handshake identifier per probe.
    pub handshake_timeout: Duration,
    /// Poll interval while waiting for the handshake.
    pub handshake_poll: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            max_connect_attempts: 10,
            handshake_timeout: Duration::from_secs(2),
            handshake_poll: Duration::from_millis(20),
            reconnect_delay_initial: backoff.initial_delay,
            reconnect_delay_max: backoff.max_delay,
            reconnect_delay_multiplier: backoff.multiplier,
            max_reconnect_attempts: backoff.max_attempts,
        }
    }
}

/// Scheduler worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Poll interval while a concurrency ceiling is full.
    pub ceiling_poll: Duration,
    /// Poll interval while awaiting a bounded request.
    pub completion_poll: Duration,
    /// Per-attempt wait for a terminal callback.
    pub request_timeout: Duration,
    /// Consecutive timeouts before the session is recycled.
    pub reconnect_threshold: u32,
    /// Sends per request before failing it (0 = unlimited).
    pub max_attempts: u32,
    /// Queue length at which producers wait (0 = unbounded).
    pub queue_capacity: usize,
    /// Idle worker wait before re-checking for shutdown.
    pub queue_wait_slice: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let config = SchedulerConfig::default();
        Self {
            ceiling_poll: config.ceiling_poll,
            completion_poll: config.completion_poll,
            request_timeout: config.request_timeout,
            reconnect_threshold: config.reconnect_threshold,
            max_attempts: config.max_attempts,
            queue_capacity: config.queue_capacity.unwrap_or(0),
            queue_wait_slice: config.queue_wait_slice,
        }
    }
}

/// Restriction policy overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacingSettings {
    /// Effective policy per class.
    pub policies: PolicyTable,
}

/// Historical range splitting settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterSettings {
    /// Trading-day boundary time zone.
    pub time_zone: Tz,
    /// Trading-day boundary local time.
    pub boundary: NaiveTime,
}

impl Default for SplitterSettings {
    fn default() -> Self {
        let boundary = TradingDayBoundary::default();
        Self {
            time_zone: boundary.tz(),
            boundary: boundary.time(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health, metrics and request API port.
    pub http_port: u16,
    /// Handles the request API keeps addressable.
    pub max_tracked_requests: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8083,
            max_tracked_requests: 10_000,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    /// Venue endpoints.
    pub venue: VenueSettings,
    /// Session management.
    pub sessions: SessionSettings,
    /// Scheduler workers.
    pub scheduler: SchedulerSettings,
    /// Restriction policies.
    pub pacing: PacingSettings,
    /// Range splitting.
    pub splitter: SplitterSettings,
    /// HTTP server.
    pub server: ServerSettings,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Time zone name not in the IANA database.
    #[error("invalid time zone in {key}: {value:?}")]
    InvalidTimeZone {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// Time of day not in `HH:MM` or `HH:MM:SS` form.
    #[error("invalid time of day in {key}: {value:?}")]
    InvalidTime {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// Restriction policy not in `N` or `N/SECS` form.
    #[error("invalid restriction policy in {key}: {value:?}")]
    InvalidPolicy {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

// =============================================================================
// Loading
// =============================================================================

/// Variable lookup; `std::env::var` in production, a map in tests.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed policies, time zones or times.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed policies, time zones or times.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let venue_defaults = VenueSettings::default();
        let venue = VenueSettings {
            host: lookup("PACER_VENUE_HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(venue_defaults.host),
            market_data_port: parse_u16(lookup, "PACER_MARKET_DATA_PORT", venue_defaults.market_data_port),
            historical_port: parse_u16(lookup, "PACER_HISTORICAL_PORT", venue_defaults.historical_port),
            reference_port: parse_u16(lookup, "PACER_REFERENCE_PORT", venue_defaults.reference_port),
            simulated_latency: parse_millis(lookup, "PACER_SIM_LATENCY_MS", venue_defaults.simulated_latency),
            simulated_stream_interval: parse_millis(
                lookup,
                "PACER_SIM_STREAM_INTERVAL_MS",
                venue_defaults.simulated_stream_interval,
            ),
        };

        let session_defaults = SessionSettings::default();
        let sessions = SessionSettings {
            max_connect_attempts: parse_u32(
                lookup,
                "PACER_MAX_CONNECT_ATTEMPTS",
                session_defaults.max_connect_attempts,
            ),
            handshake_timeout: parse_millis(lookup, "PACER_HANDSHAKE_TIMEOUT_MS", session_defaults.handshake_timeout),
            handshake_poll: parse_millis(lookup, "PACER_HANDSHAKE_POLL_MS", session_defaults.handshake_poll),
            reconnect_delay_initial: parse_millis(
                lookup,
                "PACER_RECONNECT_DELAY_INITIAL_MS",
                session_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_millis(
                lookup,
                "PACER_RECONNECT_DELAY_MAX_MS",
                session_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_f64(
                lookup,
                "PACER_RECONNECT_DELAY_MULTIPLIER",
                session_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_u32(
                lookup,
                "PACER_MAX_RECONNECT_ATTEMPTS",
                session_defaults.max_reconnect_attempts,
            ),
        };

        let scheduler_defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            ceiling_poll: parse_millis(lookup, "PACER_CEILING_POLL_MS", scheduler_defaults.ceiling_poll),
            completion_poll: parse_millis(lookup, "PACER_COMPLETION_POLL_MS", scheduler_defaults.completion_poll),
            request_timeout: parse_secs(lookup, "PACER_REQUEST_TIMEOUT_SECS", scheduler_defaults.request_timeout),
            reconnect_threshold: parse_u32(
                lookup,
                "PACER_RECONNECT_THRESHOLD",
                scheduler_defaults.reconnect_threshold,
            ),
            max_attempts: parse_u32(lookup, "PACER_MAX_ATTEMPTS", scheduler_defaults.max_attempts),
            queue_capacity: parse_usize(lookup, "PACER_QUEUE_CAPACITY", scheduler_defaults.queue_capacity),
            queue_wait_slice: parse_millis(lookup, "PACER_QUEUE_WAIT_SLICE_MS", scheduler_defaults.queue_wait_slice),
        };

        let pacing = PacingSettings {
            policies: parse_policies(lookup)?,
        };

        let splitter_defaults = SplitterSettings::default();
        let splitter = SplitterSettings {
            time_zone: match lookup("PACER_TRADING_DAY_TZ") {
                Some(value) => value.trim().parse::<Tz>().map_err(|_| ConfigError::InvalidTimeZone {
                    key: "PACER_TRADING_DAY_TZ".to_string(),
                    value,
                })?,
                None => splitter_defaults.time_zone,
            },
            boundary: match lookup("PACER_TRADING_DAY_BOUNDARY") {
                Some(value) => parse_time_of_day(&value).ok_or_else(|| ConfigError::InvalidTime {
                    key: "PACER_TRADING_DAY_BOUNDARY".to_string(),
                    value,
                })?,
                None => splitter_defaults.boundary,
            },
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            http_port: parse_u16(lookup, "PACER_HTTP_PORT", server_defaults.http_port),
            max_tracked_requests: parse_usize(
                lookup,
                "PACER_HTTP_MAX_TRACKED",
                server_defaults.max_tracked_requests,
            )
            .max(1),
        };

        Ok(Self {
            venue,
            sessions,
            scheduler,
            pacing,
            splitter,
            server,
        })
    }

    /// Scheduler worker configuration.
    #[must_use]
    pub const fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            ceiling_poll: s.ceiling_poll,
            completion_poll: s.completion_poll,
            request_timeout: s.request_timeout,
            reconnect_threshold: s.reconnect_threshold,
            max_attempts: s.max_attempts,
            queue_capacity: if s.queue_capacity == 0 {
                None
            } else {
                Some(s.queue_capacity)
            },
            queue_wait_slice: s.queue_wait_slice,
        }
    }

    /// Session pool configuration.
    #[must_use]
    pub fn session_pool_config(&self) -> SessionPoolConfig {
        SessionPoolConfig {
            host: self.venue.host.clone(),
            market_data_port: self.venue.market_data_port,
            historical_port: self.venue.historical_port,
            reference_port: self.venue.reference_port,
            max_connect_attempts: self.sessions.max_connect_attempts,
            handshake: HandshakeWait {
                timeout: self.sessions.handshake_timeout,
                poll: self.sessions.handshake_poll,
            },
            backoff: BackoffConfig {
                initial_delay: self.sessions.reconnect_delay_initial,
                max_delay: self.sessions.reconnect_delay_max,
                multiplier: self.sessions.reconnect_delay_multiplier,
                max_attempts: self.sessions.max_reconnect_attempts,
                ..BackoffConfig::default()
            },
        }
    }

    /// Range splitter on the configured trading-day boundary.
    #[must_use]
    pub const fn range_splitter(&self) -> RangeSplitter {
        RangeSplitter::new(TradingDayBoundary::new(
            self.splitter.time_zone,
            self.splitter.boundary,
        ))
    }

    /// Simulated venue behaviour.
    #[must_use]
    pub fn simulated_venue_config(&self) -> SimulatedVenueConfig {
        SimulatedVenueConfig {
            latency: self.venue.simulated_latency,
            stream_interval: self.venue.simulated_stream_interval,
            ..SimulatedVenueConfig::default()
        }
    }

    /// Everything the gateway needs.
    #[must_use]
    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            policies: self.pacing.policies.clone(),
            splitter: self.range_splitter(),
            scheduler: self.scheduler_config(),
            sessions: self.session_pool_config(),
        }
    }
}

fn parse_policies(lookup: Lookup<'_>) -> Result<PolicyTable, ConfigError> {
    let mut table = PolicyTable::default();
    for class in RestrictionClass::ALL {
        let key = format!("{LIMIT_PREFIX}{}", class.env_suffix());
        if let Some(value) = lookup(&key) {
            let policy = RestrictionPolicy::from_str(&value)
                .map_err(|_| ConfigError::InvalidPolicy { key, value })?;
            table = table.with(class, policy);
        }
    }
    Ok(table)
}

fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn parse_u16(lookup: Lookup<'_>, key: &str, default: u16) -> u16 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_u32(lookup: Lookup<'_>, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_usize(lookup: Lookup<'_>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_f64(lookup: Lookup<'_>, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_secs(lookup: Lookup<'_>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_millis(lookup: Lookup<'_>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
