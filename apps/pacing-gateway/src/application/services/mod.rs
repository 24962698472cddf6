//! Application Services
//!
//! Services that drive requests from placement to completion.
//!
//! - `Gateway`: Caller-facing facade; builds and places `RequestHandle`s
//! - `Scheduler`: One worker per category, admitting and sending requests
//! - `SessionPool`: Allocates and reconnects venue sessions per role
//! - `Session`: One venue connection and its open requests
//! - `Backoff`: Exponential reconnect delays with jitter

pub mod gateway;
pub mod reconnect;
pub mod scheduler;
pub mod session;
pub mod session_pool;

pub use gateway::{Gateway, GatewayError, GatewayOptions, GatewayStats, HandleSummary, RequestHandle};
pub use reconnect::{Backoff, BackoffConfig, RetryExhausted, retry};
pub use scheduler::{QueueEntry, Scheduler, SchedulerCategory, SchedulerConfig, SchedulerStats};
pub use session::{HandshakeWait, Session, SessionError, SessionInfo, SessionRole};
pub use session_pool::{SessionPool, SessionPoolConfig};
