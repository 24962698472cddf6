//! Prometheus Metrics Module
//!
//! Exposes scheduling metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Requests**: Placed, sent and finished counts per scheduler category
//! - **Admission**: Time spent waiting on restriction classes
//! - **Sessions**: Live sessions, reconnects and venue timeouts
//! - **Queues**: Pending requests per scheduler category
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the existing handle.
///
/// # Errors
///
/// Returns [`BuildError`] if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Render the current metrics in Prometheus text format.
#[must_use]
pub fn render() -> String {
    get_metrics_handle().map(|h| h.render()).unwrap_or_default()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "pacing_gateway_requests_placed_total",
        "Requests accepted into a scheduler queue"
    );
    describe_counter!(
        "pacing_gateway_requests_sent_total",
        "Requests written to a venue session"
    );
    describe_counter!(
        "pacing_gateway_requests_finished_total",
        "Requests that reached a final status, by status"
    );
    describe_counter!(
        "pacing_gateway_venue_timeouts_total",
        "Requests timed out by deadline, pacing error or lost session"
    );
    describe_counter!(
        "pacing_gateway_session_reconnects_total",
        "Session reconnection attempts"
    );
    describe_counter!(
        "pacing_gateway_admission_waits_total",
        "Admission checks that had to wait on a restriction class"
    );

    describe_gauge!(
        "pacing_gateway_queue_depth",
        "Requests waiting in a scheduler queue"
    );
    describe_gauge!("pacing_gateway_live_sessions", "Pooled venue sessions");

    describe_histogram!(
        "pacing_gateway_admission_wait_seconds",
        "Time a request waited on a restriction class"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a request accepted by the scheduler for `category`.
pub fn record_request_placed(category: &'static str) {
    counter!("pacing_gateway_requests_placed_total", "category" => category).increment(1);
}

/// Record a request sent to the venue.
pub fn record_request_sent(category: &'static str) {
    counter!("pacing_gateway_requests_sent_total", "category" => category).increment(1);
}

/// Record a request reaching `status`.
pub fn record_request_finished(category: &'static str, status: &'static str) {
    counter!(
        "pacing_gateway_requests_finished_total",
        "category" => category,
        "status" => status
    )
    .increment(1);
}

/// Record a venue timeout attributed to `source` (a category or a role).
pub fn record_venue_timeout(source: &'static str) {
    counter!("pacing_gateway_venue_timeouts_total", "source" => source).increment(1);
}

/// Record a session reconnection attempt.
pub fn record_session_reconnect(role: &'static str) {
    counter!("pacing_gateway_session_reconnects_total", "role" => role).increment(1);
}

/// Record a wait imposed by restriction `class`.
pub fn record_admission_wait(class: &'static str, wait: Duration) {
    counter!("pacing_gateway_admission_waits_total", "class" => class).increment(1);
    histogram!("pacing_gateway_admission_wait_seconds", "class" => class).record(wait.as_secs_f64());
}

/// Update the queue depth of `category`.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(category: &'static str, depth: usize) {
    gauge!("pacing_gateway_queue_depth", "category" => category).set(depth as f64);
}

/// Update the number of pooled sessions.
#[allow(clippy::cast_precision_loss)]
pub fn set_live_sessions(count: usize) {
    gauge!("pacing_gateway_live_sessions").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_request_placed("historical");
        record_admission_wait("identical-high-freq", Duration::from_millis(5));
        set_queue_depth("historical", 3);
        set_live_sessions(1);
    }

    #[test]
    fn render_is_empty_before_init() {
        if get_metrics_handle().is_none() {
            assert!(render().is_empty());
        }
    }
}
