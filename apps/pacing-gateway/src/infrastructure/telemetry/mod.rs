//! Logging and Span Export
//!
//! Installs the `tracing` subscriber for the gateway: a filter built from
//! `RUST_LOG` plus per-module defaults, a fmt layer that shows worker thread
//! names (one per scheduler category), and an OTLP span exporter when
//! enabled.
//!
//! Default levels keep scheduling and session decisions at `info` and the
//! simulated venue quiet at `warn`; any target named in `RUST_LOG` keeps the
//! level given there.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Filter directives, merged over the defaults
//! - `OTEL_ENABLED`: Set to "true" to export spans (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: Service name for spans (default: pacing-gateway)
//! - `PACER_ENVIRONMENT`: `deployment.environment` resource attribute (default: simulated)

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SERVICE_NAME: &str = "pacing-gateway";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
const DEFAULT_ENVIRONMENT: &str = "simulated";
const SERVICE_NAMESPACE: &str = "market-data";

/// Per-target levels applied unless `RUST_LOG` names the target.
pub const DEFAULT_DIRECTIVES: &[&str] = &[
    "pacing_gateway=info",
    "pacing_gateway::application::services::scheduler=info",
    "pacing_gateway::application::services::session_pool=info",
    "pacing_gateway::infrastructure::simulated=warn",
    "axum=info",
    "hyper=warn",
    "h2=warn",
    "tonic=warn",
];

/// Flushes exported spans when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Span exporter did not shut down cleanly: {e}");
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Whether spans are exported over OTLP.
    pub enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// `service.name` resource attribute.
    pub service_name: String,
    /// `deployment.environment` resource attribute.
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            enabled: lookup("OTEL_ENABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otlp_endpoint),
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            environment: lookup("PACER_ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Resource attributes attached to every exported span.
    #[must_use]
    pub fn resource_attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("service.name", self.service_name.clone()),
            KeyValue::new("service.namespace", SERVICE_NAMESPACE),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", self.environment.clone()),
        ]
    }
}

/// `RUST_LOG` directives followed by every default whose target it does
/// not mention.
#[must_use]
pub fn filter_directives(rust_log: Option<&str>) -> Vec<String> {
    let explicit: Vec<String> = rust_log
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();
    let named = |target: &str| {
        explicit
            .iter()
            .any(|d| d.split('=').next().is_some_and(|t| t.trim() == target))
    };

    let mut directives = explicit.clone();
    directives.extend(
        DEFAULT_DIRECTIVES
            .iter()
            .filter(|d| d.split('=').next().is_some_and(|t| !named(t)))
            .map(|d| (*d).to_string()),
    );
    directives
}

fn env_filter() -> EnvFilter {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = filter_directives(rust_log.as_deref()).join(",");
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Ignoring unparsable RUST_LOG ({e}), using defaults");
        EnvFilter::new(DEFAULT_DIRECTIVES.join(","))
    })
}

/// Install the subscriber from the process environment.
///
/// Keep the guard alive until shutdown.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Install the subscriber with explicit settings.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false);

    let exporter = if config.enabled {
        opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otlp_endpoint)
            .build()
            .map_err(|e| eprintln!("OTLP exporter unavailable, logging only: {e}"))
            .ok()
    } else {
        None
    };

    let Some(otlp_exporter) = exporter else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .init();
        return TelemetryGuard {
            tracer_provider: None,
        };
    };

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            Resource::builder()
                .with_attributes(config.resource_attributes())
                .build(),
        )
        .build();
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(config.service_name));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_apply_without_rust_log() {
        let directives = filter_directives(None);
        assert_eq!(directives, DEFAULT_DIRECTIVES.iter().map(|d| (*d).to_string()).collect::<Vec<_>>());
        assert!(EnvFilter::try_new(directives.join(",")).is_ok());
    }

    #[test]
    fn rust_log_overrides_matching_targets_only() {
        let directives = filter_directives(Some("pacing_gateway::infrastructure::simulated=trace, debug"));
        assert_eq!(directives[0], "pacing_gateway::infrastructure::simulated=trace");
        assert_eq!(directives[1], "debug");
        assert!(!directives.contains(&"pacing_gateway::infrastructure::simulated=warn".to_string()));
        assert!(directives.contains(&"pacing_gateway::application::services::scheduler=info".to_string()));
        assert!(directives.contains(&"hyper=warn".to_string()));
    }

    #[test]
    fn config_reads_environment_and_attributes() {
        let vars: HashMap<&str, &str> = [("OTEL_ENABLED", "TRUE"), ("PACER_ENVIRONMENT", "paper")].into();
        let config = TelemetryConfig::from_lookup(&|key| vars.get(key).map(|v| (*v).to_string()));
        assert!(config.enabled);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);

        let attributes: HashMap<String, String> = config
            .resource_attributes()
            .into_iter()
            .map(|kv| (kv.key.to_string(), kv.value.to_string()))
            .collect();
        assert_eq!(attributes["deployment.environment"], "paper");
        assert_eq!(attributes["service.namespace"], SERVICE_NAMESPACE);
        assert_eq!(attributes["service.version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn guard_without_provider_drops_cleanly() {
        drop(TelemetryGuard {
            tracer_provider: None,
        });
    }
}
