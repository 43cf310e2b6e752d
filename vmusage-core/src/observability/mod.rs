//! Observability infrastructure: structured logging and metrics.
//!
//! Logging goes through `tracing` to stderr; `RUST_LOG` overrides the
//! configured level.
//! Metrics go through the `metrics` facade and are only exported when a
//! Prometheus port is configured. Without a recorder every metric call is a no-op.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize the global observability infrastructure.
///
/// Must be called once at process startup, before any service is created.
pub fn init(log_level: &str, metrics_port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .try_init()?;

    if let Some(port) = metrics_port {
        PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port)).install()?;
        metrics::register_core_metrics();
        tracing::info!(port, "Prometheus metrics exporter listening");
    }

    Ok(())
}
