use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::instance::InstanceId;

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured level. Logs go to stderr
/// so command output on stdout stays clean.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    }

    tracing::info!("Seqflow telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking the log lines of one tick
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering a single tick of one instance
pub fn create_tick_span(workflow: &str, instance_id: InstanceId, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "tick",
        workflow.name = workflow,
        instance.id = %instance_id,
        correlation.id = correlation_id,
    )
}

/// Span covering one scheduler sweep across instances
pub fn create_sweep_span(correlation_id: &str) -> tracing::Span {
    tracing::info_span!("sweep", correlation.id = correlation_id)
}
