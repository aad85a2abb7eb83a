//! Global subscriber setup

use peerlink_telemetry::SpanCaptureLayer;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{Config, LogFormat, LoggingConfig, TelemetryConfig};
use crate::error::{NodeError, Result};

/// Keeps optional span exporters running; drop it after the node stops
#[derive(Default)]
pub struct LoggingGuard {
    #[cfg(feature = "otlp")]
    _otlp: Option<crate::otlp::OtlpGuard>,
}

/// Install the global subscriber: console output, the span capture layer
/// feeding the export pipeline if given, and the OTLP layer if configured
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &Config, capture: Option<SpanCaptureLayer>) -> Result<LoggingGuard> {
    install(build_subscriber(&config.logging, capture)?, &config.telemetry)
}

#[cfg(feature = "otlp")]
fn install<S>(subscriber: S, telemetry: &TelemetryConfig) -> Result<LoggingGuard>
where
    S: Subscriber + for<'a> LookupSpan<'a> + Send + Sync + 'static,
{
    let (otlp, guard) = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let (tracer, guard) = crate::otlp::tracer(endpoint, telemetry)?;
            let layer = tracing_opentelemetry::layer()
                .with_tracer(tracer)
                .with_filter(LevelFilter::INFO);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    subscriber
        .with(otlp)
        .try_init()
        .map_err(|e| NodeError::Logging(e.to_string()))?;
    Ok(LoggingGuard { _otlp: guard })
}

#[cfg(not(feature = "otlp"))]
fn install<S>(subscriber: S, telemetry: &TelemetryConfig) -> Result<LoggingGuard>
where
    S: Subscriber + Send + Sync + 'static,
{
    if telemetry.otlp_endpoint.is_some() {
        return Err(NodeError::Logging(
            "OTLP export requested but the otlp feature is disabled".into(),
        ));
    }
    subscriber
        .try_init()
        .map_err(|e| NodeError::Logging(e.to_string()))?;
    Ok(LoggingGuard::default())
}

/// Subscriber with per-layer filters
///
/// The log level (`RUST_LOG` first, then the configured level) only governs
/// console output. Span capture keeps every span at INFO and above, so a
/// quiet console does not starve the exporter.
pub fn build_subscriber(
    config: &LoggingConfig,
    capture: Option<SpanCaptureLayer>,
) -> Result<impl Subscriber + for<'a> LookupSpan<'a> + Send + Sync + 'static> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| NodeError::Logging(e.to_string()))?;

    let (plain, json) = match config.format {
        LogFormat::Plain => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_filter(env_filter),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_filter(env_filter),
            ),
        ),
    };

    Ok(tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(capture.map(|layer| layer.with_filter(LevelFilter::INFO))))
}
