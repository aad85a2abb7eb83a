//! OTLP/gRPC span export through `tracing-opentelemetry`
//!
//! Runs next to the in-process export pipeline: spans reach the collector
//! straight from the subscriber, the configured sink still gets its batches.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{self, RandomIdGenerator, Tracer, TracerProvider},
    Resource,
};
use peerlink_telemetry::Sampler;

use crate::config::TelemetryConfig;
use crate::error::{NodeError, Result};

/// Flushes and shuts the tracer provider down on drop
pub struct OtlpGuard {
    provider: TracerProvider,
}

impl Drop for OtlpGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTLP tracer shutdown failed: {:?}", e);
        }
    }
}

fn otel_sampler(sampler: &Sampler) -> trace::Sampler {
    match sampler {
        Sampler::AlwaysOn => trace::Sampler::AlwaysOn,
        Sampler::AlwaysOff => trace::Sampler::AlwaysOff,
        Sampler::Ratio(ratio) => trace::Sampler::TraceIdRatioBased(*ratio),
    }
}

/// Batch-exporting tracer for `endpoint`
///
/// Must be called inside a tokio runtime.
pub fn tracer(endpoint: &str, config: &TelemetryConfig) -> Result<(Tracer, OtlpGuard)> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            trace::Config::default()
                .with_sampler(otel_sampler(&config.sampler))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", config.service_name.clone()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| NodeError::Logging(e.to_string()))?;

    let tracer = provider.tracer(config.service_name.clone());
    Ok((tracer, OtlpGuard { provider }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SamplingDecision, SpanKind, TraceId};
    use opentelemetry_sdk::trace::ShouldSample;

    fn decision(sampler: &Sampler, trace_id: u128) -> SamplingDecision {
        otel_sampler(sampler)
            .should_sample(
                None,
                TraceId::from_u128(trace_id),
                "ping",
                &SpanKind::Internal,
                &[],
                &[],
            )
            .decision
    }

    #[test]
    fn test_sampler_mapping() {
        assert_eq!(decision(&Sampler::AlwaysOn, 1), SamplingDecision::RecordAndSample);
        assert_eq!(decision(&Sampler::AlwaysOff, 1), SamplingDecision::Drop);
        assert_eq!(decision(&Sampler::Ratio(0.0), 1), SamplingDecision::Drop);
        assert_eq!(decision(&Sampler::Ratio(1.0), 1), SamplingDecision::RecordAndSample);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tracer_builds_without_collector() {
        let config = TelemetryConfig::default();
        let (_tracer, guard) = tracer("http://127.0.0.1:4317", &config).unwrap();
        drop(guard);
    }
}
