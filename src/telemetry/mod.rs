// Module: Telemetry
// Logging setup for the runner: a compact console layer always, plus an
// OTLP span pipeline when the CLI asks for a collector.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The two knobs the CLI varies. Everything else (service name, sampling)
/// comes from the standard OTEL environment variables.
pub struct TelemetryOptions {
    pub log_level: Level,
    pub otlp_endpoint: Option<String>,
}

/// Installs the global subscriber. RUST_LOG wins over the CLI level when set.
pub fn init(options: &TelemetryOptions) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.to_string()));
    match &options.otlp_endpoint {
        Some(endpoint) => {
            let tracer = otlp_tracer(endpoint)?;
            let console = tracing_subscriber::fmt::layer().compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(OpenTelemetryLayer::new(tracer))
                .with(console)
                .try_init()?;
            tracing::info!(endpoint = %endpoint, "exporting spans over otlp");
        }
        None => {
            let console = tracing_subscriber::fmt::layer().compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()?;
        }
    }
    Ok(())
}

fn otlp_tracer(endpoint: &str) -> anyhow::Result<sdktrace::Tracer> {
    let service_name = std::env::var("OTEL_SERVICE_NAME")
        .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string());
    let ratio = parse_ratio(std::env::var("OTEL_TRACES_SAMPLER_ARG").ok());
    let sampler = if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else {
        Sampler::TraceIdRatioBased(ratio)
    };
    let provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.clone(),
                )])),
        )
        .build();
    let tracer = provider.tracer(service_name);
    global::set_tracer_provider(provider);
    Ok(tracer)
}

fn parse_ratio(raw: Option<String>) -> f64 {
    raw.and_then(|v| v.parse::<f64>().ok())
        .map(|r| r.clamp(0.0, 1.0))
        .unwrap_or(1.0)
}

/// Flushes batched spans; must run before process exit or they are lost.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_ratio_samples_everything() {
        assert_eq!(parse_ratio(None), 1.0);
    }

    #[test]
    fn ratio_parses_and_clamps() {
        assert_eq!(parse_ratio(Some("0.25".to_string())), 0.25);
        assert_eq!(parse_ratio(Some("7.5".to_string())), 1.0);
        assert_eq!(parse_ratio(Some("-1".to_string())), 0.0);
    }

    #[test]
    fn garbage_ratio_falls_back_to_full_sampling() {
        assert_eq!(parse_ratio(Some("often".to_string())), 1.0);
    }
}
