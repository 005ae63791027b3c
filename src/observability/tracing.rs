use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "info";

/// Span export settings read from the standard `OTEL_*` variables.
#[derive(Debug, Clone, PartialEq)]
struct ExportSettings {
    endpoint: Option<String>,
    sampling_ratio: f64,
}

impl ExportSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        // Out-of-range ratios are clamped; unparsable ones sample everything.
        let sampling_ratio = lookup("OTEL_SAMPLING_RATIO")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|ratio| ratio.is_finite())
            .map_or(1.0, |ratio| ratio.clamp(0.0, 1.0));

        Self {
            endpoint,
            sampling_ratio,
        }
    }
}

/// Installs the process-wide subscriber: JSON logs filtered by `RUST_LOG` (default `info`), plus
/// OTLP span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// Repeated calls are no-ops. A broken exporter degrades to logs only.
///
/// # Errors
/// Returns an error when another global subscriber was installed first.
pub fn init(service_name: &'static str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| install(service_name))?;
    Ok(())
}

fn install(service_name: &'static str) -> Result<()> {
    let settings = ExportSettings::from_lookup(|name| std::env::var(name).ok());

    let (tracer, export_error) = match settings.endpoint.as_deref() {
        Some(endpoint) => match otlp_tracer(endpoint, settings.sampling_ratio, service_name) {
            Ok(tracer) => (Some(tracer), None),
            Err(error) => (None, Some(error)),
        },
        None => (None, None),
    };
    let otel_enabled = tracer.is_some();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_target(false).json())
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .try_init()
        .map_err(|e| anyhow!("global tracing subscriber already set: {e}"))?;

    if let Some(error) = export_error {
        warn!(error = %format!("{error:#}"), "OTLP export disabled; logging only");
    }
    info!(
        service = service_name,
        otel_enabled,
        sampling_ratio = settings.sampling_ratio,
        "tracing initialized"
    );
    Ok(())
}

fn otlp_tracer(endpoint: &str, sampling_ratio: f64, service_name: &'static str) -> Result<SdkTracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("failed to build OTLP span exporter for {endpoint}"))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(
            Resource::builder()
                .with_attributes([
                    KeyValue::new("service.name", service_name),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])
                .build(),
        )
        .build();

    let tracer = provider.tracer(service_name);
    global::set_tracer_provider(provider);
    Ok(tracer)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> ExportSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ExportSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn export_disabled_without_endpoint() {
        let s = settings(&[]);
        assert_eq!(s.endpoint, None);
        assert!((s.sampling_ratio - 1.0).abs() < f64::EPSILON);

        assert_eq!(settings(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "  ")]).endpoint, None);
    }

    #[test]
    fn sampling_ratio_is_clamped_and_defaulted() {
        let ratio = |raw: &str| settings(&[("OTEL_SAMPLING_RATIO", raw)]).sampling_ratio;

        assert!((ratio("0.25") - 0.25).abs() < f64::EPSILON);
        assert!((ratio("7") - 1.0).abs() < f64::EPSILON);
        assert!(ratio("-1").abs() < f64::EPSILON);
        assert!((ratio("often") - 1.0).abs() < f64::EPSILON);
        assert!((ratio("NaN") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn endpoint_is_trimmed() {
        let s = settings(&[("OTEL_EXPORTER_OTLP_ENDPOINT", " http://collector:4317 ")]);
        assert_eq!(s.endpoint.as_deref(), Some("http://collector:4317"));
    }
}
