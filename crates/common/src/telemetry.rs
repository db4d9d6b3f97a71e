use crate::Environment;
use crate::config::{env_millis_or, env_or};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::attribute::{SERVICE_NAME, SERVICE_VERSION};
use std::time::Duration;

/// Per-frame spans make always-on sampling far too chatty for a 30 fps loop.
const DEFAULT_SAMPLE_RATIO: f64 = 0.05;
const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_secs(10);

/// Export knobs read from the standard OTEL environment variables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportSettings {
    /// Fraction of root traces kept, `OTEL_TRACES_SAMPLER_ARG`
    pub sample_ratio: f64,
    /// Metric push period, `OTEL_METRIC_EXPORT_INTERVAL` in ms
    pub metric_interval: Duration,
}

impl ExportSettings {
    pub fn from_env() -> Self {
        Self {
            sample_ratio: env_or("OTEL_TRACES_SAMPLER_ARG", DEFAULT_SAMPLE_RATIO),
            metric_interval: env_millis_or("OTEL_METRIC_EXPORT_INTERVAL", DEFAULT_METRIC_INTERVAL),
        }
    }

    fn sampler(&self) -> Sampler {
        let root = if self.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_ratio)
        };
        Sampler::ParentBased(Box::new(root))
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            sample_ratio: DEFAULT_SAMPLE_RATIO,
            metric_interval: DEFAULT_METRIC_INTERVAL,
        }
    }
}

/// Owns the OTLP tracer and meter providers; flushes and shuts both down on
/// drop.
///
/// Installs the global subscriber itself, so a process calls this instead of
/// [`crate::setup_logging`], never both. The tonic exporters need a Tokio
/// runtime to be entered while this runs.
///
/// ```ignore
/// let _telemetry = TelemetryGuard::init("camera-service", "http://localhost:4317", Environment::Production)?;
/// ```
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    pub fn init(
        service_name: &str,
        endpoint: &str,
        environment: Environment,
    ) -> anyhow::Result<Self> {
        let settings = ExportSettings::from_env();
        global::set_text_map_propagator(TraceContextPropagator::new());

        let resource = Resource::builder()
            .with_attributes([
                KeyValue::new(SERVICE_NAME, service_name.to_string()),
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new("deployment.environment", environment.as_str()),
            ])
            .build();

        let tracer_provider = SdkTracerProvider::builder()
            .with_resource(resource.clone())
            .with_sampler(settings.sampler())
            .with_batch_exporter(
                opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()?,
            )
            .build();
        global::set_tracer_provider(tracer_provider.clone());

        let reader = PeriodicReader::builder(
            opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?,
        )
        .with_interval(settings.metric_interval)
        .build();
        let meter_provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();
        global::set_meter_provider(meter_provider.clone());

        crate::logging::init_subscriber(
            environment,
            tracing_opentelemetry::layer().with_tracer(global::tracer(service_name.to_string())),
        );

        tracing::info!(
            endpoint,
            sample_ratio = settings.sample_ratio,
            "OTLP export enabled"
        );

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown tracer provider: {:?}", e);
        }
        if let Err(e) = self.meter_provider.shutdown() {
            eprintln!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}

/// Creates an info-level span and enters it.
#[macro_export]
macro_rules! span {
    ($name:literal) => {
        tracing::info_span!($name).entered()
    };
}

/// Creates a debug-level span and enters it.
#[macro_export]
macro_rules! span_debug {
    ($name:literal) => {
        tracing::debug_span!($name).entered()
    };
}
