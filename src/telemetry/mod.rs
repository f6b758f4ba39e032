//! Telemetry bootstrap for the engine process.
//!
//! Without an OTLP endpoint only a fmt layer is installed. With one, spans
//! from ingestion and batch jobs, the `mastery.*` instruments and every log
//! record are exported over gRPC under a resource naming this engine
//! instance.

pub mod metrics;
pub mod spans;

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Instrumentation scope for engine spans; matches the meter name.
pub const SCOPE: &str = "mastery-engine";

/// The exporters' own transport logs would otherwise loop back into the
/// OTLP log pipeline they are serving.
const QUIET_TARGETS: &[&str] = &[
    "h2=warn",
    "hyper=warn",
    "tonic=warn",
    "tower=warn",
    "opentelemetry=warn",
    "sqlx::query=warn",
];

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317". `None` means
    /// local fmt output only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Reported as `deployment.environment.name`.
    pub environment: Option<String>,
    /// Push interval for the metric reader.
    pub metric_interval: Duration,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config, service_name: &str) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: config.log_level.clone(),
            environment: config.environment.clone(),
            metric_interval: Duration::from_secs(15),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let directives: Vec<&str> = std::iter::once(self.log_level.as_str())
                .chain(QUIET_TARGETS.iter().copied())
                .collect();
            EnvFilter::new(directives.join(","))
        })
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
            KeyValue::new("service.namespace", "mastery"),
            KeyValue::new("service.instance.id", uuid::Uuid::new_v4().to_string()),
        ];
        if let Some(ref environment) = self.environment {
            attributes.push(KeyValue::new(
                "deployment.environment.name",
                environment.clone(),
            ));
        }
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(attributes)
            .build()
    }
}

/// The three OTLP providers, built against one endpoint and resource.
struct Pipelines {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Pipelines {
    fn build(endpoint: &str, config: &TelemetryConfig) -> Result<Self> {
        let resource = config.resource();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let reader = PeriodicReader::builder(metrics)
            .with_interval(config.metric_interval)
            .build();
        let meter = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource.clone())
            .build();

        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;
        let logger = SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build();

        Ok(Self {
            tracer,
            meter,
            logger,
        })
    }
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}

/// Keeps the OTLP pipelines alive. Dropping it flushes and shuts them down,
/// logs first so records about the shutdown itself still go out.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    /// Whether signals leave the process.
    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }

    /// Push everything buffered so far. A no-op without an endpoint.
    pub fn force_flush(&self) -> Result<()> {
        let Some(ref p) = self.pipelines else {
            return Ok(());
        };
        p.tracer
            .force_flush()
            .map_err(|e| Error::Other(format!("trace flush failed: {e}")))?;
        p.meter
            .force_flush()
            .map_err(|e| Error::Other(format!("metric flush failed: {e}")))?;
        p.logger
            .force_flush()
            .map_err(|e| Error::Other(format!("log flush failed: {e}")))?;
        Ok(())
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.pipelines.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global subscriber (and, with an endpoint, the global meter
/// provider). Hold the returned guard for the life of the process.
///
/// # Errors
///
/// Fails if an exporter can't be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = config.env_filter();

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { pipelines: None });
    };

    let pipelines = Pipelines::build(endpoint, &config)?;
    opentelemetry::global::set_meter_provider(pipelines.meter.clone());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(pipelines.tracer.tracer(SCOPE)))
        .with(OpenTelemetryTracingBridge::new(&pipelines.logger))
        .try_init()
        .map_err(subscriber_error)?;

    tracing::info!(
        endpoint,
        service = %config.service_name,
        interval_ms = config.metric_interval.as_millis() as u64,
        "exporting telemetry over OTLP"
    );
    Ok(TelemetryGuard {
        pipelines: Some(pipelines),
    })
}
