//! Tracing and OpenTelemetry setup for farseer processes.
//!
//! Service loops, capture workers and operator commands each call
//! [`init_telemetry`] once. Every process prints to stderr. With an OTLP
//! endpoint it also exports traces, metrics and logs, tagged with a resource
//! that tells the processes apart: its [`ProcessRole`], its pid and, for a
//! capture worker, the stream it reads.

pub mod event;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::RequestId;

const TRACER: &str = "farseer-rs";

/// What kind of farseer process is reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessRole {
    /// A long-running service loop (or all of them).
    Service,
    /// A capture worker bound to one stream.
    CaptureWorker { request_uuid: RequestId },
    /// A one-shot operator command.
    Command,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Service => "service",
            ProcessRole::CaptureWorker { .. } => "capture_worker",
            ProcessRole::Command => "command",
        }
    }
}

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. `None` keeps output on stderr only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub log_level: String,
    pub role: ProcessRole,
}

impl TelemetryConfig {
    /// Telemetry settings of `config` for a process named `service_name`.
    pub fn from_config(
        config: &Config,
        service_name: impl Into<String>,
        role: ProcessRole,
    ) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.into(),
            log_level: config.log_level.clone(),
            role,
        }
    }

    /// Resource attributes besides `service.name`.
    pub fn resource_attributes(&self) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("process.pid", i64::from(std::process::id())),
            KeyValue::new("farseer.role", self.role.as_str()),
        ];
        if let ProcessRole::CaptureWorker { request_uuid } = &self.role {
            attributes.push(KeyValue::new("farseer.request_uuid", request_uuid.to_string()));
        }
        attributes
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(self.resource_attributes())
            .build()
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// Owns the OTel providers; flushes and shuts them down on drop.
///
/// Hold it for the lifetime of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl TelemetryGuard {
    /// Build the three OTLP pipelines and install the global meter provider.
    fn export_to(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;

        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build();
        opentelemetry::global::set_meter_provider(meter_provider.clone());

        Ok(Self {
            tracer_provider: Some(
                SdkTracerProvider::builder()
                    .with_batch_exporter(spans)
                    .with_resource(resource.clone())
                    .build(),
            ),
            meter_provider: Some(meter_provider),
            logger_provider: Some(
                SdkLoggerProvider::builder()
                    .with_batch_exporter(logs)
                    .with_resource(resource)
                    .build(),
            ),
        })
    }

    /// Is anything exported beyond stderr?
    pub fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }

    /// Push buffered spans, metrics and logs out now.
    pub fn force_flush(&self) {
        if let Some(provider) = &self.tracer_provider {
            let _ = provider.force_flush();
        }
        if let Some(provider) = &self.meter_provider {
            let _ = provider.force_flush();
        }
        if let Some(provider) = &self.logger_provider {
            let _ = provider.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.tracer_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Install the global subscriber for this process.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let guard = match &config.endpoint {
        Some(endpoint) => TelemetryGuard::export_to(endpoint, config.resource())?,
        None => TelemetryGuard::default(),
    };

    let otel_traces = guard
        .tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER)));
    let otel_logs = guard
        .logger_provider
        .as_ref()
        .map(|provider| OpenTelemetryTracingBridge::new(provider));

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(otel_traces)
        .with(otel_logs)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    tracing::debug!(
        service = %config.service_name,
        role = config.role.as_str(),
        exporting = guard.is_exporting(),
        "telemetry initialized"
    );
    Ok(guard)
}
