//! Logging and OpenTelemetry setup for tlcp clients
//!
//! Every tlcp component logs through `tracing` with structured fields
//! (`session_id`, `phase`, `phase_count`, `conn`, `req_id`, `code`). This
//! module installs a subscriber for those events and, when asked, wires an
//! OTLP exporter for spans and metrics so that session lifecycles can be
//! followed in a collector.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tlcp_core::ObservabilityConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ObservabilityConfig::new("quotes-feed")
//!         .with_log_level("tlcp_client=debug,info")
//!         .with_otlp_endpoint("http://localhost:4317");
//!
//!     tlcp_core::init_observability(config).expect("observability");
//!
//!     // ... run the client ...
//!
//!     tlcp_core::shutdown_observability();
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG` overrides the configured filter when set.
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` provides the default collector endpoint.

use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Providers kept alive until [`shutdown_observability`] flushes them
static PROVIDERS: Mutex<Option<Providers>> = Mutex::new(None);

struct Providers {
    tracer: Option<SdkTracerProvider>,
    meter: Option<SdkMeterProvider>,
}

/// Configuration for logging and telemetry export
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Reported as `service.name`
    pub service_name: String,

    /// Reported as `service.version`
    pub service_version: String,

    /// OTLP collector endpoint (gRPC)
    pub otlp_endpoint: String,

    /// Export spans over OTLP
    pub enable_traces: bool,

    /// Export client metrics over OTLP
    pub enable_metrics: bool,

    /// Emit log lines as JSON instead of the compact text format
    pub json_logs: bool,

    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "tlcp".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_traces: false,
            enable_metrics: false,
            json_logs: false,
            log_level: "info".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Create a configuration for `service_name` with logging only
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Turn on OTLP export of traces and metrics to `endpoint`
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self.enable_traces = true;
        self.enable_metrics = true;
        self
    }

    /// Set the fallback filter directive
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the reported service version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    /// Enable or disable span export
    pub fn with_traces(mut self, enable: bool) -> Self {
        self.enable_traces = enable;
        self
    }

    /// Enable or disable metric export
    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }

    /// Emit JSON log lines
    pub fn with_json_logs(mut self, enable: bool) -> Self {
        self.json_logs = enable;
        self
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes(vec![
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    self.service_name.clone(),
                ),
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                    self.service_version.clone(),
                ),
            ])
            .build()
    }
}

/// Install the global subscriber and, if enabled, the OTLP providers
///
/// Fails if a global subscriber is already installed.
pub fn init_observability(config: ObservabilityConfig) -> Result<(), BoxError> {
    let tracer_provider = if config.enable_traces {
        Some(build_tracer_provider(&config)?)
    } else {
        None
    };

    let meter_provider = if config.enable_metrics {
        let provider = build_meter_provider(&config)?;
        global::set_meter_provider(provider.clone());
        Some(provider)
    } else {
        None
    };

    install_subscriber(&config, tracer_provider.as_ref())?;

    if let Some(provider) = &tracer_provider {
        global::set_tracer_provider(provider.clone());
    }

    if let Ok(mut slot) = PROVIDERS.lock() {
        *slot = Some(Providers {
            tracer: tracer_provider,
            meter: meter_provider,
        });
    }

    tracing::info!(
        service_name = %config.service_name,
        traces = config.enable_traces,
        metrics = config.enable_metrics,
        "tlcp observability initialized"
    );

    Ok(())
}

fn build_tracer_provider(config: &ObservabilityConfig) -> Result<SdkTracerProvider, BoxError> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler};

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(config.resource())
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .build())
}

fn build_meter_provider(config: &ObservabilityConfig) -> Result<SdkMeterProvider, BoxError> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(30))
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(config.resource())
        .build())
}

fn install_subscriber(
    config: &ObservabilityConfig,
    tracer_provider: Option<&SdkTracerProvider>,
) -> Result<(), BoxError> {
    use opentelemetry::trace::TracerProvider as _;

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let otel_layer = tracer_provider.map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    let (json_layer, text_layer) = if config.json_logs {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .json(),
            ),
            None,
        )
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true).compact()))
    };

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;

    Ok(())
}

/// Flush and drop the OTLP providers installed by [`init_observability`]
///
/// Safe to call more than once.
pub fn shutdown_observability() {
    let providers = PROVIDERS.lock().ok().and_then(|mut slot| slot.take());
    let Some(providers) = providers else {
        return;
    };
    if let Some(tracer) = providers.tracer {
        if let Err(e) = tracer.shutdown() {
            tracing::warn!(error = %e, "tracer provider shutdown failed");
        }
    }
    if let Some(meter) = providers.meter {
        if let Err(e) = meter.shutdown() {
            tracing::warn!(error = %e, "meter provider shutdown failed");
        }
    }
}
