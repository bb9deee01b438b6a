//! Tracing and OpenTelemetry initialisation.
//!
//! Call [`init_tracing`] once at process startup and hold the returned guard
//! until exit.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). Enables span export over OTLP/HTTP. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `WARDEN_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//!
//! ```rust,no_run
//! let _guard = warden_runtime::telemetry::init_tracing("warden");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FORMAT_VAR: &str = "WARDEN_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Install the global subscriber: env filter, console formatter and, when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set, the OpenTelemetry layer. A second
/// call leaves the first subscriber in place.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::from_env_value(std::env::var(LOG_FORMAT_VAR).ok().as_deref());

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("warden")));

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter)
        .try_init()
    {
        eprintln!("[warden] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

/// Shuts the OpenTelemetry provider down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[warden] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[warden] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // Simple exporter: the CLI initialises tracing before its Tokio runtime exists.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
