//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! // Basic structured logging only
//! mitigate_observe::tracing_setup::init_tracing(false).unwrap();
//!
//! // Verbose JSON logs, as `mitigate serve -v --log-json` does
//! use mitigate_observe::tracing_setup::{TracingOptions, init_tracing_with};
//! init_tracing_with(&TracingOptions {
//!     default_filter: "info,mitigate=debug".to_string(),
//!     json: true,
//!     ..Default::default()
//! })
//! .unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Bridge spans to OpenTelemetry (stdout exporter).
    pub enable_otel: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            enable_otel: false,
            default_filter: "warn".to_string(),
            json: false,
        }
    }
}

/// Initialize the global tracing subscriber with default options.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_with(&TracingOptions {
        enable_otel,
        ..Default::default()
    })
}

/// Initialize the global tracing subscriber.
///
/// - Always installs a structured `fmt` layer writing to stderr, so stdout
///   stays free for command output.
/// - When `enable_otel` is true, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter (suitable for local development;
///   swap the exporter for OTLP in production).
/// - Respects `RUST_LOG`; falls back to `default_filter`.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set or if
/// the filter directive is invalid.
pub fn init_tracing_with(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = env_filter(&options.default_filter)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    let fmt_layer = if options.json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    let otel_layer = if options.enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("mitigate");

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// `RUST_LOG` when set, otherwise `default_filter`.
fn env_filter(default_filter: &str) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => Ok(EnvFilter::new(directives)),
        _ => Ok(EnvFilter::try_new(default_filter)?),
    }
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Call this before process exit to ensure all buffered spans are exported.
/// Safe to call even when OTel was not enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
