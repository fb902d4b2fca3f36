//! Observability wiring for the binary.
//!
//! Every crate emits `tracing` spans and events; this module decides where
//! they go. Logs are written to stderr (JSON by default) so stdout carries
//! only the decision. When an OTLP endpoint is configured, spans are also
//! exported over gRPC.

use anyhow::Context;
use clap::ValueEnum;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::TracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log line format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable lines.
    Text,
}

/// Keeps the span exporter alive until shutdown.
pub struct Telemetry {
    provider: Option<TracerProvider>,
}

impl Telemetry {
    /// Installs the global subscriber. `RUST_LOG` filters events (default `info`).
    pub fn init(format: LogFormat, otlp_endpoint: Option<&str>) -> anyhow::Result<Self> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let provider = match otlp_endpoint {
            Some(endpoint) => {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .with_context(|| format!("building OTLP exporter for {endpoint}"))?;
                Some(
                    TracerProvider::builder()
                        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
                        .build(),
                )
            }
            None => None,
        };
        let otel = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("promotion-gate")));

        let (json, text) = match format {
            LogFormat::Json => (
                Some(fmt::layer().json().with_writer(std::io::stderr)),
                None,
            ),
            LogFormat::Text => (None, Some(fmt::layer().with_writer(std::io::stderr))),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .with(text)
            .with(otel)
            .try_init()
            .context("installing the tracing subscriber")?;
        Ok(Self { provider })
    }

    /// Flushes pending spans.
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
    }
}
