use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use tracing_subscriber::Layer as _;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use super::observability::{env_filter, fmt_layer};

pub const DEFAULT_SERVICE_NAME: &str = "guardrail-gateway";

/// Flushes and shuts down the tracer provider when the gateway exits.
#[derive(Debug)]
pub struct OtelGuard {
    provider: opentelemetry_sdk::trace::SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            eprintln!("otel shutdown failed: {err}");
        }
    }
}

/// Only this crate's spans (`gateway.request` and the events inside it) are
/// exported; HTTP client and server internals stay local.
fn is_gateway_target(target: &str) -> bool {
    target.starts_with(env!("CARGO_CRATE_NAME"))
}

/// Same subscriber as [`super::observability::init_tracing`] plus an OTLP/HTTP
/// span exporter. `endpoint` falls back to `OTEL_EXPORTER_OTLP_ENDPOINT`.
pub fn init_tracing(
    service_name: &str,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<OtelGuard, Box<dyn std::error::Error>> {
    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let service_name = if service_name.trim().is_empty() {
        DEFAULT_SERVICE_NAME
    } else {
        service_name
    };
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(service_name.to_string())
                .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(service_name.to_string());
    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_filter(filter_fn(|meta| is_gateway_target(meta.target())));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .with(otel_layer)
        .try_init()?;

    Ok(OtelGuard { provider })
}
