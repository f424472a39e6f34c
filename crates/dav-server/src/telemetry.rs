// SPDX-License-Identifier: AGPL-3.0-only
//! OpenTelemetry export of request spans.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    runtime::Tokio,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://jaeger:4317".
    pub otlp_endpoint: String,
    pub service_name: String,
    /// Whether the WebDAV listener terminates TLS; exported as a resource attribute.
    pub tls: bool,
}

impl TelemetryConfig {
    pub fn new(otlp_endpoint: String, service_name: String, tls: bool) -> Self {
        Self {
            otlp_endpoint,
            service_name,
            tls,
        }
    }

    fn resource_attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("service.name", self.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("dav.tls", self.tls),
        ]
    }
}

/// Install the OTLP exporter and return the layer to stack on the subscriber.
pub fn init_telemetry<S>(
    config: &TelemetryConfig,
) -> anyhow::Result<OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(config.resource_attributes()))
        .build();

    let tracer = provider.tracer("usg-dav");
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush pending spans.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
