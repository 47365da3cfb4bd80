use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const SERVICE_INSTANCE_ID: &str = "service.instance.id";
const SERVICE_VERSION: &str = "service.version";

/// Where spans go and how this pool instance identifies itself in them.
#[derive(Clone, Debug)]
pub struct TracingOptions<'a> {
    pub service_name: &'a str,
    /// Same id the instance writes its usage ledger under.
    pub instance_id: &'a str,
    pub endpoint: Option<&'a str>,
    pub json_logs: bool,
}

/// Flushes and shuts down the tracer provider when dropped.
#[derive(Debug)]
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            eprintln!("otel shutdown failed: {err}");
        }
    }
}

fn pool_resource(options: &TracingOptions<'_>) -> Resource {
    Resource::builder_empty()
        .with_service_name(options.service_name.to_string())
        .with_attribute(KeyValue::new(
            SERVICE_INSTANCE_ID,
            options.instance_id.to_string(),
        ))
        .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
        .build()
}

/// Installs the global subscriber: env filter, fmt output and an OTLP/HTTP
/// span exporter. A blank endpoint falls back to the exporter's env defaults.
pub fn init_tracing(
    options: &TracingOptions<'_>,
) -> Result<OtelGuard, Box<dyn std::error::Error>> {
    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = options.endpoint.map(str::trim).filter(|v| !v.is_empty()) {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(pool_resource(options))
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(options.service_name.to_string());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if options.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::debug!(
        instance_id = options.instance_id,
        "otlp span export enabled"
    );
    Ok(OtelGuard { provider })
}
