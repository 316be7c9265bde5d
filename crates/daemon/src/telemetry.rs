// Tracing subscriber and optional OTLP export

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const SERVICE_NAME: &str = "harvesterd";

/// Logging and trace export settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP gRPC collector; no spans are exported when unset
    pub otlp_endpoint: Option<String>,
    /// Value of the `deployment.environment` resource attribute
    pub deployment: Option<String>,
    /// `EnvFilter` directives for console output
    pub filter: String,
}

impl TelemetryConfig {
    /// Read `OTEL_SERVICE_NAME`, `OTEL_EXPORTER_OTLP_ENDPOINT`,
    /// `OTEL_ENVIRONMENT`, then `RUST_LOG` or `LOG_LEVEL` for the filter
    pub fn from_env() -> Self {
        let filter = match (std::env::var("RUST_LOG"), std::env::var("LOG_LEVEL")) {
            (Ok(directives), _) => directives,
            (Err(_), Ok(level)) => default_log_filter(&level),
            _ => default_log_filter("info"),
        };

        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| SERVICE_NAME.to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty()),
            deployment: std::env::var("OTEL_ENVIRONMENT").ok(),
            filter,
        }
    }
}

/// `level` for the harvester crates and the HTTP layer, `warn` for dependencies
pub fn default_log_filter(level: &str) -> String {
    format!("warn,harvester_ingest={level},harvesterd={level},tower_http={level}")
}

/// Flushes exported spans when dropped
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("harvesterd: tracer provider shutdown failed: {e:?}");
            }
        }
    }
}

/// Install the global subscriber; hold the guard until the process exits
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|e| {
        eprintln!("harvesterd: ignoring invalid log filter {:?}: {e}", config.filter);
        EnvFilter::new(default_log_filter("info"))
    });
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(filter);

    let exporter = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| (endpoint, otlp_provider(endpoint, &config)));

    let (provider, otel) = match &exporter {
        Some((_, Ok(provider))) => {
            let tracer = provider.tracer(SERVICE_NAME);
            (
                Some(provider.clone()),
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry().with(console).with(otel).init();

    match exporter {
        Some((endpoint, Ok(_))) => tracing::info!(endpoint, "Exporting traces over OTLP"),
        Some((endpoint, Err(e))) => {
            tracing::warn!(endpoint, error = %e, "OTLP exporter unavailable, traces stay local")
        }
        None => tracing::debug!("OTEL_EXPORTER_OTLP_ENDPOINT not set, trace export off"),
    }

    TelemetryGuard { provider }
}

fn otlp_provider(endpoint: &str, config: &TelemetryConfig) -> Result<SdkTracerProvider, String> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())?;

    let attributes = [
        Some(KeyValue::new("service.name", config.service_name.clone())),
        Some(KeyValue::new("service.version", env!("CARGO_PKG_VERSION"))),
        config
            .deployment
            .clone()
            .map(|env| KeyValue::new("deployment.environment", env)),
    ];
    let resource = Resource::builder()
        .with_attributes(attributes.into_iter().flatten())
        .build();

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}
