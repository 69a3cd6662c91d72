//! Tracing, metrics exposure, and probe endpoints.
//!
//! Log output always goes through `tracing` with an env-filterable
//! console layer. An OTLP span exporter and the Prometheus/probe HTTP
//! server are both optional and configured per unit. The state machines
//! stay free of any of this; only the runner and bus are instrumented.

use axum::{response::IntoResponse, routing::get, Router};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use parking_lot::RwLock;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Shared readiness flag behind the `/ready` probe.
///
/// The runner flips it: true once the state machine has initialized,
/// false again when the event loop exits.
pub type ReadyFlag = Arc<RwLock<bool>>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("OpenTelemetry SDK error: {0}")]
    OtelSdk(#[from] opentelemetry_sdk::error::OTelSdkError),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to bind metrics port: {0}")]
    MetricsPort(#[from] std::io::Error),
}

/// Configuration for telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for OTEL resource attributes.
    pub service_name: String,
    /// OTLP endpoint (e.g., "http://localhost:4317"). `None` disables
    /// span export; console logging still works.
    pub otlp_endpoint: Option<String>,
    /// Sampling ratio (0.0 to 1.0).
    pub sampling_ratio: f64,
    /// Serve Prometheus metrics and probes over HTTP.
    pub prometheus_enabled: bool,
    /// Port for the metrics server.
    pub prometheus_port: u16,
    /// Additional resource attributes, e.g. the unit id.
    pub resource_attributes: Vec<(String, String)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "gridmesh-unit".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            prometheus_enabled: false,
            prometheus_port: 9090,
            resource_attributes: vec![],
        }
    }
}

/// Initialize tracing and, if configured, the OTLP exporter and the
/// metrics server.
///
/// With no OTLP endpoint this degrades to console logging. The OTLP
/// exporter batches and buffers spans in memory, so an unavailable
/// collector never stalls the unit; `build()` validates the endpoint
/// format and connects lazily on first export.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let mut resource_attrs = vec![
        opentelemetry::KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        opentelemetry::KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    for (key, value) in &config.resource_attributes {
        resource_attrs.push(opentelemetry::KeyValue::new(key.clone(), value.clone()));
    }
    let resource = Resource::builder().with_attributes(resource_attrs).build();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gridmesh=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let (otel_layer, tracer_provider) = if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;

        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::TraceIdRatioBased(config.sampling_ratio))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource.clone())
            .build();

        let tracer = tracer_provider.tracer("gridmesh");

        (Some(OpenTelemetryLayer::new(tracer)), Some(tracer_provider))
    } else {
        (None, None)
    };

    let subscriber = Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer);

    tracing::subscriber::set_global_default(subscriber)?;

    let (server_handle, ready_flag) = if config.prometheus_enabled {
        let ready_flag: ReadyFlag = Arc::new(RwLock::new(false));
        let handle = start_metrics_server(config.prometheus_port, ready_flag.clone());
        (Some(handle), Some(ready_flag))
    } else {
        (None, None)
    };

    Ok(TelemetryGuard {
        tracer_provider,
        server_handle,
        ready_flag,
    })
}

/// Guard that shuts down telemetry on drop.
///
/// For graceful shutdown with span flushing, call `shutdown().await`
/// explicitly before dropping; the `Drop` impl is a fallback that
/// cannot wait for the flush.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
    ready_flag: Option<ReadyFlag>,
}

impl TelemetryGuard {
    /// Flush pending spans (up to 5 seconds) and stop the metrics server.
    pub async fn shutdown(mut self) {
        use std::time::Duration;

        if let Some(provider) = self.tracer_provider.take() {
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                tokio::task::spawn_blocking(move || {
                    let _ = provider.shutdown();
                }),
            )
            .await;
        }

        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }

    /// The flag behind the `/ready` probe, for the runner to drive.
    /// `None` when the metrics server is disabled.
    pub fn ready_flag(&self) -> Option<ReadyFlag> {
        self.ready_flag.clone()
    }

    /// Flip the readiness probe directly.
    pub fn set_ready(&self, ready: bool) {
        if let Some(flag) = &self.ready_flag {
            *flag.write() = ready;
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Fallback shutdown; pending spans may be lost.
        if let Some(provider) = self.tracer_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

/// Start the metrics HTTP server.
///
/// Exposes:
/// - `GET /metrics` - Prometheus metrics in text format
/// - `GET /health` - liveness probe, 200 while the server runs
/// - `GET /ready` - readiness probe, 200 once the unit participates
fn start_metrics_server(port: u16, ready_flag: ReadyFlag) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(move || ready_handler(ready_flag.clone())));

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!(port, "starting metrics server on http://{}", addr);

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(error) => {
                tracing::error!(%error, port, "failed to bind metrics server");
                return;
            }
        };

        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "metrics server error");
        }
    })
}

async fn metrics_handler() -> impl axum::response::IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(%error, "failed to encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}

async fn health_handler() -> impl axum::response::IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}

async fn ready_handler(ready_flag: ReadyFlag) -> impl axum::response::IntoResponse {
    if *ready_flag.read() {
        (
            axum::http::StatusCode::OK,
            axum::Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReadyResponse {
                status: "not_ready",
                ready: false,
            }),
        )
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}
