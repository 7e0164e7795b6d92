//! Logs, span export and the admin listener.
//!
//! `RUST_LOG` filters log output (default `info`). Spans leave the process
//! over OTLP only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. The admin
//! listener renders Prometheus text on `/metrics`, answers `/live` while the
//! process runs and `/ready` only while the worker holds its subscription.
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{TraceError, TracerProvider};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace as sdktrace;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::lifecycle::LifecycleState;

const DEFAULT_LOG_FILTER: &str = "info";

// Resource attribute, then the variables tried in order for its value.
const RESOURCE_FROM_ENV: &[(&str, &[&str])] = &[
    (
        "service.instance.id",
        &["FAAS_SERVICE_INSTANCE_ID", "HOSTNAME"],
    ),
    ("k8s.namespace.name", &["K8S_NAMESPACE_NAME"]),
    ("k8s.pod.name", &["K8S_POD_NAME"]),
    ("deployment.environment", &["DEPLOYMENT_ENVIRONMENT"]),
];

// Unit tests share one process-wide recorder.
#[cfg(test)]
static TEST_RECORDER: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

/// Installs the global log subscriber and metrics recorder.
///
/// Call once per process. The returned handle feeds [`serve_admin`].
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (provider, export_error) = match span_exporter(service_name) {
        Ok(provider) => (provider, None),
        Err(err) => (None, Some(err)),
    };
    let spans = provider.map(|provider| {
        global::set_text_map_propagator(TraceContextPropagator::new());
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(spans)
        .try_init()
        .context("install tracing subscriber")?;
    // A failed exporter only costs spans.
    if let Some(err) = export_error {
        tracing::warn!(error = %err, "span export disabled");
    }
    install_metrics_recorder()
}

fn span_exporter(service_name: &str) -> Result<Option<sdktrace::TracerProvider>, TraceError> {
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_err() {
        return Ok(None);
    }
    let resource = Resource::new(resource_attributes(service_name));
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map(Some)
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let from_env = RESOURCE_FROM_ENV.iter().filter_map(|(attr, vars)| {
        vars.iter()
            .find_map(|var| std::env::var(var).ok())
            .map(|value| KeyValue::new(*attr, value))
    });
    std::iter::once(KeyValue::new("service.name", service_name.to_string()))
        .chain(from_env)
        .collect()
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = TEST_RECORDER.get() {
            return Ok(handle.clone());
        }
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    #[cfg(test)]
    {
        let _ = TEST_RECORDER.set(handle.clone());
    }
    Ok(handle)
}

#[derive(Clone)]
struct AdminState {
    metrics: PrometheusHandle,
    lifecycle: watch::Receiver<LifecycleState>,
}

fn admin_router(state: AdminState) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(render_metrics))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(readiness))
        .with_state(state)
}

async fn render_metrics(State(state): State<AdminState>) -> String {
    state.metrics.render()
}

async fn readiness(State(state): State<AdminState>) -> (StatusCode, &'static str) {
    let current = *state.lifecycle.borrow();
    match current {
        LifecycleState::Subscribed => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

/// Serves the admin endpoints on `addr` until the process exits.
pub async fn serve_admin(
    metrics: PrometheusHandle,
    addr: SocketAddr,
    lifecycle: watch::Receiver<LifecycleState>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "admin listener started");
    let router = admin_router(AdminState { metrics, lifecycle });
    axum::serve(listener, router.into_make_service()).await
}
