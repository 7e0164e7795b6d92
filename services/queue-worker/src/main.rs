// Queue worker entry point.
use anyhow::{Context, Result};
use faas_stream::NatsConnector;
use queue_worker::config::WorkerConfig;
use queue_worker::consumer::StreamConsumer;
use queue_worker::dispatch::Dispatcher;
use queue_worker::lifecycle::Lifecycle;
use queue_worker::report::ReportEmitter;
use queue_worker::{observability, signals, transport};
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        if let Err(err) = signals::wait_for_shutdown_signal().await {
            tracing::warn!(error = %err, "signal handler failed; stopping");
        }
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("faas-queue-worker")?;

    let config = WorkerConfig::from_env_or_yaml()?;
    tracing::info!(
        nats = %config.nats_url,
        cluster = %config.cluster_id,
        gateway = %config.gateway_url,
        "queue worker starting"
    );

    let lifecycle = Lifecycle::new();
    tokio::spawn(observability::serve_admin(
        metrics_handle,
        config.metrics_bind,
        lifecycle.watch(),
    ));

    let client = transport::build_client(&config.transport_config())?;
    let consumer = Arc::new(StreamConsumer::new(Dispatcher::new(
        client.clone(),
        Arc::new(config.resolver()),
        ReportEmitter::new(client, &config.gateway_url),
    )));

    let connector = NatsConnector::connect(&config.nats_options())
        .await
        .with_context(|| format!("connect to {}", config.nats_url))?;

    lifecycle
        .serve(
            connector,
            consumer,
            config.subscription_spec(),
            config.shutdown_options(),
            shutdown,
        )
        .await
}
