// Shared fixtures for queue worker integration tests: a mock gateway that
// records completion reports, mock functions, and a worker wired to both.
#![allow(dead_code)]

use anyhow::Result;
use axum::Json;
use axum::http::StatusCode;
use axum::routing::post;
use faas_common::CompletionReport;
use faas_stream::{StartPosition, SubscriptionSpec};
use queue_worker::consumer::StreamConsumer;
use queue_worker::dispatch::Dispatcher;
use queue_worker::report::{REPORT_PATH, ReportEmitter};
use queue_worker::resolver::FunctionResolver;
use queue_worker::transport::{TransportConfig, build_client};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const SUBJECT: &str = "faas-request";
pub const QUEUE_GROUP: &str = "faas";

pub struct TestServer {
    pub addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
    _handle: JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

pub async fn spawn_router(router: axum::Router) -> Result<TestServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    Ok(TestServer {
        addr,
        _shutdown: shutdown_tx,
        _handle: handle,
    })
}

pub async fn closed_port() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

pub struct Gateway {
    pub server: TestServer,
    pub reports: mpsc::UnboundedReceiver<CompletionReport>,
}

impl Gateway {
    pub async fn start() -> Result<Self> {
        let (tx, reports) = mpsc::unbounded_channel();
        let router = axum::Router::new().route(
            REPORT_PATH,
            post(move |Json(report): Json<CompletionReport>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(report);
                    StatusCode::OK
                }
            }),
        );
        Ok(Self {
            server: spawn_router(router).await?,
            reports,
        })
    }

    pub async fn next_report(&mut self) -> Result<CompletionReport> {
        timeout(Duration::from_secs(5), self.reports.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("gateway closed"))
    }
}

/// Builds a consumer that resolves `name` to `{function_base}/function/{name}`.
pub fn worker(function_base: &str, gateway_url: &str) -> Result<Arc<StreamConsumer>> {
    let client = build_client(&TransportConfig::default())?;
    let base = function_base.to_string();
    let resolver: Arc<dyn FunctionResolver> =
        Arc::new(move |name: &str| format!("{base}/function/{name}"));
    Ok(Arc::new(StreamConsumer::new(Dispatcher::new(
        client.clone(),
        resolver,
        ReportEmitter::new(client, gateway_url),
    ))))
}

pub fn spec(durable: &str, client_id: &str) -> SubscriptionSpec {
    SubscriptionSpec {
        subject: SUBJECT.into(),
        queue_group: QUEUE_GROUP.into(),
        durable_name: durable.into(),
        client_id: client_id.into(),
        start_position: StartPosition::NewOnly,
    }
}

pub async fn wait_until<F>(mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}
