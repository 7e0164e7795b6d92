//! Lifecycle integration tests: subscribe, drain and release.
//!
//! # Purpose
//! Drive `Lifecycle::serve` against the in-memory broker and check what is
//! left behind on the broker after shutdown.
//!
//! # Key invariants
//! - A message in flight at shutdown finishes (report and ack) before the
//!   subscription is released.
//! - Durable subscriptions survive shutdown unless unsubscribe-on-exit is set.
//! - A failed subscribe ends `serve` with an error before anything is served.
//! - Leaving a queue group never takes it away from the members still in it;
//!   deleting a durable stops every member.
mod common;

use anyhow::Result;
use async_trait::async_trait;
use axum::routing::post;
use bytes::Bytes;
use common::{Gateway, QUEUE_GROUP, SUBJECT, spawn_router, spec, wait_until, worker};
use faas_stream::{
    MemoryBroker, MemorySubscription, QueueSubscription, StreamConnector, StreamError,
    SubscriptionSpec,
};
use queue_worker::consumer::StreamConsumer;
use queue_worker::lifecycle::{Lifecycle, LifecycleState, ShutdownOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Running {
    lifecycle: Arc<Lifecycle>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Running {
    async fn shutdown(self) -> Result<Arc<Lifecycle>> {
        let _ = self.stop.send(());
        timeout(Duration::from_secs(5), self.task).await???;
        Ok(self.lifecycle)
    }
}

async fn start(
    broker: &MemoryBroker,
    consumer: Arc<StreamConsumer>,
    spec: SubscriptionSpec,
    options: ShutdownOptions,
) -> Result<Running> {
    let lifecycle = Arc::new(Lifecycle::new());
    let mut state = lifecycle.watch();
    let (stop, stopped) = oneshot::channel::<()>();
    let connector = broker.connect();
    let task = {
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            lifecycle
                .serve(connector, consumer, spec, options, async move {
                    let _ = stopped.await;
                })
                .await
        })
    };
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == LifecycleState::Subscribed),
    )
    .await??;
    Ok(Running {
        lifecycle,
        stop,
        task,
    })
}

async fn slow_function(delay: Duration) -> Result<common::TestServer> {
    spawn_router(axum::Router::new().route(
        "/function/:name",
        post(move || async move {
            tokio::time::sleep(delay).await;
            "done"
        }),
    ))
    .await
}

fn keep_durable(drain_timeout: Duration) -> ShutdownOptions {
    ShutdownOptions {
        unsubscribe_on_exit: false,
        drain_timeout,
    }
}

#[tokio::test]
async fn drain_waits_for_in_flight_message() -> Result<()> {
    let function = slow_function(Duration::from_millis(300)).await?;
    let mut gateway = Gateway::start().await?;
    let consumer = worker(&function.url(), &gateway.server.url())?;
    let broker = MemoryBroker::new();

    let running = start(
        &broker,
        Arc::clone(&consumer),
        spec("", "w1"),
        keep_durable(Duration::from_secs(5)),
    )
    .await?;
    assert_eq!(broker.member_count(SUBJECT, QUEUE_GROUP, ""), 1);

    broker.publish(SUBJECT, Bytes::from_static(br#"{"Function":"slow"}"#));
    wait_until(|| consumer.stats().received == 1).await?;
    let lifecycle = running.shutdown().await?;

    let stats = consumer.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.ack_failures, 0);
    assert_eq!(gateway.next_report().await?.function_name, "slow");
    assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    assert!(!broker.has_group(SUBJECT, QUEUE_GROUP, ""));
    Ok(())
}

#[tokio::test]
async fn drain_timeout_aborts_and_keeps_durable() -> Result<()> {
    let function = slow_function(Duration::from_secs(30)).await?;
    let gateway = Gateway::start().await?;
    let consumer = worker(&function.url(), &gateway.server.url())?;
    let broker = MemoryBroker::new();

    let running = start(
        &broker,
        Arc::clone(&consumer),
        spec("d1", "w1"),
        keep_durable(Duration::from_millis(100)),
    )
    .await?;
    broker.publish(SUBJECT, Bytes::from_static(br#"{"Function":"stuck"}"#));
    wait_until(|| consumer.stats().received == 1).await?;
    running.shutdown().await?;

    assert_eq!(consumer.stats().completed, 0);
    assert!(broker.has_group(SUBJECT, QUEUE_GROUP, "d1"));
    assert_eq!(broker.member_count(SUBJECT, QUEUE_GROUP, "d1"), 0);

    // The unacked message goes to the next member of the durable.
    let conn = broker.connect();
    let mut sub = conn.queue_subscribe(&spec("d1", "w2")).await?;
    let delivery = timeout(Duration::from_secs(1), sub.next_delivery())
        .await??
        .expect("redelivery");
    assert!(delivery.redelivered);
    assert_eq!(&delivery.payload[..], br#"{"Function":"stuck"}"#);
    Ok(())
}

#[tokio::test]
async fn durable_resumes_after_restart() -> Result<()> {
    let function = slow_function(Duration::ZERO).await?;
    let mut gateway = Gateway::start().await?;
    let broker = MemoryBroker::new();

    let first = worker(&function.url(), &gateway.server.url())?;
    let running = start(
        &broker,
        Arc::clone(&first),
        spec("d1", "w1"),
        keep_durable(Duration::from_secs(1)),
    )
    .await?;
    broker.publish(SUBJECT, Bytes::from_static(br#"{"Function":"one"}"#));
    assert_eq!(gateway.next_report().await?.function_name, "one");
    wait_until(|| first.stats().completed == 1).await?;
    running.shutdown().await?;

    // Published while no member is connected.
    broker.publish(SUBJECT, Bytes::from_static(br#"{"Function":"two"}"#));

    let second = worker(&function.url(), &gateway.server.url())?;
    let running = start(
        &broker,
        Arc::clone(&second),
        spec("d1", "w1"),
        keep_durable(Duration::from_secs(1)),
    )
    .await?;
    assert_eq!(gateway.next_report().await?.function_name, "two");
    wait_until(|| second.stats().completed == 1).await?;
    running.shutdown().await?;

    assert_eq!(second.stats().received, 1);
    assert!(gateway.reports.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn unsubscribe_on_exit_forgets_durable() -> Result<()> {
    let gateway = Gateway::start().await?;
    let consumer = worker("http://127.0.0.1:1", &gateway.server.url())?;
    let broker = MemoryBroker::new();

    let running = start(
        &broker,
        consumer,
        spec("d1", "w1"),
        ShutdownOptions {
            unsubscribe_on_exit: true,
            drain_timeout: Duration::from_secs(1),
        },
    )
    .await?;
    assert!(broker.has_group(SUBJECT, QUEUE_GROUP, "d1"));
    running.shutdown().await?;
    assert!(!broker.has_group(SUBJECT, QUEUE_GROUP, "d1"));
    Ok(())
}

#[tokio::test]
async fn stopping_one_member_leaves_the_group_serving() -> Result<()> {
    let function = slow_function(Duration::ZERO).await?;
    let mut gateway = Gateway::start().await?;
    let broker = MemoryBroker::new();
    let first = worker(&function.url(), &gateway.server.url())?;
    let second = worker(&function.url(), &gateway.server.url())?;

    let leaving = start(
        &broker,
        Arc::clone(&first),
        spec("", "w1"),
        keep_durable(Duration::from_secs(1)),
    )
    .await?;
    let staying = start(
        &broker,
        Arc::clone(&second),
        spec("", "w2"),
        keep_durable(Duration::from_secs(1)),
    )
    .await?;
    assert_eq!(broker.member_count(SUBJECT, QUEUE_GROUP, ""), 2);

    leaving.shutdown().await?;
    assert_eq!(broker.member_count(SUBJECT, QUEUE_GROUP, ""), 1);
    assert_eq!(staying.lifecycle.state(), LifecycleState::Subscribed);

    broker.publish(SUBJECT, Bytes::from_static(br#"{"Function":"after"}"#));
    assert_eq!(gateway.next_report().await?.function_name, "after");
    wait_until(|| second.stats().completed == 1).await?;
    assert_eq!(first.stats().received, 0);
    staying.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn deleted_group_stops_remaining_member_with_error() -> Result<()> {
    let gateway = Gateway::start().await?;
    let broker = MemoryBroker::new();
    let releasing = start(
        &broker,
        worker("http://127.0.0.1:1", &gateway.server.url())?,
        spec("d1", "w1"),
        ShutdownOptions {
            unsubscribe_on_exit: true,
            drain_timeout: Duration::from_secs(1),
        },
    )
    .await?;
    let survivor = start(
        &broker,
        worker("http://127.0.0.1:1", &gateway.server.url())?,
        spec("d1", "w2"),
        keep_durable(Duration::from_secs(1)),
    )
    .await?;

    releasing.shutdown().await?;
    let result = timeout(Duration::from_secs(5), survivor.task).await??;
    let err = result.expect_err("stream ended without a shutdown request");
    assert!(format!("{err:#}").contains("ended before shutdown"));
    assert_eq!(survivor.lifecycle.state(), LifecycleState::Terminated);
    assert!(!broker.has_group(SUBJECT, QUEUE_GROUP, "d1"));
    Ok(())
}

struct RefusingConnector;

#[async_trait]
impl StreamConnector for RefusingConnector {
    type Subscription = MemorySubscription;

    async fn queue_subscribe(
        &self,
        spec: &SubscriptionSpec,
    ) -> faas_stream::Result<MemorySubscription> {
        Err(StreamError::Subscribe {
            subject: spec.subject.clone(),
            queue_group: spec.queue_group.clone(),
            reason: "permission denied".to_string(),
        })
    }

    async fn close(&self) -> faas_stream::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn subscribe_failure_is_fatal() -> Result<()> {
    let gateway = Gateway::start().await?;
    let consumer = worker("http://127.0.0.1:1", &gateway.server.url())?;
    let lifecycle = Lifecycle::new();

    let result = lifecycle
        .serve(
            RefusingConnector,
            Arc::clone(&consumer),
            spec("", "w1"),
            ShutdownOptions::default(),
            std::future::pending::<()>(),
        )
        .await;
    let err = result.expect_err("subscribe refused");
    assert!(format!("{err:#}").contains("permission denied"));
    assert_eq!(lifecycle.state(), LifecycleState::Connected);
    assert_eq!(consumer.stats().received, 0);
    Ok(())
}

#[tokio::test]
async fn closed_connection_cannot_subscribe() -> Result<()> {
    let gateway = Gateway::start().await?;
    let consumer = worker("http://127.0.0.1:1", &gateway.server.url())?;
    let broker = MemoryBroker::new();
    let connector = broker.connect();
    connector.close().await?;

    let result = Lifecycle::new()
        .serve(
            connector,
            consumer,
            spec("", "w1"),
            ShutdownOptions::default(),
            std::future::pending::<()>(),
        )
        .await;
    assert!(result.is_err());
    assert!(!broker.has_group(SUBJECT, QUEUE_GROUP, ""));
    Ok(())
}
