// Queue consumer: pulls deliveries one at a time and drives the dispatcher.
// Per-message failures are counted here and never end the loop.
use faas_common::InvocationRequest;
use faas_stream::{Delivery, QueueSubscription, StreamError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Dispatched, Dispatcher};
use crate::errors::MessageError;

// Pause after a receive error so a broken stream does not spin.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counters owned by one consumer instance.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    completed: AtomicU64,
    decode_errors: AtomicU64,
    invocation_failures: AtomicU64,
    body_read_errors: AtomicU64,
    report_failures: AtomicU64,
    ack_failures: AtomicU64,
    receive_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub decode_errors: u64,
    pub invocation_failures: u64,
    pub body_read_errors: u64,
    pub report_failures: u64,
    pub ack_failures: u64,
    pub receive_errors: u64,
}

impl ConsumerStats {
    // Returns the 1-based sequence of the message just received.
    fn next_sequence(&self) -> u64 {
        metrics::counter!("faas_worker_messages_total").increment(1);
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, err: &MessageError) {
        metrics::counter!("faas_worker_message_errors_total", "kind" => err.kind()).increment(1);
        let counter = match err {
            MessageError::Decode(_) => {
                metrics::counter!("faas_worker_decode_errors_total").increment(1);
                &self.decode_errors
            }
            MessageError::Invoke { .. } => {
                metrics::counter!("faas_worker_invocation_failures_total").increment(1);
                &self.invocation_failures
            }
            MessageError::ReadBody { .. } => {
                metrics::counter!("faas_worker_body_read_errors_total").increment(1);
                &self.body_read_errors
            }
            MessageError::Report { .. } => {
                metrics::counter!("faas_worker_report_failures_total").increment(1);
                &self.report_failures
            }
            MessageError::Ack { .. } => {
                metrics::counter!("faas_worker_ack_failures_total").increment(1);
                &self.ack_failures
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            invocation_failures: self.invocation_failures.load(Ordering::Relaxed),
            body_read_errors: self.body_read_errors.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct StreamConsumer {
    dispatcher: Dispatcher,
    stats: ConsumerStats,
}

impl StreamConsumer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Handles one delivery end to end: decode, invoke, report, ack.
    pub async fn handle(&self, delivery: Delivery) -> Dispatched {
        let seq = self.stats.next_sequence();
        tracing::info!(
            seq,
            subject = %delivery.subject,
            stream_seq = delivery.sequence,
            redelivered = delivery.redelivered,
            bytes = delivery.payload.len(),
            "[#{}] Received on [{}]",
            seq,
            delivery.subject
        );

        let (request, decode_err) = InvocationRequest::decode_lossy(&delivery.payload);
        let mut dispatched = match decode_err {
            Some(err) => {
                let err = MessageError::Decode(err.to_string());
                tracing::warn!(seq, error = %err, "dispatching empty request");
                let mut dispatched = self.dispatcher.dispatch(&request).await;
                dispatched.errors.insert(0, err);
                dispatched
            }
            None => self.dispatcher.dispatch(&request).await,
        };

        let sequence = delivery.sequence;
        if let Err(err) = delivery.ack().await {
            let err = MessageError::Ack {
                sequence,
                reason: err.to_string(),
            };
            tracing::warn!(seq, error = %err, "ack failed; broker may redeliver");
            dispatched.errors.push(err);
        }

        for err in &dispatched.errors {
            self.stats.record(err);
        }
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        dispatched
    }

    /// Consumes until `shutdown` fires or the stream closes, then hands the
    /// subscription back for cleanup.
    ///
    /// Shutdown is only observed between messages; a message being handled
    /// always runs to completion here.
    pub async fn run<S>(self: Arc<Self>, mut subscription: S, shutdown: CancellationToken) -> S
    where
        S: QueueSubscription,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = subscription.next_delivery() => next,
            };
            match next {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                }
                Ok(None) => {
                    tracing::info!("message stream closed");
                    break;
                }
                Err(StreamError::SubscriptionLost(reason)) => {
                    self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(reason = %reason, "subscription lost; stopping consumer");
                    break;
                }
                Err(err) => {
                    self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "receive failed");
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                }
            }
        }
        subscription
    }
}
