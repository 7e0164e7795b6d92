//! Worker lifecycle: subscribe once, serve, drain, clean up.
//!
//! # States
//! `Uninitialized -> Connected -> Subscribed -> Draining -> Terminated`.
//!
//! # Shutdown
//! When the shutdown future resolves the consumer stops taking deliveries and
//! the message it is handling (if any) gets up to `drain_timeout` to finish,
//! report and ack. Only then is the subscription released and the connection
//! closed, so an in-flight report never races the close.
//!
//! Releasing a membership leaves the queue group to the other workers. The
//! group itself is deleted only for a durable with `unsubscribe_on_exit`.
//!
//! If the message stream ends before shutdown is requested, the worker still
//! cleans up and `serve` returns an error so the process exits non-zero.
use anyhow::{Context, Result};
use faas_stream::{QueueSubscription, StreamConnector, SubscriptionSpec};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::consumer::StreamConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Connected,
    Subscribed,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOptions {
    // Delete a durable queue group on exit instead of keeping its position.
    // Deletion applies to every member, so set it on the last one only.
    pub unsubscribe_on_exit: bool,
    pub drain_timeout: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            unsubscribe_on_exit: false,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl ShutdownOptions {
    // Non-durable groups are shared with live members and reaped by the broker,
    // so only an explicitly released durable is deleted.
    pub fn should_unsubscribe(&self, spec: &SubscriptionSpec) -> bool {
        spec.is_durable() && self.unsubscribe_on_exit
    }
}

pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        Self { state }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        tracing::debug!(from = ?prev, to = ?next, "lifecycle transition");
    }

    /// Serves a connected broker until `shutdown` resolves.
    ///
    /// Failing to subscribe is returned as an error and nothing is served.
    pub async fn serve<C, F>(
        &self,
        connector: C,
        consumer: Arc<StreamConsumer>,
        spec: SubscriptionSpec,
        options: ShutdownOptions,
        shutdown: F,
    ) -> Result<()>
    where
        C: StreamConnector,
        F: Future<Output = ()> + Send,
    {
        self.transition(LifecycleState::Connected);
        let subscription = connector
            .queue_subscribe(&spec)
            .await
            .with_context(|| format!("queue subscribe to {}", spec.subject))?;
        self.transition(LifecycleState::Subscribed);
        tracing::info!(
            "Listening on [{}], clientID=[{}], qgroup=[{}] durable=[{}]",
            spec.subject,
            spec.client_id,
            spec.queue_group,
            spec.durable_name
        );

        let stop = CancellationToken::new();
        let mut task = tokio::spawn(Arc::clone(&consumer).run(subscription, stop.clone()));

        let finished = tokio::select! {
            _ = shutdown => None,
            joined = &mut task => Some(joined),
        };
        self.transition(LifecycleState::Draining);
        let ended_early = finished.is_some();
        if ended_early {
            tracing::error!("message stream ended before shutdown; closing connection");
        } else {
            tracing::info!("Received an interrupt, unsubscribing and closing connection...");
        }
        stop.cancel();

        let joined = match finished {
            Some(joined) => Some(joined),
            None => match tokio::time::timeout(options.drain_timeout, &mut task).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = options.drain_timeout.as_millis() as u64,
                        "in-flight message did not finish in time; aborting it"
                    );
                    task.abort();
                    let _ = task.await;
                    None
                }
            },
        };

        match joined {
            Some(Ok(subscription)) => release(subscription, &spec, options).await,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "consumer task failed; subscription dropped");
            }
            None => {
                tracing::warn!("subscription dropped without explicit release");
            }
        }

        if let Err(err) = connector.close().await {
            tracing::warn!(error = %err, "closing stream connection failed");
        }
        self.transition(LifecycleState::Terminated);
        tracing::info!(stats = ?consumer.stats(), "worker stopped");
        if ended_early {
            anyhow::bail!("message stream for {} ended before shutdown", spec.subject);
        }
        Ok(())
    }
}

async fn release<S>(subscription: S, spec: &SubscriptionSpec, options: ShutdownOptions)
where
    S: QueueSubscription,
{
    if options.should_unsubscribe(spec) {
        tracing::info!(durable = %spec.durable_name, "deleting durable subscription");
        if let Err(err) = subscription.unsubscribe().await {
            tracing::warn!(error = %err, "unsubscribe failed");
        }
    } else {
        tracing::info!(
            queue_group = %spec.queue_group,
            durable = %spec.durable_name,
            "leaving queue group"
        );
        if let Err(err) = subscription.detach().await {
            tracing::warn!(error = %err, "detach failed");
        }
    }
}
