// NATS JetStream backend.
// A queue group maps to one pull consumer shared by every member: JetStream
// hands each message to exactly one puller, and a durable consumer keeps its
// ack floor across reconnects. A member leaving only stops pulling; the
// consumer is deleted on explicit unsubscribe or, when non-durable, reaped by
// the server once nobody has pulled for the inactive threshold.
use async_nats::jetstream::consumer::pull::MessagesErrorKind;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};
use async_nats::jetstream::{self, consumer::pull};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use crate::{
    Acknowledge, Delivery, QueueSubscription, Result, StartPosition, StreamConnector,
    StreamError, SubscriptionSpec,
};

// Non-durable consumers are reaped by the server after this much idle time.
const NON_DURABLE_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct NatsOptions {
    pub url: String,
    // Names the JetStream stream that stores the queue subject.
    pub cluster_id: String,
    pub client_id: String,
}

pub struct NatsConnector {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream_name: String,
}

impl NatsConnector {
    pub async fn connect(options: &NatsOptions) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name(options.client_id.clone())
            .connect(options.url.as_str())
            .await
            .map_err(|err| StreamError::Connect {
                url: options.url.clone(),
                reason: err.to_string(),
            })?;
        tracing::info!(url = %options.url, client_id = %options.client_id, "connected to nats");
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            stream_name: options.cluster_id.clone(),
        })
    }
}

fn deliver_policy(start: StartPosition) -> DeliverPolicy {
    match start {
        StartPosition::LastReceived => DeliverPolicy::Last,
        StartPosition::NewOnly => DeliverPolicy::New,
        StartPosition::First => DeliverPolicy::All,
    }
}

// A deleted consumer never delivers again; everything else is worth retrying.
fn receive_error(kind: MessagesErrorKind, detail: String) -> StreamError {
    match kind {
        MessagesErrorKind::ConsumerDeleted => StreamError::SubscriptionLost(detail),
        _ => StreamError::Receive(detail),
    }
}

fn consumer_config(spec: &SubscriptionSpec) -> pull::Config {
    let name = spec.consumer_name();
    pull::Config {
        durable_name: spec.is_durable().then(|| name.clone()),
        name: Some(name),
        description: Some(format!("queue group {}", spec.queue_group)),
        deliver_policy: deliver_policy(spec.start_position),
        ack_policy: AckPolicy::Explicit,
        filter_subject: spec.subject.clone(),
        inactive_threshold: if spec.is_durable() {
            Duration::ZERO
        } else {
            NON_DURABLE_INACTIVE_THRESHOLD
        },
        ..Default::default()
    }
}

#[async_trait]
impl StreamConnector for NatsConnector {
    type Subscription = NatsSubscription;

    async fn queue_subscribe(&self, spec: &SubscriptionSpec) -> Result<NatsSubscription> {
        let subscribe_err = |reason: String| StreamError::Subscribe {
            subject: spec.subject.clone(),
            queue_group: spec.queue_group.clone(),
            reason,
        };
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: self.stream_name.clone(),
                subjects: vec![spec.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|err| subscribe_err(err.to_string()))?;
        let consumer_name = spec.consumer_name();
        let consumer = stream
            .get_or_create_consumer(&consumer_name, consumer_config(spec))
            .await
            .map_err(|err| subscribe_err(err.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|err| subscribe_err(err.to_string()))?;
        Ok(NatsSubscription {
            stream,
            consumer_name,
            messages,
        })
    }

    // Drain flushes pending acks and publishes, then closes the connection.
    async fn close(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .map_err(|err| StreamError::Close(err.to_string()))
    }
}

pub struct NatsSubscription {
    stream: jetstream::stream::Stream,
    consumer_name: String,
    messages: pull::Stream,
}

#[async_trait]
impl QueueSubscription for NatsSubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        let Some(next) = self.messages.next().await else {
            return Ok(None);
        };
        let message = next.map_err(|err| receive_error(err.kind(), err.to_string()))?;
        let (sequence, redelivered) = match message.info() {
            Ok(info) => (info.stream_sequence, info.delivered > 1),
            Err(err) => {
                tracing::debug!(error = %err, "jetstream message without ack metadata");
                (0, false)
            }
        };
        let subject = message.message.subject.to_string();
        let payload = message.message.payload.clone();
        Ok(Some(Delivery::new(
            subject,
            sequence,
            redelivered,
            payload,
            Box::new(NatsAck { message, sequence }),
        )))
    }

    async fn unsubscribe(self) -> Result<()> {
        drop(self.messages);
        self.stream
            .delete_consumer(&self.consumer_name)
            .await
            .map(|_| ())
            .map_err(|err| StreamError::Unsubscribe(err.to_string()))
    }

    async fn detach(self) -> Result<()> {
        // Pending pulls end with the stream; the consumer stays for other members.
        drop(self.messages);
        tracing::debug!(consumer = %self.consumer_name, "left jetstream consumer");
        Ok(())
    }
}

struct NatsAck {
    message: jetstream::Message,
    sequence: u64,
}

#[async_trait]
impl Acknowledge for NatsAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.message.ack().await.map_err(|err| StreamError::Ack {
            sequence: self.sequence,
            reason: err.to_string(),
        })
    }
}
