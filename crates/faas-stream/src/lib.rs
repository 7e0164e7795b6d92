//! Queue-grouped message stream abstraction.
//!
//! # Purpose
//! Gives the worker one subscription API regardless of which broker backs it:
//! a [`StreamConnector`] joins a queue group and hands back a
//! [`QueueSubscription`] that yields [`Delivery`] values one at a time.
//!
//! # Backends
//! - [`nats::NatsConnector`]: NATS JetStream pull consumers.
//! - [`memory::MemoryBroker`]: in-process durable queue groups for tests and
//!   local runs.
//!
//! # Notes
//! A delivery is acknowledged explicitly through [`Delivery::ack`]. Dropping a
//! delivery without acking leaves it in flight until its member detaches, at
//! which point the broker hands it to another group member.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

pub mod memory;
pub mod nats;

pub use memory::{MemoryBroker, MemoryConnector, MemorySubscription};
pub use nats::{NatsConnector, NatsOptions, NatsSubscription};

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("subscribe to {subject} (queue group {queue_group}): {reason}")]
    Subscribe {
        subject: String,
        queue_group: String,
        reason: String,
    },
    #[error("receive failed: {0}")]
    Receive(String),
    // The broker dropped the queue group; retrying the same subscription is useless.
    #[error("subscription lost: {0}")]
    SubscriptionLost(String),
    #[error("ack of sequence {sequence} failed: {reason}")]
    Ack { sequence: u64, reason: String },
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
    #[error("close failed: {0}")]
    Close(String),
    #[error("invalid start position: {0}")]
    InvalidStartPosition(String),
}

/// Where a durable name seen for the first time starts reading.
///
/// Existing durable names always resume from their acknowledged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Start with the most recent message already on the subject.
    #[default]
    LastReceived,
    /// Only messages published after the subscription is created.
    NewOnly,
    /// Replay from the first retained message.
    First,
}

impl FromStr for StartPosition {
    type Err = StreamError;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "last_received" | "last" => Ok(Self::LastReceived),
            "new_only" | "new" => Ok(Self::NewOnly),
            "first" | "all" => Ok(Self::First),
            _ => Err(StreamError::InvalidStartPosition(input.to_string())),
        }
    }
}

/// Queue-group membership requested by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub subject: String,
    pub queue_group: String,
    // Empty means non-durable.
    pub durable_name: String,
    pub client_id: String,
    pub start_position: StartPosition,
}

impl SubscriptionSpec {
    pub fn is_durable(&self) -> bool {
        !self.durable_name.is_empty()
    }

    /// Name of the broker-side consumer shared by every member of the group.
    pub fn consumer_name(&self) -> String {
        if self.is_durable() {
            format!("{}_{}", self.queue_group, self.durable_name)
        } else {
            self.queue_group.clone()
        }
    }
}

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// One message handed to a queue-group member.
pub struct Delivery {
    pub subject: String,
    pub sequence: u64,
    pub redelivered: bool,
    pub payload: Bytes,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        sequence: u64,
        redelivered: bool,
        payload: Bytes,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sequence,
            redelivered,
            payload,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A live queue-group membership.
#[async_trait]
pub trait QueueSubscription: Send {
    /// Waits for the next delivery. `Ok(None)` means the connection closed.
    ///
    /// Must be cancel safe: dropping the future never loses a message that was
    /// not yet returned.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    /// Deletes the queue group's broker-side state. Members still attached
    /// get [`StreamError::SubscriptionLost`] on their next receive.
    async fn unsubscribe(self) -> Result<()>;

    /// Leaves the group and keeps its state for the remaining members. A
    /// non-durable group is released by the broker after its last member goes.
    async fn detach(self) -> Result<()>;
}

/// An established broker connection.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    type Subscription: QueueSubscription + 'static;

    async fn queue_subscribe(&self, spec: &SubscriptionSpec) -> Result<Self::Subscription>;

    async fn close(&self) -> Result<()>;
}
