// In-process broker with durable queue groups.
// Each subject keeps an unbounded log; each (subject, queue group, durable)
// triple keeps one shared cursor so every message goes to exactly one member.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::{
    Acknowledge, Delivery, QueueSubscription, Result, StartPosition, StreamConnector,
    StreamError, SubscriptionSpec,
};

/// Shared broker state. Clones talk to the same broker.
///
/// ```
/// use bytes::Bytes;
/// use faas_stream::{MemoryBroker, QueueSubscription, StartPosition, StreamConnector, SubscriptionSpec};
///
/// let broker = MemoryBroker::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let conn = broker.connect();
///     let spec = SubscriptionSpec {
///         subject: "jobs".into(),
///         queue_group: "workers".into(),
///         durable_name: String::new(),
///         client_id: "w1".into(),
///         start_position: StartPosition::NewOnly,
///     };
///     let mut sub = conn.queue_subscribe(&spec).await.expect("subscribe");
///     broker.publish("jobs", Bytes::from_static(b"payload"));
///     let delivery = sub.next_delivery().await.expect("recv").expect("open");
///     assert_eq!(delivery.payload, Bytes::from_static(b"payload"));
///     delivery.ack().await.expect("ack");
/// });
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Bytes>>,
    groups: HashMap<GroupKey, GroupState>,
    next_member: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    subject: String,
    queue_group: String,
    durable_name: String,
}

impl GroupKey {
    fn from_spec(spec: &SubscriptionSpec) -> Self {
        Self {
            subject: spec.subject.clone(),
            queue_group: spec.queue_group.clone(),
            durable_name: spec.durable_name.clone(),
        }
    }
}

#[derive(Debug)]
struct GroupState {
    // Next never-delivered sequence (1-based).
    next_seq: u64,
    // Sequences handed out and not yet acked, keyed to the member holding them.
    in_flight: HashMap<u64, u64>,
    // Sequences returned by detached members, delivered before new ones.
    redeliver: BTreeSet<u64>,
    members: HashSet<u64>,
    durable: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection to this broker.
    pub fn connect(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Appends a message to a subject and returns its sequence.
    pub fn publish(&self, subject: &str, payload: Bytes) -> u64 {
        let seq = {
            let mut state = self.shared.state.lock();
            let log = state.logs.entry(subject.to_string()).or_default();
            log.push(payload);
            log.len() as u64
        };
        self.shared.notify.notify_waiters();
        seq
    }

    /// Number of live members in a queue group.
    pub fn member_count(&self, subject: &str, queue_group: &str, durable_name: &str) -> usize {
        let key = GroupKey {
            subject: subject.to_string(),
            queue_group: queue_group.to_string(),
            durable_name: durable_name.to_string(),
        };
        self.shared
            .state
            .lock()
            .groups
            .get(&key)
            .map(|group| group.members.len())
            .unwrap_or(0)
    }

    /// Whether broker-side state exists for a queue group.
    pub fn has_group(&self, subject: &str, queue_group: &str, durable_name: &str) -> bool {
        let key = GroupKey {
            subject: subject.to_string(),
            queue_group: queue_group.to_string(),
            durable_name: durable_name.to_string(),
        };
        self.shared.state.lock().groups.contains_key(&key)
    }

    fn join(&self, spec: &SubscriptionSpec) -> u64 {
        let mut state = self.shared.state.lock();
        let member = state.next_member;
        state.next_member += 1;
        let log_len = state
            .logs
            .get(&spec.subject)
            .map(|log| log.len() as u64)
            .unwrap_or(0);
        let group = state
            .groups
            .entry(GroupKey::from_spec(spec))
            .or_insert_with(|| GroupState {
                next_seq: match spec.start_position {
                    StartPosition::First => 1,
                    StartPosition::NewOnly => log_len + 1,
                    StartPosition::LastReceived => log_len.max(1),
                },
                in_flight: HashMap::new(),
                redeliver: BTreeSet::new(),
                members: HashSet::new(),
                durable: spec.is_durable(),
            });
        group.members.insert(member);
        member
    }

    fn take_next(&self, key: &GroupKey, member: u64) -> Result<Option<(u64, bool, Bytes)>> {
        let mut state = self.shared.state.lock();
        let BrokerState { logs, groups, .. } = &mut *state;
        let group = groups.get_mut(key).ok_or_else(|| {
            StreamError::SubscriptionLost(format!(
                "queue group {} on {} was deleted",
                key.queue_group, key.subject
            ))
        })?;
        let Some(log) = logs.get(&key.subject) else {
            return Ok(None);
        };

        let (seq, redelivered) = if let Some(seq) = group.redeliver.pop_first() {
            (seq, true)
        } else if group.next_seq <= log.len() as u64 {
            let seq = group.next_seq;
            group.next_seq += 1;
            (seq, false)
        } else {
            return Ok(None);
        };
        group.in_flight.insert(seq, member);
        let payload = log[(seq - 1) as usize].clone();
        Ok(Some((seq, redelivered, payload)))
    }

    fn ack(&self, key: &GroupKey, member: u64, seq: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        let group = state.groups.get_mut(key).ok_or_else(|| StreamError::Ack {
            sequence: seq,
            reason: "queue group no longer exists".to_string(),
        })?;
        match group.in_flight.get(&seq) {
            Some(holder) if *holder == member => {
                group.in_flight.remove(&seq);
                Ok(())
            }
            _ => Err(StreamError::Ack {
                sequence: seq,
                reason: "delivery is not in flight for this member".to_string(),
            }),
        }
    }

    // Removes a member and returns its unacked sequences to the group.
    // The group is dropped once empty unless it is durable. Deleting drops it
    // at once, for every member.
    fn leave(&self, key: &GroupKey, member: u64, delete: bool) {
        {
            let mut state = self.shared.state.lock();
            let Some(group) = state.groups.get_mut(key) else {
                return;
            };
            group.members.remove(&member);
            let returned: Vec<u64> = group
                .in_flight
                .iter()
                .filter(|(_, holder)| **holder == member)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in returned {
                group.in_flight.remove(&seq);
                group.redeliver.insert(seq);
            }
            if delete || (group.members.is_empty() && !group.durable) {
                state.groups.remove(key);
            }
        }
        // Wake other members so they pick up returned sequences.
        self.shared.notify.notify_waiters();
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnector {
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StreamConnector for MemoryConnector {
    type Subscription = MemorySubscription;

    async fn queue_subscribe(&self, spec: &SubscriptionSpec) -> Result<MemorySubscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Subscribe {
                subject: spec.subject.clone(),
                queue_group: spec.queue_group.clone(),
                reason: "connection closed".to_string(),
            });
        }
        let member = self.broker.join(spec);
        tracing::debug!(
            subject = %spec.subject,
            queue_group = %spec.queue_group,
            durable = %spec.durable_name,
            member,
            "memory queue subscription joined"
        );
        Ok(MemorySubscription {
            broker: self.broker.clone(),
            key: GroupKey::from_spec(spec),
            member,
            closed: Arc::clone(&self.closed),
            left: false,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }
}

/// One member of a queue group on a [`MemoryBroker`].
pub struct MemorySubscription {
    broker: MemoryBroker,
    key: GroupKey,
    member: u64,
    closed: Arc<AtomicBool>,
    left: bool,
}

impl MemorySubscription {
    fn leave(&mut self, delete: bool) {
        if !self.left {
            self.left = true;
            self.broker.leave(&self.key, self.member, delete);
        }
    }
}

#[async_trait]
impl QueueSubscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = self.broker.shared.notify.notified();
            if self.closed.load(Ordering::Acquire) || self.left {
                return Ok(None);
            }
            if let Some((seq, redelivered, payload)) =
                self.broker.take_next(&self.key, self.member)?
            {
                let acker = MemoryAck {
                    broker: self.broker.clone(),
                    key: self.key.clone(),
                    member: self.member,
                    seq,
                };
                return Ok(Some(Delivery::new(
                    self.key.subject.clone(),
                    seq,
                    redelivered,
                    payload,
                    Box::new(acker),
                )));
            }
            notified.await;
        }
    }

    async fn unsubscribe(mut self) -> Result<()> {
        self.leave(true);
        Ok(())
    }

    async fn detach(mut self) -> Result<()> {
        self.leave(false);
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        // A dropped member behaves like a disconnected client.
        self.leave(false);
    }
}

struct MemoryAck {
    broker: MemoryBroker,
    key: GroupKey,
    member: u64,
    seq: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.broker.ack(&self.key, self.member, self.seq)
    }
}
