//! In-memory broker for tests and single-process deployments.
//!
//! Implements [`MessageQueue`] with the semantics the rest of the crate relies
//! on: per-subject FIFO, durable pull consumers with an ack lease, negative
//! acknowledgements, work-queue and limits retention.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::message::{AckHandle, Acknowledgements, QueueError, QueueMessage};
use super::port::{MessageQueue, PullSubscription};

/// Upper bound for a single wait, so expired leases are noticed without a
/// publish waking the waiter.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

/// In-memory broker.
///
/// Features:
/// - Cheap to clone; clones share the same streams
/// - One durable pull consumer per stream, created by `initialize_subscription`
/// - Unacknowledged deliveries are handed out again once `ack_wait` elapses
/// - At most `max_ack_pending` deliveries in flight per consumer (default 1),
///   which keeps a single consumer strictly ordered
///
/// ## Example
///
/// ```ignore
/// use std::time::Duration;
/// use provisioning_rust::queue::{InMemoryBroker, MessageQueue};
///
/// let broker = InMemoryBroker::new();
/// broker.ensure_stream("dispatch", true, Some(vec!["crm.main".into()])).await?;
/// broker.add_message("dispatch", "crm.main", b"{}".to_vec()).await?;
///
/// let message = broker
///     .get_message("dispatch", "crm.main", Duration::from_millis(10), true)
///     .await?;
/// assert_eq!(message.unwrap().sequence_number, 1);
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
    ack_wait: Duration,
    max_ack_pending: usize,
}

struct BrokerState {
    streams: Mutex<HashMap<String, Stream>>,
    notify: Notify,
}

struct Stream {
    subjects: BTreeSet<String>,
    manual_delete: bool,
    next_sequence: u64,
    messages: BTreeMap<u64, StoredMessage>,
    consumer: Option<Consumer>,
}

struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    reads: u32,
}

struct Consumer {
    filter: Option<String>,
    /// Highest sequence handed out for the first time.
    delivered_floor: u64,
    in_flight: BTreeMap<u64, Lease>,
}

struct Lease {
    /// `None` once negatively acknowledged: eligible right away.
    deadline: Option<Instant>,
    delivery_count: u32,
}

impl Lease {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(true, |deadline| deadline <= now)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker with a 30 second ack lease.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                streams: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 1,
        }
    }

    /// Set how long a delivery may stay unacknowledged before redelivery.
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Set how many deliveries a consumer may have in flight.
    pub fn with_max_ack_pending(mut self, max: usize) -> Self {
        self.max_ack_pending = max.max(1);
        self
    }

    /// The configured ack lease.
    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    /// All messages currently stored under a subject, oldest first.
    pub fn messages(&self, stream: &str, subject: &str) -> Vec<QueueMessage> {
        let streams = self.state.lock();
        streams
            .get(stream)
            .map(|s| {
                s.messages
                    .iter()
                    .filter(|(_, m)| m.subject == subject)
                    .map(|(seq, m)| to_queue_message(stream, *seq, m, m.reads.max(1)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages stored in a stream across all subjects.
    pub fn len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    /// Subjects bound to a stream.
    pub fn subjects(&self, stream: &str) -> Vec<String> {
        self.state
            .lock()
            .get(stream)
            .map(|s| s.subjects.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliveries of the stream's consumer that are not yet settled.
    pub fn in_flight(&self, stream: &str) -> usize {
        self.state
            .lock()
            .get(stream)
            .and_then(|s| s.consumer.as_ref())
            .map_or(0, |c| c.in_flight.len())
    }

    /// Poll `check` until it yields a value or `timeout` elapses.
    async fn wait_for<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&mut HashMap<String, Stream>) -> Result<Option<T>, QueueError>,
    ) -> Result<Option<T>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = check(&mut self.state.lock())? {
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = (deadline - now).min(MAX_WAIT_SLICE);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_queue_message(stream: &str, sequence: u64, message: &StoredMessage, count: u32) -> QueueMessage {
    QueueMessage {
        subject: message.subject.clone(),
        reply: format!("$ACK.{stream}.{sequence}.{count}"),
        payload: message.payload.clone(),
        delivery_count: count,
        sequence_number: sequence,
        headers: None,
    }
}

fn stream_mut<'a>(
    streams: &'a mut HashMap<String, Stream>,
    name: &str,
) -> Result<&'a mut Stream, QueueError> {
    streams
        .get_mut(name)
        .ok_or_else(|| QueueError::StreamNotFound(name.to_string()))
}

#[async_trait]
impl MessageQueue for InMemoryBroker {
    async fn ensure_stream(
        &self,
        stream: &str,
        manual_delete: bool,
        subjects: Option<Vec<String>>,
    ) -> Result<(), QueueError> {
        let subjects = subjects.unwrap_or_else(|| vec![stream.to_string()]);
        let mut streams = self.state.lock();
        match streams.get_mut(stream) {
            Some(existing) => {
                existing.subjects.extend(subjects);
                existing.manual_delete = manual_delete;
                debug!(stream, "stream already exists, subjects merged");
            }
            None => {
                streams.insert(
                    stream.to_string(),
                    Stream {
                        subjects: subjects.into_iter().collect(),
                        manual_delete,
                        next_sequence: 1,
                        messages: BTreeMap::new(),
                        consumer: None,
                    },
                );
                info!(stream, manual_delete, "stream created");
            }
        }
        Ok(())
    }

    async fn initialize_subscription(
        &self,
        stream: &str,
        manual_delete: bool,
        subject: Option<&str>,
    ) -> Result<Box<dyn PullSubscription>, QueueError> {
        self.ensure_stream(stream, manual_delete, subject.map(|s| vec![s.to_string()]))
            .await?;
        {
            let mut streams = self.state.lock();
            let s = stream_mut(&mut streams, stream)?;
            match &s.consumer {
                None => {
                    s.consumer = Some(Consumer {
                        filter: subject.map(str::to_string),
                        delivered_floor: 0,
                        in_flight: BTreeMap::new(),
                    });
                    info!(stream, "durable consumer created");
                }
                Some(consumer) if consumer.filter.as_deref() != subject => {
                    return Err(QueueError::Rejected(format!(
                        "stream {stream} already has a consumer filtering on {:?}",
                        consumer.filter
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Box::new(InMemoryPullSubscription {
            broker: self.clone(),
            stream: stream.to_string(),
        }))
    }

    async fn add_message(
        &self,
        stream: &str,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<u64, QueueError> {
        let sequence = {
            let mut streams = self.state.lock();
            let s = stream_mut(&mut streams, stream)?;
            if !s.subjects.contains(subject) {
                return Err(QueueError::Rejected(format!(
                    "subject {subject} is not bound to stream {stream}"
                )));
            }
            let sequence = s.next_sequence;
            s.next_sequence += 1;
            s.messages.insert(
                sequence,
                StoredMessage {
                    subject: subject.to_string(),
                    payload,
                    reads: 0,
                },
            );
            sequence
        };
        self.state.notify.notify_waiters();
        debug!(stream, subject, sequence, "message published");
        Ok(sequence)
    }

    async fn get_message(
        &self,
        stream: &str,
        subject: &str,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<QueueMessage>, QueueError> {
        self.wait_for(timeout, |streams| {
            let s = stream_mut(streams, stream)?;
            let Some(sequence) = s
                .messages
                .iter()
                .find(|(_, m)| m.subject == subject)
                .map(|(seq, _)| *seq)
            else {
                return Ok(None);
            };
            let message = if pop {
                s.messages.remove(&sequence)
            } else {
                s.messages.get_mut(&sequence).map(|m| {
                    m.reads += 1;
                    StoredMessage {
                        subject: m.subject.clone(),
                        payload: m.payload.clone(),
                        reads: m.reads,
                    }
                })
            };
            Ok(message.map(|m| to_queue_message(stream, sequence, &m, m.reads.max(1))))
        })
        .await
    }

    async fn delete_message(
        &self,
        stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<(), QueueError> {
        let mut streams = self.state.lock();
        let s = stream_mut(&mut streams, stream)?;
        match s.messages.get(&sequence) {
            Some(m) if m.subject == subject => {
                s.messages.remove(&sequence);
                debug!(stream, subject, sequence, "message deleted");
                Ok(())
            }
            _ => Err(QueueError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            }),
        }
    }

    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<(), QueueError> {
        let mut streams = self.state.lock();
        let s = stream_mut(&mut streams, stream)?;
        let before = s.messages.len();
        s.messages.retain(|_, m| m.subject != subject);
        debug!(stream, subject, purged = before - s.messages.len(), "subject purged");
        Ok(())
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, QueueError> {
        Ok(self.state.lock().contains_key(stream))
    }
}

/// Durable pull consumer over one in-memory stream.
struct InMemoryPullSubscription {
    broker: InMemoryBroker,
    stream: String,
}

#[async_trait]
impl PullSubscription for InMemoryPullSubscription {
    async fn get_one_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<(QueueMessage, Acknowledgements)>, QueueError> {
        let ack_wait = self.broker.ack_wait;
        let max_ack_pending = self.broker.max_ack_pending;
        let stream_name = self.stream.as_str();

        let delivered = self
            .broker
            .wait_for(timeout, |streams| {
                let s = stream_mut(streams, stream_name)?;
                let Stream {
                    messages, consumer, ..
                } = s;
                let consumer = consumer
                    .as_mut()
                    .ok_or_else(|| QueueError::ConsumerNotFound(stream_name.to_string()))?;
                let now = Instant::now();

                // Deliveries whose message was removed out of band are settled.
                consumer.in_flight.retain(|seq, _| messages.contains_key(seq));

                let redeliver = consumer
                    .in_flight
                    .iter()
                    .find(|(_, lease)| lease.is_expired(now))
                    .map(|(seq, _)| *seq);
                if let Some(sequence) = redeliver {
                    let lease = consumer
                        .in_flight
                        .get_mut(&sequence)
                        .ok_or_else(|| QueueError::ConsumerNotFound(stream_name.to_string()))?;
                    lease.delivery_count += 1;
                    lease.deadline = Some(now + ack_wait);
                    let count = lease.delivery_count;
                    return Ok(messages
                        .get(&sequence)
                        .map(|m| to_queue_message(stream_name, sequence, m, count)));
                }

                if consumer.in_flight.len() >= max_ack_pending {
                    return Ok(None);
                }

                let next = messages
                    .range(consumer.delivered_floor + 1..)
                    .find(|(_, m)| consumer.filter.as_ref().map_or(true, |f| &m.subject == f))
                    .map(|(seq, _)| *seq);
                let Some(sequence) = next else {
                    return Ok(None);
                };
                consumer.delivered_floor = sequence;
                consumer.in_flight.insert(
                    sequence,
                    Lease {
                        deadline: Some(now + ack_wait),
                        delivery_count: 1,
                    },
                );
                Ok(messages
                    .get(&sequence)
                    .map(|m| to_queue_message(stream_name, sequence, m, 1)))
            })
            .await?;

        Ok(delivered.map(|message| {
            let handle = InMemoryAck {
                broker: self.broker.clone(),
                stream: self.stream.clone(),
                sequence: message.sequence_number,
                delivery: message.delivery_count,
            };
            (message, Acknowledgements::new(Arc::new(handle)))
        }))
    }
}

/// Acknowledgement handle for one in-memory delivery.
///
/// Only settles the lease of the delivery it was issued for; once the message
/// is redelivered the handle goes stale.
struct InMemoryAck {
    broker: InMemoryBroker,
    stream: String,
    sequence: u64,
    delivery: u32,
}

impl InMemoryAck {
    fn settle(&self, f: impl FnOnce(&mut Stream, &mut Lease) -> bool) -> Result<(), QueueError> {
        let mut streams = self.broker.state.lock();
        let s = stream_mut(&mut streams, &self.stream)?;
        let Some(mut consumer) = s.consumer.take() else {
            return Err(QueueError::ConsumerNotFound(self.stream.clone()));
        };
        let settled = match consumer.in_flight.get_mut(&self.sequence) {
            Some(lease) if lease.delivery_count == self.delivery => f(s, lease),
            Some(lease) => {
                debug!(
                    stream = %self.stream,
                    sequence = self.sequence,
                    delivery = self.delivery,
                    current = lease.delivery_count,
                    "ignoring settlement of a superseded delivery"
                );
                false
            }
            // Already settled by an earlier handle.
            None => false,
        };
        if settled {
            consumer.in_flight.remove(&self.sequence);
        }
        s.consumer = Some(consumer);
        Ok(())
    }
}

#[async_trait]
impl AckHandle for InMemoryAck {
    async fn ack(&self) -> Result<(), QueueError> {
        let sequence = self.sequence;
        self.settle(|stream, _| {
            if !stream.manual_delete {
                stream.messages.remove(&sequence);
            }
            true
        })?;
        self.broker.state.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.settle(|_, lease| {
            lease.deadline = None;
            false
        })?;
        self.broker.state.notify.notify_waiters();
        Ok(())
    }

    async fn in_progress(&self) -> Result<(), QueueError> {
        let ack_wait = self.broker.ack_wait;
        self.settle(|_, lease| {
            lease.deadline = Some(Instant::now() + ack_wait);
            false
        })
    }
}
