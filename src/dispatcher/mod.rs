//! Fan-out of incoming events to per-subscriber live queues.
//!
//! ```text
//!                      ┌────────────── watch loop ──────────────┐
//!  SubscriptionStore ──┤ change feed -> rebuild mapping -> swap │
//!                      └────────────────────────────────────────┘
//!                                          │ Arc<SubscriptionMapping>
//!                                          ▼
//!  incoming ──► DurableConsumer ──► dispatch loop ──► dispatch/<name>.main (xN)
//!                                          │
//!                                          └─ ack after every copy is written
//! ```
//!
//! Delivery is at least once. If a copy cannot be written the source event
//! is negatively acknowledged and redelivered whole, so subscribers that
//! already got it see it twice. Every copy carries the event's `event_id`.

mod mapping;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::Event;
use crate::queue::names::{live_subject, DISPATCH_STREAM, INCOMING_STREAM, INCOMING_SUBJECT};
use crate::queue::{Acknowledgements, DurableConsumer, MessageQueue, QueueError, QueueMessage};
use crate::store::{StoreError, SubscriptionChange, SubscriptionStore};

pub use mapping::SubscriptionMapping;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Error type for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Whether the error must stop the dispatcher.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Queue(err) if err.is_fatal())
    }
}

/// Counters reported when the dispatcher stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Pull attempts on the incoming stream.
    pub polls: usize,
    /// Events acknowledged after a complete fan-out.
    pub dispatched: usize,
    /// Copies written to subscriber queues.
    pub fanned_out: usize,
    /// Events with no matching subscriber.
    pub unrouted: usize,
    /// Events left for redelivery because a copy could not be written.
    pub failed: usize,
    /// Payloads that are not events; acknowledged and dropped.
    pub dropped: usize,
    /// Mapping rebuilds.
    pub reloads: usize,
}

enum Outcome {
    Dispatched { copies: usize },
    Unrouted,
    Dropped,
}

/// Routes events from the incoming stream to subscriber live queues.
pub struct Dispatcher {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn SubscriptionStore>,
    mapping: RwLock<Arc<SubscriptionMapping>>,
    poll_timeout: Duration,
    max_reconnect_attempts: u32,
    reloads: AtomicUsize,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn MessageQueue>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            queue,
            store,
            mapping: RwLock::new(Arc::new(SubscriptionMapping::default())),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reloads: AtomicUsize::new(0),
        }
    }

    /// How long one pull on the incoming stream may block.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// The routing table currently in use.
    pub fn mapping(&self) -> Arc<SubscriptionMapping> {
        Arc::clone(&self.mapping.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Rebuild the routing table from the store and swap it in.
    ///
    /// Also makes sure every subscriber's live subject exists, so fan-out
    /// never targets an unbound subject.
    pub async fn reload_mapping(&self) -> Result<usize, DispatchError> {
        let subscriptions = self.store.list().await?;
        let subjects: Vec<String> = subscriptions.iter().map(|s| live_subject(&s.name)).collect();
        self.queue
            .ensure_stream(DISPATCH_STREAM, true, Some(subjects))
            .await?;

        let mapping = Arc::new(SubscriptionMapping::build(&subscriptions));
        let count = mapping.len();
        *self.mapping.write().unwrap_or_else(PoisonError::into_inner) = mapping;
        self.reloads.fetch_add(1, Ordering::Relaxed);
        info!(subscriptions = count, "subscription mapping reloaded");
        Ok(count)
    }

    /// Run until `cancel` fires or a fatal broker error occurs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DispatcherStats, DispatchError> {
        self.queue
            .ensure_stream(INCOMING_STREAM, false, Some(vec![INCOMING_SUBJECT.to_string()]))
            .await?;
        let consumer = DurableConsumer::attach(
            Arc::clone(&self.queue),
            INCOMING_STREAM,
            false,
            Some(INCOMING_SUBJECT),
            self.max_reconnect_attempts,
        )
        .await?;

        // Subscribe before the first load so no change slips in between.
        let changes = self.store.watch();
        self.reload_mapping().await?;
        info!("dispatcher started");

        let dispatch = self.dispatch_loop(consumer, &cancel);
        let watch = self.watch_loop(changes, &cancel);
        tokio::pin!(dispatch);
        tokio::pin!(watch);

        let result = tokio::select! {
            result = &mut dispatch => result,
            watched = &mut watch => match watched {
                Ok(()) => dispatch.await,
                Err(err) => Err(err),
            },
        };
        match &result {
            Ok(stats) => info!(?stats, "dispatcher stopped"),
            Err(err) => error!(error = %err, "dispatcher aborted"),
        }
        result.map(|mut stats| {
            stats.reloads = self.reloads.load(Ordering::Relaxed);
            stats
        })
    }

    async fn watch_loop(
        &self,
        mut changes: broadcast::Receiver<SubscriptionChange>,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                change = changes.recv() => match change {
                    Ok(change) => {
                        debug!(subscription = %change.name, kind = ?change.kind, "subscription changed");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "subscription change feed lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!("subscription change feed closed, mapping is frozen");
                        return Ok(());
                    }
                },
            }
            match self.reload_mapping().await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(error = %err, "failed to reload subscription mapping, keeping the previous one");
                }
            }
        }
    }

    async fn dispatch_loop(
        &self,
        mut consumer: DurableConsumer,
        cancel: &CancellationToken,
    ) -> Result<DispatcherStats, DispatchError> {
        let mut stats = DispatcherStats::default();
        loop {
            stats.polls += 1;
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(stats),
                next = consumer.next(self.poll_timeout) => next?,
            };
            let Some((message, acks)) = next else {
                continue;
            };
            self.handle(&message, &acks, &mut stats).await?;
        }
    }

    /// Fan one message out and settle it. Only fatal errors escape.
    async fn handle(
        &self,
        message: &QueueMessage,
        acks: &Acknowledgements,
        stats: &mut DispatcherStats,
    ) -> Result<(), DispatchError> {
        match self.dispatch_message(message).await {
            Ok(outcome) => {
                match outcome {
                    Outcome::Dispatched { copies } => {
                        stats.dispatched += 1;
                        stats.fanned_out += copies;
                    }
                    Outcome::Unrouted => stats.unrouted += 1,
                    Outcome::Dropped => stats.dropped += 1,
                }
                settle(acks.acknowledge().await, message.sequence_number)
            }
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                stats.failed += 1;
                warn!(sequence = message.sequence_number, error = %err, "fan-out failed, event will be redelivered");
                settle(acks.acknowledge_negatively().await, message.sequence_number)
            }
        }
    }

    async fn dispatch_message(&self, message: &QueueMessage) -> Result<Outcome, QueueError> {
        let event = match Event::from_payload(&message.payload) {
            Ok(event) => event,
            Err(err) => {
                error!(sequence = message.sequence_number, error = %err, "dropping undecodable message");
                return Ok(Outcome::Dropped);
            }
        };
        debug!(
            sequence = message.sequence_number,
            realm = %event.realm(),
            topic = event.topic(),
            delivery = message.delivery_count,
            "received event"
        );

        let subscribers = self.mapping().subscribers(event.realm(), event.topic());
        if subscribers.is_empty() {
            info!(realm = %event.realm(), topic = event.topic(), "no consumers for event");
            return Ok(Outcome::Unrouted);
        }

        for name in &subscribers {
            debug!(subscription = %name, topic = event.topic(), "sending event to subscriber");
            self.queue
                .add_message(DISPATCH_STREAM, &live_subject(name), message.payload.clone())
                .await?;
        }
        Ok(Outcome::Dispatched {
            copies: subscribers.len(),
        })
    }
}

/// Surface fatal settle errors; anything else only costs a redelivery.
fn settle(result: Result<(), QueueError>, sequence: u64) -> Result<(), DispatchError> {
    match result {
        Err(err) if err.is_fatal() => Err(err.into()),
        Err(err) => {
            warn!(sequence, error = %err, "failed to settle incoming message");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
