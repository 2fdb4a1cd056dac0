//! The durable-queue capability every component depends on.

use std::time::Duration;

use async_trait::async_trait;

use super::message::{Acknowledgements, QueueError, QueueMessage};

/// A durable pull consumer bound to one stream (and optionally one subject).
///
/// Created by [`MessageQueue::initialize_subscription`].
#[async_trait]
pub trait PullSubscription: Send + Sync {
    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` on timeout; a timeout is not an error.
    async fn get_one_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<(QueueMessage, Acknowledgements)>, QueueError>;
}

/// Trait for a durable, pull-based message broker.
///
/// Streams hold messages under named subjects. Ordering is strict FIFO per
/// subject and unspecified across subjects.
///
/// Implementations might include:
/// - `InMemoryBroker` - single-process broker, included
/// - a JetStream or Redis Streams client
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Create a stream, or merge `subjects` into an existing one.
    ///
    /// `manual_delete` selects limits retention (messages stay until deleted);
    /// otherwise the stream is a work queue and acknowledging removes messages.
    /// When `subjects` is `None` the stream name is used as its only subject.
    async fn ensure_stream(
        &self,
        stream: &str,
        manual_delete: bool,
        subjects: Option<Vec<String>>,
    ) -> Result<(), QueueError>;

    /// Ensure the stream exists and attach a durable pull consumer to it.
    async fn initialize_subscription(
        &self,
        stream: &str,
        manual_delete: bool,
        subject: Option<&str>,
    ) -> Result<Box<dyn PullSubscription>, QueueError>;

    /// Append a message to a subject of a stream.
    async fn add_message(&self, stream: &str, subject: &str, payload: Vec<u8>)
        -> Result<u64, QueueError>;

    /// Read the oldest message of a subject, waiting up to `timeout`.
    ///
    /// With `pop` the message is removed; otherwise it stays at the head of
    /// the subject until [`MessageQueue::delete_message`] removes it.
    async fn get_message(
        &self,
        stream: &str,
        subject: &str,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<QueueMessage>, QueueError>;

    /// Remove one message from a subject by sequence number.
    async fn delete_message(
        &self,
        stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<(), QueueError>;

    /// Remove every message of one subject.
    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<(), QueueError>;

    /// Whether a stream with this name exists.
    async fn stream_exists(&self, stream: &str) -> Result<bool, QueueError>;

    /// Re-establish the broker connection.
    ///
    /// Brokers without a connection can keep the default.
    async fn reconnect(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
