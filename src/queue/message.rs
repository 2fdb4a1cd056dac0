//! Broker-level message envelope, acknowledgement handles and errors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A message as delivered by the broker.
///
/// Opaque to business logic apart from the payload, which callers decode
/// with [`QueueMessage::decode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    /// Subject the message was published to.
    pub subject: String,
    /// Broker reply-to address identifying this delivery.
    pub reply: String,
    /// Serialized payload (JSON).
    pub payload: Vec<u8>,
    /// How many times this message has been handed out, starting at 1.
    pub delivery_count: u32,
    /// Stream sequence number, unique within one stream.
    pub sequence_number: u64,
    /// Optional broker headers.
    pub headers: Option<BTreeMap<String, String>>,
}

impl QueueMessage {
    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_slice(&self.payload).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Serialize a value into a queue payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(value).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The named stream does not exist.
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    /// No durable consumer exists for the stream.
    #[error("consumer not found for stream: {0}")]
    ConsumerNotFound(String),
    /// No message with this sequence number on the given subject.
    #[error("message {sequence} not found in stream {stream}")]
    MessageNotFound { stream: String, sequence: u64 },
    /// Connection to the broker was lost; the operation may be retried.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Reconnecting failed too often. Fatal for the owning loop.
    #[error("broker unreachable after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    /// Encoding or decoding a payload failed.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The broker rejected the operation.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl QueueError {
    /// Whether the error must abort the component that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::ReconnectExhausted { .. })
    }

    /// Whether a reconnect and retry could make the operation succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::ConnectionLost(_))
    }
}

/// Broker-side settlement of one delivered message.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Final: the message is done and removed.
    async fn ack(&self) -> Result<(), QueueError>;

    /// Final: make the message available for redelivery right away.
    async fn nack(&self) -> Result<(), QueueError>;

    /// Not final: extend the processing lease.
    async fn in_progress(&self) -> Result<(), QueueError>;
}

/// The three acknowledgement callbacks bound to one delivered message.
#[derive(Clone)]
pub struct Acknowledgements {
    handle: Arc<dyn AckHandle>,
}

impl Acknowledgements {
    pub fn new(handle: Arc<dyn AckHandle>) -> Self {
        Self { handle }
    }

    /// Acknowledge the message (final, removes it).
    pub async fn acknowledge(&self) -> Result<(), QueueError> {
        self.handle.ack().await
    }

    /// Acknowledge negatively (final, triggers redelivery).
    pub async fn acknowledge_negatively(&self) -> Result<(), QueueError> {
        self.handle.nack().await
    }

    /// Acknowledge in progress (non-final, extends the lease).
    pub async fn acknowledge_in_progress(&self) -> Result<(), QueueError> {
        self.handle.in_progress().await
    }
}

impl fmt::Debug for Acknowledgements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgements").finish_non_exhaustive()
    }
}
