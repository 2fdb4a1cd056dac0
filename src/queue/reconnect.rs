//! Bounded reconnect around any [`MessageQueue`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use super::message::{Acknowledgements, QueueError, QueueMessage};
use super::port::{MessageQueue, PullSubscription};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Retries operations that fail with [`QueueError::ConnectionLost`].
///
/// Between attempts the inner queue is asked to reconnect, with a doubling
/// backoff. After `max_attempts` reconnects the operation fails with the fatal
/// [`QueueError::ReconnectExhausted`], which the owning loop must surface.
///
/// Pull subscriptions created through the wrapper are not retried: a lost
/// connection there is reported to the loop that owns the consumer.
pub struct Reconnecting<Q> {
    inner: Q,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl<Q: MessageQueue> Reconnecting<Q> {
    pub fn new(inner: Q, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts,
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    /// Set the delay before the first reconnect.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, QueueError>> + Send,
    {
        let mut attempts = 0u32;
        let mut backoff = self.initial_backoff;
        loop {
            let err = match op().await {
                Err(err) if err.is_transient() => err,
                other => return other,
            };
            if attempts >= self.max_attempts {
                error!(operation, attempts, error = %err, "giving up on broker connection");
                return Err(QueueError::ReconnectExhausted { attempts });
            }
            attempts += 1;
            warn!(operation, attempt = attempts, error = %err, "broker connection lost, reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            if let Err(err) = self.inner.reconnect().await {
                warn!(operation, attempt = attempts, error = %err, "reconnect failed");
            }
        }
    }
}

#[async_trait]
impl<Q: MessageQueue> MessageQueue for Reconnecting<Q> {
    async fn ensure_stream(
        &self,
        stream: &str,
        manual_delete: bool,
        subjects: Option<Vec<String>>,
    ) -> Result<(), QueueError> {
        self.retry("ensure_stream", || {
            self.inner.ensure_stream(stream, manual_delete, subjects.clone())
        })
        .await
    }

    async fn initialize_subscription(
        &self,
        stream: &str,
        manual_delete: bool,
        subject: Option<&str>,
    ) -> Result<Box<dyn PullSubscription>, QueueError> {
        self.retry("initialize_subscription", || {
            self.inner.initialize_subscription(stream, manual_delete, subject)
        })
        .await
    }

    async fn add_message(
        &self,
        stream: &str,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<u64, QueueError> {
        self.retry("add_message", || {
            self.inner.add_message(stream, subject, payload.clone())
        })
        .await
    }

    async fn get_message(
        &self,
        stream: &str,
        subject: &str,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<QueueMessage>, QueueError> {
        self.retry("get_message", || {
            self.inner.get_message(stream, subject, timeout, pop)
        })
        .await
    }

    async fn delete_message(
        &self,
        stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<(), QueueError> {
        self.retry("delete_message", || {
            self.inner.delete_message(stream, subject, sequence)
        })
        .await
    }

    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<(), QueueError> {
        self.retry("purge_subject", || self.inner.purge_subject(stream, subject))
            .await
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, QueueError> {
        self.retry("stream_exists", || self.inner.stream_exists(stream))
            .await
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        self.inner.reconnect().await
    }
}

/// A durable pull consumer that re-attaches after a lost connection.
///
/// Consecutive transient failures of `get_one_message` trigger a reconnect of
/// the queue and a fresh attach to the same stream. Once `max_attempts`
/// consecutive reconnects have failed, [`DurableConsumer::next`] returns the
/// fatal [`QueueError::ReconnectExhausted`].
pub struct DurableConsumer {
    queue: Arc<dyn MessageQueue>,
    stream: String,
    subject: Option<String>,
    manual_delete: bool,
    max_attempts: u32,
    subscription: Box<dyn PullSubscription>,
}

impl DurableConsumer {
    pub async fn attach(
        queue: Arc<dyn MessageQueue>,
        stream: &str,
        manual_delete: bool,
        subject: Option<&str>,
        max_attempts: u32,
    ) -> Result<Self, QueueError> {
        let subscription = queue
            .initialize_subscription(stream, manual_delete, subject)
            .await?;
        Ok(Self {
            queue,
            stream: stream.to_string(),
            subject: subject.map(str::to_string),
            manual_delete,
            max_attempts,
            subscription,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Pull one message, waiting up to `timeout`. `None` means nothing arrived.
    pub async fn next(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(QueueMessage, Acknowledgements)>, QueueError> {
        let mut attempts = 0u32;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let err = match self.subscription.get_one_message(timeout).await {
                Err(err) if err.is_transient() => err,
                other => return other,
            };
            if attempts >= self.max_attempts {
                error!(stream = %self.stream, attempts, error = %err, "giving up on consumer");
                return Err(QueueError::ReconnectExhausted { attempts });
            }
            attempts += 1;
            warn!(stream = %self.stream, attempt = attempts, error = %err, "consumer lost, re-attaching");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            if let Err(err) = self.reattach().await {
                warn!(stream = %self.stream, attempt = attempts, error = %err, "re-attach failed");
            }
        }
    }

    async fn reattach(&mut self) -> Result<(), QueueError> {
        self.queue.reconnect().await?;
        self.subscription = self
            .queue
            .initialize_subscription(&self.stream, self.manual_delete, self.subject.as_deref())
            .await?;
        Ok(())
    }
}
