//! Delivery read-path: one ordered stream per subscriber.
//!
//! A subscriber first drains its prefill subject, then reads its live
//! subject. While the prefill is pending or running nothing is served, so
//! every prefill snapshot reaches the consumer before any live event that
//! might supersede it.
//!
//! ```text
//! status pending/running ──► nothing
//! status done/failed ─┬─► prefill-queue/<name>.prefill has a message ──► serve it
//!                     └─► empty: done   -> mark consumed (sticky) ──► dispatch/<name>.main
//!                                failed -> nothing
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{PrefillStatus, ProvisioningMessage};
use crate::queue::names::{live_subject, prefill_subject, DISPATCH_STREAM, PREFILL_QUEUE_STREAM};
use crate::queue::{MessageQueue, QueueError, QueueMessage};
use crate::store::{StoreError, SubscriptionStore};

/// Reads shorter than this are raised to it.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Error type for the read-path.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result a consumer reports for a processed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageProcessingStatus {
    Ok,
}

/// Serves subscriber reads and confirmations.
pub struct MessageService {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn SubscriptionStore>,
    prefill_consumed: Mutex<HashSet<String>>,
}

impl MessageService {
    pub fn new(queue: Arc<dyn MessageQueue>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            queue,
            store,
            prefill_consumed: Mutex::new(HashSet::new()),
        }
    }

    fn consumed(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.prefill_consumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `name` has drained its prefill queue.
    pub fn prefill_consumed(&self, name: &str) -> bool {
        self.consumed().contains(name)
    }

    /// Drop local read state, e.g. after the subscription was deleted.
    pub fn forget(&self, name: &str) {
        self.consumed().remove(name);
    }

    /// Next message for subscriber `name`, or `None` if nothing arrived in
    /// `timeout`. With `pop` the message is removed, otherwise it stays at
    /// the head until [`update_message_status`](Self::update_message_status).
    pub async fn get_next_message(
        &self,
        name: &str,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<ProvisioningMessage>, DeliveryError> {
        let timeout = timeout.max(MIN_TIMEOUT);
        let subscription = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| DeliveryError::SubscriptionNotFound(name.to_string()))?;

        if !self.prefill_consumed(name) {
            let status = subscription.prefill_status;
            if !status.is_terminal() {
                debug!(subscription = %name, %status, "prefill not finished, nothing to deliver");
                return Ok(None);
            }
            // The prefill subject is complete once the status is terminal.
            let head = match self
                .queue
                .get_message(PREFILL_QUEUE_STREAM, &prefill_subject(name), Duration::ZERO, pop)
                .await
            {
                Err(QueueError::StreamNotFound(_)) => None,
                other => other?,
            };
            if let Some(message) = head {
                return decode(&message).map(Some);
            }
            if status == PrefillStatus::Failed {
                debug!(subscription = %name, "prefill failed, live queue withheld");
                return Ok(None);
            }
            self.consumed().insert(name.to_string());
            info!(subscription = %name, "prefill consumed, switching to live queue");
        }

        let message = self
            .queue
            .get_message(DISPATCH_STREAM, &live_subject(name), timeout, pop)
            .await?;
        message.as_ref().map(decode).transpose()
    }

    /// Up to `count` messages. Without `pop` at most one is returned, since
    /// the head stays in place until confirmed. Only the first read waits.
    pub async fn get_messages(
        &self,
        name: &str,
        timeout: Duration,
        pop: bool,
        count: usize,
    ) -> Result<Vec<ProvisioningMessage>, DeliveryError> {
        let count = if pop { count.max(1) } else { 1 };
        let mut messages = Vec::with_capacity(count);
        let mut wait = timeout;
        while messages.len() < count {
            match self.get_next_message(name, wait, pop).await? {
                Some(message) => messages.push(message),
                None => break,
            }
            wait = Duration::ZERO;
        }
        Ok(messages)
    }

    /// Confirm a message: it is deleted from whichever subscriber queue holds
    /// `sequence_number`.
    pub async fn update_message_status(
        &self,
        name: &str,
        sequence_number: u64,
        status: MessageProcessingStatus,
    ) -> Result<(), DeliveryError> {
        if self.store.get(name).await?.is_none() {
            return Err(DeliveryError::SubscriptionNotFound(name.to_string()));
        }
        let MessageProcessingStatus::Ok = status;

        if !self.prefill_consumed(name) {
            match self
                .queue
                .delete_message(PREFILL_QUEUE_STREAM, &prefill_subject(name), sequence_number)
                .await
            {
                Ok(()) => {
                    debug!(subscription = %name, sequence_number, "prefill message confirmed");
                    return Ok(());
                }
                Err(QueueError::MessageNotFound { .. }) | Err(QueueError::StreamNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.queue
            .delete_message(DISPATCH_STREAM, &live_subject(name), sequence_number)
            .await?;
        debug!(subscription = %name, sequence_number, "message confirmed");
        Ok(())
    }
}

fn decode(message: &QueueMessage) -> Result<ProvisioningMessage, DeliveryError> {
    Ok(ProvisioningMessage::from_queue(message)?)
}
