use std::sync::Arc;

use tracing::debug;

use super::ServiceError;
use crate::model::{Event, IngestRequest};
use crate::queue::names::{INCOMING_STREAM, INCOMING_SUBJECT};
use crate::queue::{encode, MessageQueue, QueueError};

/// Validates raw change events and places them on the incoming stream.
pub struct EventIngestor {
    queue: Arc<dyn MessageQueue>,
}

impl EventIngestor {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    /// Accept one event. Malformed input is rejected before anything is
    /// written.
    pub async fn ingest(&self, request: IngestRequest) -> Result<Event, ServiceError> {
        let event = request.into_event()?;
        let payload = encode(&event)?;
        let sequence = match self
            .queue
            .add_message(INCOMING_STREAM, INCOMING_SUBJECT, payload.clone())
            .await
        {
            Err(QueueError::StreamNotFound(_)) => {
                self.queue
                    .ensure_stream(INCOMING_STREAM, false, Some(vec![INCOMING_SUBJECT.to_string()]))
                    .await?;
                self.queue
                    .add_message(INCOMING_STREAM, INCOMING_SUBJECT, payload)
                    .await?
            }
            other => other?,
        };
        debug!(sequence, realm = %event.realm(), topic = event.topic(), "event ingested");
        Ok(event)
    }
}
