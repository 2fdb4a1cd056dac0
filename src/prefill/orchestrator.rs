use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::source::PrefillSources;
use super::worker::{PrefillRequest, SimpleMessage};
use super::PrefillError;
use crate::model::{Event, PrefillStatus, PublisherName, Subscription, TopicPattern};
use crate::queue::names::{
    prefill_subject, PREFILL_FAILURES_STREAM, PREFILL_FAILURES_SUBJECT, PREFILL_QUEUE_STREAM,
};
use crate::queue::{encode, MessageQueue};
use crate::store::{StoreError, SubscriptionStore};

/// How a prefill run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefillOutcome {
    /// Every object was written; status is `done`.
    Done { events: usize },
    /// Status is `failed`; `reason` says why.
    Failed { reason: String },
    /// Nothing to do: the subscription is gone or already finished.
    Skipped { status: Option<PrefillStatus> },
}

/// Fills a subscriber's prefill queue with the current state of every object
/// it subscribes to and drives its prefill status.
pub struct PrefillOrchestrator {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn SubscriptionStore>,
    sources: PrefillSources,
}

impl PrefillOrchestrator {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn SubscriptionStore>,
        sources: PrefillSources,
    ) -> Self {
        Self {
            queue,
            store,
            sources,
        }
    }

    /// Run the prefill of subscription `name`.
    ///
    /// `pending` and `running` subscriptions are (re)filled from an empty
    /// prefill subject. Errors end in `failed`, except fatal broker errors,
    /// which are returned with the status left at `running` so a redelivered
    /// request can restart the fill.
    pub async fn prefill(&self, name: &str) -> Result<PrefillOutcome, PrefillError> {
        let Some(subscription) = self.store.get(name).await? else {
            warn!(subscription = %name, "prefill requested for unknown subscription");
            return Ok(PrefillOutcome::Skipped { status: None });
        };
        let status = subscription.prefill_status;
        if status.is_terminal() {
            debug!(subscription = %name, %status, "prefill already finished, skipping");
            return Ok(PrefillOutcome::Skipped {
                status: Some(status),
            });
        }
        if status == PrefillStatus::Running {
            warn!(subscription = %name, "restarting interrupted prefill");
        }

        self.store
            .set_prefill_status(name, PrefillStatus::Running)
            .await?;
        info!(subscription = %name, "prefill started");

        match self.fill(&subscription).await {
            Ok(events) => {
                self.store.set_prefill_status(name, PrefillStatus::Done).await?;
                info!(subscription = %name, events, "prefill done");
                Ok(PrefillOutcome::Done { events })
            }
            Err(err) if err.is_fatal() => {
                error!(subscription = %name, error = %err, "prefill aborted by broker failure");
                Err(err)
            }
            Err(err) => {
                error!(subscription = %name, error = %err, "prefill failed");
                self.store
                    .set_prefill_status(name, PrefillStatus::Failed)
                    .await?;
                Ok(PrefillOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Give up on the prefill of `name`: mark it `failed` and record why.
    ///
    /// Used when a run can no longer finish on its own, e.g. after a fatal
    /// broker error or too many redeliveries of its request. Finished and
    /// unknown subscriptions are left alone. Recording the failure is best
    /// effort.
    pub async fn abandon(&self, name: &str, reason: &str) -> Result<PrefillOutcome, PrefillError> {
        let Some(subscription) = self.store.get(name).await? else {
            return Ok(PrefillOutcome::Skipped { status: None });
        };
        let status = subscription.prefill_status;
        if status.is_terminal() {
            return Ok(PrefillOutcome::Skipped {
                status: Some(status),
            });
        }
        if status == PrefillStatus::Pending {
            self.store
                .set_prefill_status(name, PrefillStatus::Running)
                .await?;
        }
        match self.store.set_prefill_status(name, PrefillStatus::Failed).await {
            Ok(_) => {}
            // Deleted or finished concurrently.
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidTransition { .. }) => {
                return Ok(PrefillOutcome::Skipped { status: None });
            }
            Err(err) => return Err(err.into()),
        }
        error!(subscription = %name, reason, "prefill abandoned");
        if let Err(err) = self.record_failure(name, reason).await {
            warn!(subscription = %name, error = %err, "failed to record prefill failure");
        }
        Ok(PrefillOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    /// Append an operator-facing record to the prefill failure stream.
    pub async fn record_failure(&self, name: &str, reason: &str) -> Result<(), PrefillError> {
        let request = PrefillRequest {
            subscription_name: name.to_string(),
        };
        let record = SimpleMessage {
            publisher_name: PublisherName::UdmPreFill,
            ts: Utc::now(),
            body: json!({ "request": request, "error": reason }),
        };
        self.queue
            .ensure_stream(
                PREFILL_FAILURES_STREAM,
                true,
                Some(vec![PREFILL_FAILURES_SUBJECT.to_string()]),
            )
            .await?;
        self.queue
            .add_message(PREFILL_FAILURES_STREAM, PREFILL_FAILURES_SUBJECT, encode(&record)?)
            .await?;
        Ok(())
    }

    async fn fill(&self, subscription: &Subscription) -> Result<usize, PrefillError> {
        let subject = prefill_subject(&subscription.name);
        self.queue
            .ensure_stream(PREFILL_QUEUE_STREAM, true, Some(vec![subject.clone()]))
            .await?;
        self.queue.purge_subject(PREFILL_QUEUE_STREAM, &subject).await?;

        // Overlapping patterns must not enumerate a type twice.
        let mut object_types = BTreeSet::new();
        for rt in &subscription.realm_topics {
            let realm = rt.realm();
            let source = self
                .sources
                .get(realm)
                .ok_or(PrefillError::NoSourceForRealm(realm))?;
            let pattern = TopicPattern::new(rt.topic()).map_err(|e| PrefillError::InvalidTopic {
                topic: rt.topic().to_string(),
                reason: e.to_string(),
            })?;

            let mut matched = 0;
            for object_type in source.object_types().await? {
                if pattern.full_match(&object_type) {
                    matched += 1;
                    object_types.insert((realm, object_type));
                }
            }
            if matched == 0 {
                warn!(subscription = %subscription.name, %realm, topic = rt.topic(), "no object type matches topic");
            }
        }

        let mut events = 0;
        for (realm, object_type) in object_types {
            let source = self
                .sources
                .get(realm)
                .ok_or(PrefillError::NoSourceForRealm(realm))?;
            let objects = source.list_objects(&object_type).await?;
            debug!(
                subscription = %subscription.name,
                %realm,
                object_type = %object_type,
                count = objects.len(),
                "prefilling object type"
            );
            for object in objects {
                let event = Event::prefill(realm, object_type.as_str(), object)?;
                self.queue
                    .add_message(PREFILL_QUEUE_STREAM, &subject, encode(&event)?)
                    .await?;
                events += 1;
            }
        }
        Ok(events)
    }
}
