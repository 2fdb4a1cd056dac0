use std::sync::Arc;

use tracing::{error, info, warn};

use super::ServiceError;
use crate::config::PrefillMode;
use crate::delivery::MessageService;
use crate::model::{NewSubscription, PrefillStatus, Subscription};
use crate::prefill::{PrefillOrchestrator, PrefillOutcome, PrefillRequest};
use crate::queue::names::{
    live_subject, prefill_subject, DISPATCH_STREAM, PREFILL_QUEUE_STREAM, PREFILL_REQUEST_STREAM,
    PREFILL_REQUEST_SUBJECT,
};
use crate::queue::{encode, MessageQueue, QueueError};
use crate::store::SubscriptionStore;

/// Result of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(Subscription),
    /// An identical registration already existed; nothing changed.
    AlreadyExists(Subscription),
}

impl Registration {
    pub fn subscription(&self) -> &Subscription {
        match self {
            Registration::Created(s) | Registration::AlreadyExists(s) => s,
        }
    }
}

/// Registration, lookup and removal of subscriptions.
pub struct SubscriptionService {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn SubscriptionStore>,
    messages: Arc<MessageService>,
    orchestrator: Arc<PrefillOrchestrator>,
    prefill_mode: PrefillMode,
}

impl SubscriptionService {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn SubscriptionStore>,
        messages: Arc<MessageService>,
        orchestrator: Arc<PrefillOrchestrator>,
    ) -> Self {
        Self {
            queue,
            store,
            messages,
            orchestrator,
            prefill_mode: PrefillMode::default(),
        }
    }

    pub fn with_prefill_mode(mut self, mode: PrefillMode) -> Self {
        self.prefill_mode = mode;
        self
    }

    /// Register a subscription and start its prefill if requested.
    ///
    /// Registering the same settings again is a no-op; different settings
    /// under an existing name are a [`ServiceError::Conflict`].
    pub async fn register(&self, new: NewSubscription) -> Result<Registration, ServiceError> {
        let subscription = new.into_subscription()?;
        let name = subscription.name.clone();

        self.queue
            .ensure_stream(DISPATCH_STREAM, true, Some(vec![live_subject(&name)]))
            .await?;
        self.queue
            .ensure_stream(PREFILL_QUEUE_STREAM, true, Some(vec![prefill_subject(&name)]))
            .await?;

        match self.store.put_if_absent(subscription.clone()).await? {
            Some(existing) if existing.same_registration(&subscription) => {
                info!(subscription = %name, "subscription already registered");
                return Ok(Registration::AlreadyExists(existing));
            }
            Some(_) => return Err(ServiceError::Conflict(name)),
            None => {}
        }
        // A reused name may still hold copies routed to the previous owner.
        if let Err(err) = self.purge_queues(&name).await {
            error!(subscription = %name, error = %err, "could not clear queues, rolling back registration");
            self.roll_back(&name).await;
            return Err(err);
        }
        self.messages.forget(&name);

        if subscription.request_prefill {
            if let Err(err) = self.trigger_prefill(&name).await {
                error!(subscription = %name, error = %err, "could not start prefill, rolling back registration");
                self.roll_back(&name).await;
                return Err(err);
            }
        }
        info!(subscription = %name, request_prefill = subscription.request_prefill, "subscription registered");
        Ok(Registration::Created(subscription))
    }

    async fn roll_back(&self, name: &str) {
        if let Err(err) = self.store.delete(name).await {
            warn!(subscription = %name, error = %err, "rollback failed");
        }
    }

    async fn trigger_prefill(&self, name: &str) -> Result<(), ServiceError> {
        match self.prefill_mode {
            PrefillMode::Queue => {
                let request = PrefillRequest {
                    subscription_name: name.to_string(),
                };
                self.queue
                    .ensure_stream(
                        PREFILL_REQUEST_STREAM,
                        false,
                        Some(vec![PREFILL_REQUEST_SUBJECT.to_string()]),
                    )
                    .await?;
                self.queue
                    .add_message(PREFILL_REQUEST_STREAM, PREFILL_REQUEST_SUBJECT, encode(&request)?)
                    .await?;
                info!(subscription = %name, "prefill requested");
            }
            PrefillMode::Spawn => {
                let orchestrator = Arc::clone(&self.orchestrator);
                let name = name.to_string();
                tokio::spawn(async move {
                    match orchestrator.prefill(&name).await {
                        Ok(PrefillOutcome::Failed { reason }) => {
                            if let Err(err) = orchestrator.record_failure(&name, &reason).await {
                                warn!(subscription = %name, error = %err, "failed to record prefill failure");
                            }
                        }
                        Ok(_) => {}
                        // Nothing retries a spawned prefill, so it must not stay running.
                        Err(err) => {
                            error!(subscription = %name, error = %err, "prefill task failed");
                            if let Err(err) = orchestrator.abandon(&name, &err.to_string()).await {
                                warn!(subscription = %name, error = %err, "could not abandon prefill");
                            }
                        }
                    }
                });
            }
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Subscription, ServiceError> {
        self.store
            .get(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Subscription>, ServiceError> {
        Ok(self.store.list().await?)
    }

    /// Remove a subscription together with both of its queues.
    ///
    /// The record goes first, so the dispatcher stops routing to the name
    /// before its queues are emptied.
    pub async fn delete(&self, name: &str) -> Result<(), ServiceError> {
        if !self.store.delete(name).await? {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        self.messages.forget(name);
        self.purge_queues(name).await?;
        info!(subscription = %name, "subscription removed");
        Ok(())
    }

    async fn purge_queues(&self, name: &str) -> Result<(), ServiceError> {
        for (stream, subject) in [
            (DISPATCH_STREAM, live_subject(name)),
            (PREFILL_QUEUE_STREAM, prefill_subject(name)),
        ] {
            match self.queue.purge_subject(stream, &subject).await {
                Ok(()) | Err(QueueError::StreamNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Set the prefill status by hand. The state machine still applies.
    pub async fn set_prefill_status(
        &self,
        name: &str,
        status: PrefillStatus,
    ) -> Result<Subscription, ServiceError> {
        Ok(self.store.set_prefill_status(name, status).await?)
    }
}
