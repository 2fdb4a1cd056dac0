use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::orchestrator::{PrefillOrchestrator, PrefillOutcome};
use super::PrefillError;
use crate::lease::AckLeaseManager;
use crate::model::PublisherName;
use crate::queue::names::{
    PREFILL_FAILURES_STREAM, PREFILL_FAILURES_SUBJECT, PREFILL_REQUEST_STREAM,
    PREFILL_REQUEST_SUBJECT,
};
use crate::queue::{Acknowledgements, DurableConsumer, MessageQueue, QueueError, QueueMessage};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job on the prefill request stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefillRequest {
    pub subscription_name: String,
}

/// Operator-facing record of a failed prefill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleMessage {
    pub publisher_name: PublisherName,
    pub ts: DateTime<Utc>,
    pub body: Value,
}

/// Counters reported when the worker stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrefillWorkerStats {
    pub polls: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Payloads that are not prefill requests.
    pub dropped: usize,
}

/// Background consumer of prefill requests.
///
/// Each request runs under the [`AckLeaseManager`] so a long fill is not
/// redelivered to another worker. The request is acknowledged once the
/// orchestrator has finished, whether the prefill succeeded or failed; it
/// is negatively acknowledged only when a fatal broker error stops the worker.
/// A request delivered more than `max_attempts` times is not run again: the
/// prefill is marked `failed` instead.
pub struct PrefillWorker {
    queue: Arc<dyn MessageQueue>,
    orchestrator: Arc<PrefillOrchestrator>,
    lease: AckLeaseManager,
    poll_timeout: Duration,
    max_reconnect_attempts: u32,
    max_attempts: Option<u32>,
}

impl PrefillWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        orchestrator: Arc<PrefillOrchestrator>,
        lease: AckLeaseManager,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            lease,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Deliveries of one request before its prefill is abandoned. `0` means
    /// no limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = (attempts > 0).then_some(attempts);
        self
    }

    /// Run until `cancel` fires or a fatal broker error occurs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PrefillWorkerStats, PrefillError> {
        self.queue
            .ensure_stream(
                PREFILL_FAILURES_STREAM,
                true,
                Some(vec![PREFILL_FAILURES_SUBJECT.to_string()]),
            )
            .await?;
        self.queue
            .ensure_stream(
                PREFILL_REQUEST_STREAM,
                false,
                Some(vec![PREFILL_REQUEST_SUBJECT.to_string()]),
            )
            .await?;
        let mut consumer = DurableConsumer::attach(
            Arc::clone(&self.queue),
            PREFILL_REQUEST_STREAM,
            false,
            Some(PREFILL_REQUEST_SUBJECT),
            self.max_reconnect_attempts,
        )
        .await?;
        info!("prefill worker started");

        let mut stats = PrefillWorkerStats::default();
        loop {
            stats.polls += 1;
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = consumer.next(self.poll_timeout) => next,
            };
            let next = match next {
                Ok(next) => next,
                Err(err) => {
                    error!(error = %err, "prefill worker aborted");
                    return Err(err.into());
                }
            };
            let Some((message, acks)) = next else {
                continue;
            };
            if let Err(err) = self.handle(&message, &acks, &mut stats).await {
                error!(error = %err, "prefill worker aborted");
                return Err(err);
            }
        }
        info!(?stats, "prefill worker stopped");
        Ok(stats)
    }

    async fn handle(
        &self,
        message: &QueueMessage,
        acks: &Acknowledgements,
        stats: &mut PrefillWorkerStats,
    ) -> Result<(), PrefillError> {
        let request: PrefillRequest = match message.decode() {
            Ok(request) => request,
            Err(err) => {
                error!(sequence = message.sequence_number, error = %err, "dropping invalid prefill request");
                stats.dropped += 1;
                return settle(acks.acknowledge().await);
            }
        };
        let name = request.subscription_name.as_str();
        info!(subscription = %name, delivery = message.delivery_count, "prefill request received");

        if let Some(max) = self.max_attempts.filter(|max| message.delivery_count > *max) {
            let reason = format!("prefill not finished after {max} attempts");
            match self.orchestrator.abandon(name, &reason).await {
                Ok(PrefillOutcome::Failed { .. }) => stats.failed += 1,
                Ok(_) => stats.skipped += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(subscription = %name, error = %err, "could not abandon prefill");
                    stats.failed += 1;
                }
            }
            return settle(acks.acknowledge().await);
        }

        let result = self
            .lease
            .process_with_lease_extension(self.orchestrator.prefill(name), move || {
                acks.acknowledge_in_progress()
            })
            .await;

        match result {
            Ok(PrefillOutcome::Done { .. }) => stats.completed += 1,
            Ok(PrefillOutcome::Skipped { .. }) => stats.skipped += 1,
            Ok(PrefillOutcome::Failed { reason }) => {
                stats.failed += 1;
                self.record_failure(name, &reason).await?;
            }
            Err(err) if err.is_fatal() => {
                if let Err(nack) = acks.acknowledge_negatively().await {
                    warn!(subscription = %name, error = %nack, "failed to nack prefill request");
                }
                return Err(err);
            }
            Err(err) => {
                stats.failed += 1;
                error!(subscription = %name, error = %err, "prefill request failed");
                match self.orchestrator.abandon(name, &err.to_string()).await {
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => warn!(subscription = %name, error = %err, "could not abandon prefill"),
                    Ok(_) => {}
                }
            }
        }
        settle(acks.acknowledge().await)
    }

    async fn record_failure(&self, name: &str, reason: &str) -> Result<(), PrefillError> {
        match self.orchestrator.record_failure(name, reason).await {
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(subscription = %name, error = %err, "failed to record prefill failure");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

fn settle(result: Result<(), QueueError>) -> Result<(), PrefillError> {
    match result {
        Err(err) if err.is_fatal() => Err(err.into()),
        Err(err) => {
            warn!(error = %err, "failed to settle prefill request");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
