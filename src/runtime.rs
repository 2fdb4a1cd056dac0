//! Process wiring: builds every component from one [`Config`] and runs the
//! background loops as tokio tasks.
//!
//! ```text
//! Provisioning
//!   ├── SubscriptionService ─┐
//!   ├── MessageService ──────┼── HTTP (feature `http`)
//!   ├── EventIngestor ───────┘
//!   ├── spawn_dispatcher()     -> WorkerHandle<DispatcherStats, DispatchError>
//!   └── spawn_prefill_worker() -> WorkerHandle<PrefillWorkerStats, PrefillError>
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{EventIngestor, SubscriptionService};
use crate::config::{Config, ConfigError};
use crate::delivery::MessageService;
use crate::dispatcher::{DispatchError, Dispatcher, DispatcherStats};
use crate::lease::AckLeaseManager;
use crate::prefill::{
    PrefillError, PrefillOrchestrator, PrefillSources, PrefillWorker, PrefillWorkerStats,
};
use crate::queue::names::{
    DISPATCH_STREAM, INCOMING_STREAM, INCOMING_SUBJECT, PREFILL_FAILURES_STREAM,
    PREFILL_FAILURES_SUBJECT, PREFILL_QUEUE_STREAM, PREFILL_REQUEST_STREAM,
    PREFILL_REQUEST_SUBJECT,
};
use crate::queue::{InMemoryBroker, MessageQueue, QueueError, Reconnecting};
use crate::store::{InMemorySubscriptionStore, SubscriptionStore};

/// Error returned when a background worker ends.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError<E> {
    #[error("worker {name} failed: {error}")]
    Failed { name: &'static str, error: E },
    #[error("worker {name} panicked: {reason}")]
    Panicked { name: &'static str, reason: String },
}

/// A background loop running as a tokio task.
///
/// ## Example
///
/// ```ignore
/// let worker = provisioning.spawn_dispatcher();
///
/// // ... serve requests ...
///
/// // Stop the worker and get stats
/// let stats = worker.stop().await?;
/// println!("Dispatched {} events", stats.dispatched);
/// ```
pub struct WorkerHandle<S, E> {
    name: &'static str,
    cancel: CancellationToken,
    done: CancellationToken,
    handle: JoinHandle<Result<S, E>>,
}

impl<S, E> WorkerHandle<S, E>
where
    S: Send + 'static,
    E: Send + 'static,
{
    /// Spawn `run` with a fresh cancellation token.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let task = run(cancel.clone());
        let finished = done.clone();
        let handle = tokio::spawn(async move {
            let result = task.await;
            finished.cancel();
            result
        });
        Self {
            name,
            cancel,
            done,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Resolves once the worker has exited on its own or been stopped.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Cancel the worker and wait for it to exit.
    pub async fn stop(self) -> Result<S, WorkerError<E>> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the worker to exit without cancelling it.
    pub async fn join(self) -> Result<S, WorkerError<E>> {
        let name = self.name;
        match self.handle.await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(error)) => Err(WorkerError::Failed { name, error }),
            Err(err) => Err(WorkerError::Panicked {
                name,
                reason: err.to_string(),
            }),
        }
    }
}

/// Every component of the service, built from one configuration.
pub struct Provisioning {
    config: Config,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn SubscriptionStore>,
    lease: AckLeaseManager,
    orchestrator: Arc<PrefillOrchestrator>,
    messages: Arc<MessageService>,
    subscriptions: Arc<SubscriptionService>,
    ingestor: Arc<EventIngestor>,
}

impl Provisioning {
    /// Validate `config` and build the services.
    ///
    /// Every registered realm needs an object source; a missing one is a
    /// configuration error.
    pub fn new(
        config: Config,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn SubscriptionStore>,
        sources: PrefillSources,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(realm) = sources.missing().first() {
            return Err(ConfigError::MissingSource(realm.to_string()));
        }
        let lease = AckLeaseManager::new(config.ack_wait(), config.ack_threshold()).map_err(|_| {
            ConfigError::AckThreshold {
                ack_wait: config.ack_wait_secs,
                threshold: config.ack_threshold_secs,
            }
        })?;

        let orchestrator = Arc::new(PrefillOrchestrator::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            sources,
        ));
        let messages = Arc::new(MessageService::new(Arc::clone(&queue), Arc::clone(&store)));
        let subscriptions = Arc::new(
            SubscriptionService::new(
                Arc::clone(&queue),
                Arc::clone(&store),
                Arc::clone(&messages),
                Arc::clone(&orchestrator),
            )
            .with_prefill_mode(config.prefill_mode),
        );
        let ingestor = Arc::new(EventIngestor::new(Arc::clone(&queue)));

        Ok(Self {
            config,
            queue,
            store,
            lease,
            orchestrator,
            messages,
            subscriptions,
            ingestor,
        })
    }

    /// Build over the in-memory broker and store, with bounded reconnects.
    pub fn in_memory(config: Config, sources: PrefillSources) -> Result<Self, ConfigError> {
        let broker = InMemoryBroker::new().with_ack_wait(config.ack_wait());
        let queue = Reconnecting::new(broker, config.max_reconnect_attempts);
        Self::new(
            config,
            Arc::new(queue),
            Arc::new(InMemorySubscriptionStore::new()),
            sources,
        )
    }

    /// Create every stream the service uses.
    pub async fn init_streams(&self) -> Result<(), QueueError> {
        self.queue
            .ensure_stream(INCOMING_STREAM, false, Some(vec![INCOMING_SUBJECT.to_string()]))
            .await?;
        self.queue
            .ensure_stream(PREFILL_REQUEST_STREAM, false, Some(vec![PREFILL_REQUEST_SUBJECT.to_string()]))
            .await?;
        self.queue
            .ensure_stream(PREFILL_FAILURES_STREAM, true, Some(vec![PREFILL_FAILURES_SUBJECT.to_string()]))
            .await?;
        self.queue.ensure_stream(DISPATCH_STREAM, true, Some(Vec::new())).await?;
        self.queue
            .ensure_stream(PREFILL_QUEUE_STREAM, true, Some(Vec::new()))
            .await?;
        info!("streams initialized");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<PrefillOrchestrator> {
        &self.orchestrator
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionService> {
        &self.subscriptions
    }

    pub fn messages(&self) -> &Arc<MessageService> {
        &self.messages
    }

    pub fn ingestor(&self) -> &Arc<EventIngestor> {
        &self.ingestor
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.queue), Arc::clone(&self.store))
            .with_poll_timeout(self.config.dispatcher_poll_timeout())
            .with_max_reconnect_attempts(self.config.max_reconnect_attempts)
    }

    pub fn prefill_worker(&self) -> PrefillWorker {
        PrefillWorker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.orchestrator),
            self.lease,
        )
        .with_poll_timeout(self.config.prefill_poll_timeout())
        .with_max_reconnect_attempts(self.config.max_reconnect_attempts)
        .with_max_attempts(self.config.max_prefill_attempts)
    }

    pub fn spawn_dispatcher(&self) -> WorkerHandle<DispatcherStats, DispatchError> {
        let dispatcher = self.dispatcher();
        WorkerHandle::spawn("dispatcher", move |cancel| async move {
            dispatcher.run(cancel).await
        })
    }

    pub fn spawn_prefill_worker(&self) -> WorkerHandle<PrefillWorkerStats, PrefillError> {
        let worker = self.prefill_worker();
        WorkerHandle::spawn("prefill-worker", move |cancel| async move {
            worker.run(cancel).await
        })
    }

    /// State for the HTTP router.
    #[cfg(feature = "http")]
    pub fn app_state(&self) -> crate::api::http::AppState {
        crate::api::http::AppState {
            subscriptions: Arc::clone(&self.subscriptions),
            messages: Arc::clone(&self.messages),
            ingestor: Arc::clone(&self.ingestor),
            default_timeout: self.config.default_message_timeout(),
        }
    }
}
