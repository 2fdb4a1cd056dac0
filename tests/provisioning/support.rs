//! Shared fixtures: a wired service over the in-memory broker, fault
//! injecting fakes and polling helpers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provisioning_rust::queue::names::{DISPATCH_STREAM, PREFILL_QUEUE_STREAM};
use provisioning_rust::{
    Acknowledgements, Config, IngestRequest, InMemoryBroker, InMemorySubscriptionStore,
    MessageQueue, ObjectSource, PrefillMode, PrefillSources, Provisioning, PullSubscription,
    QueueError, QueueMessage, Realm, SourceError, StaticObjectSource,
};
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

pub fn config(mode: PrefillMode) -> Config {
    Config {
        dispatcher_poll_timeout_ms: 50,
        prefill_poll_timeout_ms: 50,
        default_message_timeout_ms: 200,
        max_reconnect_attempts: 2,
        prefill_mode: mode,
        ..Config::default()
    }
}

/// A fully wired service whose broker and store can be inspected.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub store: InMemorySubscriptionStore,
    pub provisioning: Provisioning,
}

impl Harness {
    pub async fn new(source: Arc<dyn ObjectSource>) -> Self {
        Self::with_mode(source, PrefillMode::Queue).await
    }

    pub async fn with_mode(source: Arc<dyn ObjectSource>, mode: PrefillMode) -> Self {
        let broker = InMemoryBroker::new();
        Self::with_queue(Arc::new(broker.clone()), broker, source, mode).await
    }

    /// `queue` must be backed by `broker`.
    pub async fn with_queue(
        queue: Arc<dyn MessageQueue>,
        broker: InMemoryBroker,
        source: Arc<dyn ObjectSource>,
        mode: PrefillMode,
    ) -> Self {
        let store = InMemorySubscriptionStore::new();
        let provisioning = Provisioning::new(
            config(mode),
            queue,
            Arc::new(store.clone()),
            PrefillSources::new().with_source(Realm::Udm, source),
        )
        .unwrap();
        provisioning.init_streams().await.unwrap();
        Self {
            broker,
            store,
            provisioning,
        }
    }
}

pub fn user(dn: &str) -> Value {
    json!({ "dn": dn, "objectType": "users/user", "properties": { "username": dn } })
}

pub fn users(dns: &[&str]) -> StaticObjectSource {
    StaticObjectSource::new().with_objects("users/user", dns.iter().map(|dn| user(dn)))
}

pub fn created(topic: &str, dn: &str) -> IngestRequest {
    serde_json::from_value(json!({
        "realm": "udm",
        "topic": topic,
        "body": { "old": null, "new": { "dn": dn } }
    }))
    .unwrap()
}

/// Poll `check` every 10ms until it holds; panic after 5s.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Object source whose listing blocks until [`GatedSource::open`].
pub struct GatedSource {
    inner: StaticObjectSource,
    open: AtomicBool,
    notify: Notify,
}

impl GatedSource {
    pub fn new(inner: StaticObjectSource) -> Self {
        Self {
            inner,
            open: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl ObjectSource for GatedSource {
    async fn object_types(&self) -> Result<Vec<String>, SourceError> {
        self.inner.object_types().await
    }

    async fn list_objects(&self, object_type: &str) -> Result<Vec<Map<String, Value>>, SourceError> {
        loop {
            let notified = self.notify.notified();
            if self.open.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        self.inner.list_objects(object_type).await
    }
}

/// Object source that knows its types but cannot list them.
pub struct FailingSource;

#[async_trait]
impl ObjectSource for FailingSource {
    async fn object_types(&self) -> Result<Vec<String>, SourceError> {
        Ok(vec!["users/user".to_string()])
    }

    async fn list_objects(&self, _: &str) -> Result<Vec<Map<String, Value>>, SourceError> {
        Err(SourceError("LDAP server down".to_string()))
    }
}

/// In-memory broker with injectable faults.
pub struct FlakyQueue {
    inner: InMemoryBroker,
    fail_dispatch_write: AtomicUsize,
    dispatch_writes: AtomicUsize,
    lose_consumers: AtomicBool,
    fail_prefill_writes: AtomicBool,
    fail_reloads: AtomicBool,
}

impl FlakyQueue {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            fail_dispatch_write: AtomicUsize::new(0),
            dispatch_writes: AtomicUsize::new(0),
            lose_consumers: AtomicBool::new(false),
            fail_prefill_writes: AtomicBool::new(false),
            fail_reloads: AtomicBool::new(false),
        }
    }

    /// Reject the `n`th write (1-based) to the live-dispatch stream.
    pub fn failing_dispatch_write(self, n: usize) -> Self {
        self.fail_dispatch_write.store(n, Ordering::SeqCst);
        self
    }

    /// Every pull subscription loses its connection on each pull.
    pub fn losing_consumers(self) -> Self {
        self.lose_consumers.store(true, Ordering::SeqCst);
        self
    }

    /// Writes to the prefill queue stream fail as if the broker were gone.
    pub fn failing_prefill_writes(self) -> Self {
        self.fail_prefill_writes.store(true, Ordering::SeqCst);
        self
    }

    /// From now on, declaring the live-dispatch stream fails as if the
    /// broker were gone.
    pub fn fail_reloads(&self) {
        self.fail_reloads.store(true, Ordering::SeqCst);
    }
}

fn gone() -> QueueError {
    QueueError::ReconnectExhausted { attempts: 2 }
}

#[async_trait]
impl MessageQueue for FlakyQueue {
    async fn ensure_stream(
        &self,
        stream: &str,
        manual_delete: bool,
        subjects: Option<Vec<String>>,
    ) -> Result<(), QueueError> {
        if stream == DISPATCH_STREAM && self.fail_reloads.load(Ordering::SeqCst) {
            return Err(gone());
        }
        self.inner.ensure_stream(stream, manual_delete, subjects).await
    }

    async fn initialize_subscription(
        &self,
        stream: &str,
        manual_delete: bool,
        subject: Option<&str>,
    ) -> Result<Box<dyn PullSubscription>, QueueError> {
        let subscription = self
            .inner
            .initialize_subscription(stream, manual_delete, subject)
            .await?;
        if self.lose_consumers.load(Ordering::SeqCst) {
            return Ok(Box::new(LostSubscription));
        }
        Ok(subscription)
    }

    async fn add_message(
        &self,
        stream: &str,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<u64, QueueError> {
        if stream == DISPATCH_STREAM {
            let n = self.dispatch_writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_dispatch_write.load(Ordering::SeqCst) {
                return Err(QueueError::Rejected(format!("injected failure on write {n}")));
            }
        }
        if stream == PREFILL_QUEUE_STREAM && self.fail_prefill_writes.load(Ordering::SeqCst) {
            return Err(gone());
        }
        self.inner.add_message(stream, subject, payload).await
    }

    async fn get_message(
        &self,
        stream: &str,
        subject: &str,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<QueueMessage>, QueueError> {
        self.inner.get_message(stream, subject, timeout, pop).await
    }

    async fn delete_message(
        &self,
        stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<(), QueueError> {
        self.inner.delete_message(stream, subject, sequence).await
    }

    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<(), QueueError> {
        self.inner.purge_subject(stream, subject).await
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, QueueError> {
        self.inner.stream_exists(stream).await
    }
}

struct LostSubscription;

#[async_trait]
impl PullSubscription for LostSubscription {
    async fn get_one_message(
        &self,
        _timeout: Duration,
    ) -> Result<Option<(QueueMessage, Acknowledgements)>, QueueError> {
        Err(QueueError::ConnectionLost("broker went away".to_string()))
    }
}
