pub mod api;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod lease;
pub mod model;
pub mod prefill;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod telemetry;

pub use api::{EventIngestor, Registration, ServiceError, SubscriptionService};
pub use config::{Config, ConfigError, PrefillMode};
pub use delivery::{DeliveryError, MessageProcessingStatus, MessageService};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherStats, SubscriptionMapping};
pub use lease::{AckLeaseManager, LeaseError};
pub use model::{
    topic_matches, Event, EventError, IngestRequest, NewSubscription, PrefillStatus,
    ProvisioningMessage, PublisherName, Realm, RealmTopic, Subscription, SubscriptionError,
};
pub use prefill::{
    ObjectSource, PrefillError, PrefillOrchestrator, PrefillOutcome, PrefillRequest,
    PrefillSources, PrefillWorker, PrefillWorkerStats, SourceError, StaticObjectSource,
};
pub use queue::{
    Acknowledgements, DurableConsumer, InMemoryBroker, MessageQueue, PullSubscription,
    QueueError, QueueMessage, Reconnecting,
};
pub use runtime::{Provisioning, WorkerError, WorkerHandle};
pub use store::{InMemorySubscriptionStore, StoreError, SubscriptionChange, SubscriptionStore};
