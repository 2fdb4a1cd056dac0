//! Domain model: events, realms, topic patterns and subscriptions.
//!
//! Everything here is plain data with validating constructors. Wire forms
//! are JSON via serde.

mod event;
mod realm;
mod subscription;
mod topic;

pub use event::{
    Body, Event, EventError, IngestRequest, ProvisioningMessage, PublisherName, RawBody,
};
pub use realm::Realm;
pub use subscription::{
    NewSubscription, PrefillStatus, RealmTopic, Subscription, SubscriptionError,
};
pub use topic::{topic_matches, TopicPattern};
