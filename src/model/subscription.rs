use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::realm::Realm;
use super::topic::TopicPattern;
use crate::queue::names::is_valid_subscription_name;

/// Error type for subscription registration input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscription name must not be empty")]
    EmptyName,
    #[error("invalid subscription name '{0}': only letters, digits, '-' and '_' are allowed")]
    InvalidName(String),
    #[error("subscription needs at least one realm/topic")]
    NoRealmTopics,
    #[error("unknown realm: {0}")]
    UnknownRealm(String),
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidTopicPattern { pattern: String, reason: String },
}

/// One `(realm, topic pattern)` entry of a subscription.
///
/// Serialized as a two-element array, `["udm", "users/.*"]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(Realm, String)", into = "(Realm, String)")]
pub struct RealmTopic {
    realm: Realm,
    topic: String,
}

impl RealmTopic {
    pub fn new(realm: Realm, topic: impl Into<String>) -> Self {
        Self {
            realm,
            topic: topic.into(),
        }
    }

    pub fn realm(&self) -> Realm {
        self.realm
    }

    /// The topic pattern as registered.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl From<(Realm, String)> for RealmTopic {
    fn from((realm, topic): (Realm, String)) -> Self {
        Self { realm, topic }
    }
}

impl From<RealmTopic> for (Realm, String) {
    fn from(rt: RealmTopic) -> Self {
        (rt.realm, rt.topic)
    }
}

/// Progress of a subscriber's prefill.
///
/// ```text
/// pending ──► running ──► done
///               │  ▲
///               │  └── (restart after a crashed worker)
///               └────► failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefillStatus {
    Pending,
    Running,
    Failed,
    Done,
}

impl PrefillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefillStatus::Pending => "pending",
            PrefillStatus::Running => "running",
            PrefillStatus::Failed => "failed",
            PrefillStatus::Done => "done",
        }
    }

    /// `done` and `failed` are left only by deleting the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PrefillStatus::Done | PrefillStatus::Failed)
    }

    /// Whether the state machine allows moving to `next`. Setting the current
    /// status again is always allowed.
    pub fn can_transition_to(&self, next: PrefillStatus) -> bool {
        use PrefillStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Pending, Running) | (Running, Done) | (Running, Failed)
            )
    }
}

impl fmt::Display for PrefillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered subscriber.
///
/// Equality and hashing cover every field; `realm_topics` is a set, so the
/// order entries were registered in does not matter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub realm_topics: BTreeSet<RealmTopic>,
    pub request_prefill: bool,
    pub prefill_status: PrefillStatus,
}

impl Subscription {
    /// Same name, entries and prefill request; status is ignored.
    pub fn same_registration(&self, other: &Subscription) -> bool {
        self.name == other.name
            && self.realm_topics == other.realm_topics
            && self.request_prefill == other.request_prefill
    }
}

/// Registration input, validated by [`NewSubscription::into_subscription`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewSubscription {
    pub name: String,
    pub realm_topics: Vec<(String, String)>,
    #[serde(default)]
    pub request_prefill: bool,
}

impl NewSubscription {
    pub fn new(name: impl Into<String>, request_prefill: bool) -> Self {
        Self {
            name: name.into(),
            realm_topics: Vec::new(),
            request_prefill,
        }
    }

    pub fn with_realm_topic(mut self, realm: impl Into<String>, topic: impl Into<String>) -> Self {
        self.realm_topics.push((realm.into(), topic.into()));
        self
    }

    /// Validate and build the record to store. Prefill status starts at
    /// `pending` when a prefill is requested and at `done` otherwise.
    pub fn into_subscription(self) -> Result<Subscription, SubscriptionError> {
        if self.name.is_empty() {
            return Err(SubscriptionError::EmptyName);
        }
        if !is_valid_subscription_name(&self.name) {
            return Err(SubscriptionError::InvalidName(self.name));
        }
        if self.realm_topics.is_empty() {
            return Err(SubscriptionError::NoRealmTopics);
        }

        let mut realm_topics = BTreeSet::new();
        for (realm, topic) in self.realm_topics {
            let realm: Realm = realm
                .parse()
                .map_err(|_| SubscriptionError::UnknownRealm(realm.clone()))?;
            TopicPattern::new(&topic).map_err(|e| SubscriptionError::InvalidTopicPattern {
                pattern: topic.clone(),
                reason: e.to_string(),
            })?;
            realm_topics.insert(RealmTopic::new(realm, topic));
        }

        let prefill_status = if self.request_prefill {
            PrefillStatus::Pending
        } else {
            PrefillStatus::Done
        };
        Ok(Subscription {
            name: self.name,
            realm_topics,
            request_prefill: self.request_prefill,
            prefill_status,
        })
    }
}
