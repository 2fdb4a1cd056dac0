//! Change events and their wire form.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::realm::Realm;
use crate::queue::{QueueError, QueueMessage};

/// Error type for event construction and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Both `old` and `new` are absent.
    #[error("event body must contain 'old' or 'new'")]
    EmptyBody,
    /// One side of the body is neither an object nor absent.
    #[error("'{0}' must be an object or null")]
    NotAnObject(&'static str),
    /// Realm has no registered variant.
    #[error("unknown realm: {0}")]
    UnknownRealm(String),
    /// Object cannot be mapped to the realm's domain type.
    #[error("{realm} object is missing string attribute '{key}'")]
    MissingDomainKey {
        realm: &'static str,
        key: &'static str,
    },
    /// Payload is not a valid event.
    #[error("invalid event payload: {0}")]
    Decode(String),
}

/// Who produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublisherName {
    UdmListener,
    LdifProducer,
    UdmPreFill,
    ConsumerRegistration,
    ConsumerClientTest,
}

/// Before and after snapshots of a changed object.
///
/// At least one side is present. An empty object counts as absent, and an
/// absent side is written as `{}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawBody")]
pub struct Body {
    old: Option<Map<String, Value>>,
    new: Option<Map<String, Value>>,
}

impl Body {
    pub fn new(
        old: Option<Map<String, Value>>,
        new: Option<Map<String, Value>>,
    ) -> Result<Self, EventError> {
        let old = old.filter(|o| !o.is_empty());
        let new = new.filter(|n| !n.is_empty());
        if old.is_none() && new.is_none() {
            return Err(EventError::EmptyBody);
        }
        Ok(Self { old, new })
    }

    /// Body of a synthetic "create": nothing before, `object` after.
    pub fn created(object: Map<String, Value>) -> Result<Self, EventError> {
        Self::new(None, Some(object))
    }

    pub fn old(&self) -> Option<&Map<String, Value>> {
        self.old.as_ref()
    }

    pub fn new_object(&self) -> Option<&Map<String, Value>> {
        self.new.as_ref()
    }

    fn objects(&self) -> impl Iterator<Item = &Map<String, Value>> {
        self.old.iter().chain(self.new.iter())
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let empty = Map::new();
        let mut state = serializer.serialize_struct("Body", 2)?;
        state.serialize_field("old", self.old.as_ref().unwrap_or(&empty))?;
        state.serialize_field("new", self.new.as_ref().unwrap_or(&empty))?;
        state.end()
    }
}

/// Unvalidated body as it arrives over the wire.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawBody {
    #[serde(default)]
    pub old: Value,
    #[serde(default)]
    pub new: Value,
}

impl TryFrom<RawBody> for Body {
    type Error = EventError;

    fn try_from(raw: RawBody) -> Result<Self, Self::Error> {
        Body::new(as_object(raw.old, "old")?, as_object(raw.new, "new")?)
    }
}

fn as_object(value: Value, side: &'static str) -> Result<Option<Map<String, Value>>, EventError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        _ => Err(EventError::NotAnObject(side)),
    }
}

/// An immutable change event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    publisher_name: PublisherName,
    ts: DateTime<Utc>,
    realm: Realm,
    topic: String,
    body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<Uuid>,
}

impl Event {
    pub fn new(publisher_name: PublisherName, realm: Realm, topic: impl Into<String>, body: Body) -> Self {
        Self {
            publisher_name,
            ts: Utc::now(),
            realm,
            topic: topic.into(),
            body,
            event_id: None,
        }
    }

    /// Synthetic "create" for an object that already exists, used to prefill
    /// a subscriber's queue.
    pub fn prefill(
        realm: Realm,
        topic: impl Into<String>,
        object: Map<String, Value>,
    ) -> Result<Self, EventError> {
        realm.validate_object(&object)?;
        let body = Body::created(object)?;
        Ok(Self::new(PublisherName::UdmPreFill, realm, topic, body).with_event_id(Uuid::new_v4()))
    }

    pub fn with_event_id(mut self, id: Uuid) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn publisher_name(&self) -> PublisherName {
        self.publisher_name
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn realm(&self) -> Realm {
        self.realm
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Stable identifier shared by every copy and redelivery of this event.
    pub fn event_id(&self) -> Option<Uuid> {
        self.event_id
    }

    /// Decode an event from a queue payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::Decode(e.to_string()))
    }
}

/// Event submitted to the ingestion API.
#[derive(Clone, Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(default = "default_publisher")]
    pub publisher_name: PublisherName,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    pub realm: String,
    pub topic: String,
    #[serde(default)]
    pub body: RawBody,
}

fn default_publisher() -> PublisherName {
    PublisherName::UdmListener
}

impl IngestRequest {
    /// Validate the request and turn it into an event with a fresh id.
    ///
    /// Checks run in a fixed order, so the same input always fails the same
    /// way.
    pub fn into_event(self) -> Result<Event, EventError> {
        let body = Body::try_from(self.body)?;
        let realm: Realm = self.realm.parse()?;
        for object in body.objects() {
            realm.validate_object(object)?;
        }
        let event = Event::new(self.publisher_name, realm, self.topic, body)
            .with_event_id(Uuid::new_v4());
        Ok(match self.ts {
            Some(ts) => event.with_timestamp(ts),
            None => event,
        })
    }
}

/// An event as handed to a subscriber, with its position in the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningMessage {
    pub sequence_number: u64,
    pub num_delivered: u32,
    #[serde(flatten)]
    pub event: Event,
}

impl ProvisioningMessage {
    pub fn from_queue(message: &QueueMessage) -> Result<Self, QueueError> {
        Ok(Self {
            sequence_number: message.sequence_number,
            num_delivered: message.delivery_count,
            event: message.decode()?,
        })
    }
}
