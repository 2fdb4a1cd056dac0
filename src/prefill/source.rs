use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::model::Realm;

/// A realm's authoritative source failed to answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("object source failed: {0}")]
pub struct SourceError(pub String);

/// Lists the objects that currently exist in one realm.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Every object type the realm knows, e.g. `users/user`.
    async fn object_types(&self) -> Result<Vec<String>, SourceError>;

    /// All current objects of one type.
    async fn list_objects(&self, object_type: &str) -> Result<Vec<Map<String, Value>>, SourceError>;
}

/// Object source per realm, fixed at startup.
#[derive(Clone, Default)]
pub struct PrefillSources {
    sources: HashMap<Realm, Arc<dyn ObjectSource>>,
}

impl PrefillSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, realm: Realm, source: Arc<dyn ObjectSource>) -> Self {
        self.sources.insert(realm, source);
        self
    }

    pub fn get(&self, realm: Realm) -> Option<&Arc<dyn ObjectSource>> {
        self.sources.get(&realm)
    }

    /// Registered realms that have no source.
    pub fn missing(&self) -> Vec<Realm> {
        Realm::ALL
            .into_iter()
            .filter(|realm| !self.sources.contains_key(realm))
            .collect()
    }
}

/// Object source backed by a fixed set of objects.
#[derive(Clone, Debug, Default)]
pub struct StaticObjectSource {
    objects: BTreeMap<String, Vec<Map<String, Value>>>,
}

impl StaticObjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add objects of one type. Non-object values are ignored.
    pub fn with_objects(mut self, object_type: &str, objects: impl IntoIterator<Item = Value>) -> Self {
        let entry = self.objects.entry(object_type.to_string()).or_default();
        entry.extend(objects.into_iter().filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        }));
        self
    }
}

#[async_trait]
impl ObjectSource for StaticObjectSource {
    async fn object_types(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.objects.keys().cloned().collect())
    }

    async fn list_objects(&self, object_type: &str) -> Result<Vec<Map<String, Value>>, SourceError> {
        Ok(self.objects.get(object_type).cloned().unwrap_or_default())
    }
}
