use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ChangeKind, StoreError, SubscriptionChange, SubscriptionStore};
use crate::model::{PrefillStatus, Subscription};

const CHANGE_FEED_CAPACITY: usize = 64;

/// In-memory [`SubscriptionStore`]. Clones share the same records and feed.
#[derive(Clone)]
pub struct InMemorySubscriptionStore {
    records: Arc<RwLock<BTreeMap<String, Subscription>>>,
    changes: broadcast::Sender<SubscriptionChange>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            changes,
        }
    }

    fn notify(&self, name: &str, kind: ChangeKind) {
        // No receivers is fine: nobody is routing yet.
        let _ = self.changes.send(SubscriptionChange {
            name: name.to_string(),
            kind,
        });
    }
}

impl Default for InMemorySubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned(op: &str) -> StoreError {
    StoreError::Unavailable(format!("lock poisoned ({op})"))
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, name: &str) -> Result<Option<Subscription>, StoreError> {
        let records = self.records.read().map_err(|_| poisoned("read"))?;
        Ok(records.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        let records = self.records.read().map_err(|_| poisoned("read"))?;
        Ok(records.values().cloned().collect())
    }

    async fn put_if_absent(
        &self,
        subscription: Subscription,
    ) -> Result<Option<Subscription>, StoreError> {
        let name = subscription.name.clone();
        {
            let mut records = self.records.write().map_err(|_| poisoned("write"))?;
            if let Some(existing) = records.get(&name) {
                return Ok(Some(existing.clone()));
            }
            records.insert(name.clone(), subscription);
        }
        info!(subscription = %name, "subscription created");
        self.notify(&name, ChangeKind::Created);
        Ok(None)
    }

    async fn set_prefill_status(
        &self,
        name: &str,
        status: PrefillStatus,
    ) -> Result<Subscription, StoreError> {
        let updated = {
            let mut records = self.records.write().map_err(|_| poisoned("write"))?;
            let record = records
                .get_mut(name)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            let from = record.prefill_status;
            if !from.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    name: name.to_string(),
                    from,
                    to: status,
                });
            }
            record.prefill_status = status;
            record.clone()
        };
        debug!(subscription = %name, status = %status, "prefill status updated");
        self.notify(name, ChangeKind::Updated);
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let existed = self
            .records
            .write()
            .map_err(|_| poisoned("write"))?
            .remove(name)
            .is_some();
        if existed {
            info!(subscription = %name, "subscription deleted");
            self.notify(name, ChangeKind::Deleted);
        }
        Ok(existed)
    }

    fn watch(&self) -> broadcast::Receiver<SubscriptionChange> {
        self.changes.subscribe()
    }
}
