//! Subscription registry.
//!
//! The store is the only owner of subscription records. Every write is
//! announced on a change feed so the dispatcher can rebuild its routing
//! table.
//!
//! ```text
//! registration ──put_if_absent──┐
//! prefill ─────set_prefill_status┼──► SubscriptionStore ──watch()──► Dispatcher
//! removal ─────────────delete───┘
//! ```

mod in_memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::model::{PrefillStatus, Subscription};

pub use in_memory::InMemorySubscriptionStore;

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("subscription not found: {0}")]
    NotFound(String),
    /// The prefill state machine does not allow this move.
    #[error("subscription {name}: prefill status cannot change from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: PrefillStatus,
        to: PrefillStatus,
    },
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// What happened to a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Notification sent on every write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub name: String,
    pub kind: ChangeKind,
}

/// Replicated key-value registry of subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Subscription>, StoreError>;

    /// All subscriptions, ordered by name.
    async fn list(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Insert unless the name is taken. Returns the existing record when it is.
    async fn put_if_absent(
        &self,
        subscription: Subscription,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Move the prefill status, enforcing [`PrefillStatus::can_transition_to`].
    async fn set_prefill_status(
        &self,
        name: &str,
        status: PrefillStatus,
    ) -> Result<Subscription, StoreError>;

    /// Remove a subscription. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Subscribe to the change feed.
    fn watch(&self) -> broadcast::Receiver<SubscriptionChange>;
}
