//! Prefill: bulk "create" events for a new subscriber's current world.
//!
//! ```text
//! registration ──PrefillRequest──► prefill stream ──► PrefillWorker
//!                                                        │ (lease extended)
//!                                                        ▼
//!                                               PrefillOrchestrator
//!                     pending -> running ──────────┬─────┴────────┐
//!                                                  ▼              ▼
//!                            prefill-queue/<name>.prefill    status done
//!                                                  or status failed + prefill-failures record
//! ```
//!
//! Live dispatch into `<name>.main` goes on while the fill runs. The two
//! subjects are disjoint and the delivery read-path orders them.

mod orchestrator;
mod source;
mod worker;

use crate::model::{EventError, Realm};
use crate::queue::QueueError;
use crate::store::StoreError;

pub use orchestrator::{PrefillOrchestrator, PrefillOutcome};
pub use source::{ObjectSource, PrefillSources, SourceError, StaticObjectSource};
pub use worker::{PrefillRequest, PrefillWorker, PrefillWorkerStats, SimpleMessage};

/// Error type for prefill runs.
#[derive(Debug, thiserror::Error)]
pub enum PrefillError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    /// An enumerated object cannot become an event.
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("no object source registered for realm {0}")]
    NoSourceForRealm(Realm),
    #[error("invalid topic pattern '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },
}

impl PrefillError {
    /// Whether the error must stop the worker instead of failing one prefill.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PrefillError::Queue(err) if err.is_fatal())
    }
}
