use crate::delivery::DeliveryError;
use crate::model::{EventError, SubscriptionError};
use crate::prefill::PrefillError;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Error type for the service operations behind the API.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Registration input is invalid.
    #[error(transparent)]
    InvalidSubscription(#[from] SubscriptionError),
    /// Ingested event is malformed.
    #[error(transparent)]
    InvalidEvent(#[from] EventError),
    #[error("subscription not found: {0}")]
    NotFound(String),
    /// A different subscription with this name exists.
    #[error("subscription {0} already exists with different settings")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Prefill(#[from] PrefillError),
}

impl From<DeliveryError> for ServiceError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::SubscriptionNotFound(name) => ServiceError::NotFound(name),
            DeliveryError::Queue(e) => ServiceError::Queue(e),
            DeliveryError::Store(e) => ServiceError::Store(e),
        }
    }
}

impl ServiceError {
    /// Map this error to an HTTP-style status code.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::InvalidSubscription(_) => 400,
            ServiceError::InvalidEvent(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 409,
            ServiceError::Store(StoreError::NotFound(_)) => 404,
            ServiceError::Store(StoreError::InvalidTransition { .. }) => 409,
            ServiceError::Store(_) => 500,
            ServiceError::Queue(QueueError::MessageNotFound { .. }) => 404,
            ServiceError::Queue(QueueError::ConnectionLost(_))
            | ServiceError::Queue(QueueError::ReconnectExhausted { .. }) => 503,
            ServiceError::Queue(_) => 500,
            ServiceError::Prefill(_) => 500,
        }
    }
}
