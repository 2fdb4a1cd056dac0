//! Service layer behind the external interfaces: subscription registration,
//! event ingestion and, with the `http` feature, the REST transport.
//!
//! The message delivery API is served by [`crate::delivery::MessageService`].

mod error;
mod ingest;
mod subscriptions;

#[cfg(feature = "http")]
pub mod http;

pub use error::ServiceError;
pub use ingest::EventIngestor;
pub use subscriptions::{Registration, SubscriptionService};
