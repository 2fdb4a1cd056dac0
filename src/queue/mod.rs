//! Queue port - durable, pull-based message broker abstraction.
//!
//! Every component talks to the broker through [`MessageQueue`]; nothing
//! depends on a concrete client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  MessageQueue (port)                         │
//! │  ensure_stream / add_message / get_message / delete_message │
//! │  initialize_subscription -> PullSubscription                │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │      PullSubscription::get_one_message(timeout)              │
//! │      -> (QueueMessage, Acknowledgements)                     │
//! │      Acknowledgements: ack / nack / in_progress              │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌─────────────────┐              ┌──────────────────────────┐
//! │ InMemoryBroker  │              │ Reconnecting<Q>           │
//! │  (included)     │              │ bounded reconnect wrapper │
//! └─────────────────┘              └──────────────────────────┘
//! ```
//!
//! ## Streams
//!
//! See [`names`] for the stream and subject layout: one incoming stream, one
//! live-dispatch stream and one prefill stream, with a subject per subscriber
//! in each of the latter two.

mod in_memory;
mod message;
pub mod names;
mod port;
mod reconnect;

pub use in_memory::InMemoryBroker;
pub use message::{encode, AckHandle, Acknowledgements, QueueError, QueueMessage};
pub use port::{MessageQueue, PullSubscription};
pub use reconnect::{DurableConsumer, Reconnecting};
