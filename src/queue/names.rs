//! Stream and subject naming.
//!
//! One stream per queue class. Per-subscriber subjects are derived from the
//! subscription name, which is restricted to `[A-Za-z0-9_-]`.

/// Stream (and subject) the ingestion API writes raw events to.
pub const INCOMING_STREAM: &str = "incoming";
pub const INCOMING_SUBJECT: &str = "incoming";

/// Stream holding every subscriber's live queue.
pub const DISPATCH_STREAM: &str = "dispatch";

/// Stream holding every subscriber's prefill queue.
pub const PREFILL_QUEUE_STREAM: &str = "prefill-queue";

/// Background job queue of prefill requests.
pub const PREFILL_REQUEST_STREAM: &str = "prefill";
pub const PREFILL_REQUEST_SUBJECT: &str = "prefill";

/// Record of prefill requests that ended in `failed`.
pub const PREFILL_FAILURES_STREAM: &str = "prefill-failures";
pub const PREFILL_FAILURES_SUBJECT: &str = "prefill-failures";

/// Subject of a subscriber's live queue in [`DISPATCH_STREAM`].
pub fn live_subject(subscription: &str) -> String {
    format!("{subscription}.main")
}

/// Subject of a subscriber's prefill queue in [`PREFILL_QUEUE_STREAM`].
pub fn prefill_subject(subscription: &str) -> String {
    format!("{subscription}.prefill")
}

/// Whether `name` can be used to derive subjects.
pub fn is_valid_subscription_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
