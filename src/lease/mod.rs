//! Processing-lease extension for slow message handlers.
//!
//! The broker redelivers a message whose lease (`ack_wait`) runs out. A
//! handler that may run longer keeps the lease alive by sending in-progress
//! acknowledgements every `ack_wait - ack_threshold`:
//!
//! ```text
//!  0s            25s           50s      70s
//!  ├─ handler ───────────────────────────┤ done -> extender dropped
//!  └─ extender ── in_progress ── in_progress ──x
//! ```
//!
//! The manager never settles the message. Acknowledging or negatively
//! acknowledging the final outcome stays with the caller.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::queue::QueueError;

/// Error type for lease configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("ack_threshold ({threshold:?}) must be smaller than ack_wait ({ack_wait:?})")]
    ThresholdTooLarge {
        ack_wait: Duration,
        threshold: Duration,
    },
}

/// Runs handlers while renewing the broker's processing lease.
#[derive(Debug, Clone, Copy)]
pub struct AckLeaseManager {
    ack_wait: Duration,
    ack_threshold: Duration,
}

impl AckLeaseManager {
    pub fn new(ack_wait: Duration, ack_threshold: Duration) -> Result<Self, LeaseError> {
        if ack_threshold >= ack_wait {
            return Err(LeaseError::ThresholdTooLarge {
                ack_wait,
                threshold: ack_threshold,
            });
        }
        Ok(Self {
            ack_wait,
            ack_threshold,
        })
    }

    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    /// Time between two in-progress acknowledgements.
    pub fn extension_interval(&self) -> Duration {
        self.ack_wait - self.ack_threshold
    }

    /// Drive `handler` to completion, calling `extend` every
    /// [`extension_interval`](Self::extension_interval) while it runs.
    ///
    /// The extension loop is dropped as soon as the handler finishes, so no
    /// extension is sent afterwards. A fatal error from `extend` stops the
    /// loop; the handler still runs to completion and its output is returned
    /// untouched.
    pub async fn process_with_lease_extension<H, T, X, XF>(&self, handler: H, mut extend: X) -> T
    where
        H: Future<Output = T>,
        X: FnMut() -> XF,
        XF: Future<Output = Result<(), QueueError>>,
    {
        let interval = self.extension_interval();
        let extender = async move {
            let mut extensions = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                match extend().await {
                    Ok(()) => {
                        extensions += 1;
                        debug!(extensions, "ack wait extended");
                    }
                    Err(err) if err.is_fatal() => {
                        error!(error = %err, "cannot extend ack wait, giving up");
                        return;
                    }
                    Err(err) => warn!(error = %err, "failed to extend ack wait"),
                }
            }
        };

        tokio::pin!(handler);
        tokio::pin!(extender);
        tokio::select! {
            biased;
            output = &mut handler => return output,
            () = &mut extender => {}
        }
        handler.await
    }
}
