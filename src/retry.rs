//! Supervised retry for long-running listeners
//!
//! Every listener of every adapter runs through [`supervise`]: any error is
//! logged and the operation is restarted after a fixed delay. The loop ends
//! only on cancellation (dropping the future or aborting its task) or once
//! the listener's output queue has been closed by its consumer.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::error::{Result, TrackerError};

/// Run `operation` forever, restarting it after `delay` whenever it returns.
///
/// A normal return is treated like a dropped connection: the stream ended,
/// so it is re-established after the same delay. [`TrackerError::ChannelClosed`]
/// means nobody is listening any more and ends supervision.
pub async fn supervise<F, Fut>(name: &str, delay: Duration, mut operation: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(()) => {
                warn!(
                    listener = name,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Listener stream ended, reconnecting"
                );
            }
            Err(TrackerError::ChannelClosed) => {
                info!(listener = name, "Output queue closed, stopping listener");
                return;
            }
            Err(e) => {
                warn!(
                    listener = name,
                    attempt,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "Unexpected error in listener, retrying"
                );
            }
        }
        sleep(delay).await;
    }
}

/// Bound a REST call, mapping an elapsed timer to [`TrackerError::RestTimeout`]
pub async fn with_rest_timeout<T, Fut>(limit: Duration, request: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(TrackerError::RestTimeout(limit.as_secs())),
    }
}
