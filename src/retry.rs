//! Bounded retry with exponential backoff and epoch-based cancellation.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::context::{ChainContext, EpochToken};
use crate::error::SyncError;
use crate::scheduler::RequestScheduler;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 2,
            max_delay: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.backoff_factor.max(1))
            .min(self.max_delay)
    }
}

/// Run `call` through the scheduler, retrying transient failures.
///
/// Returns `Ok(None)` when the context moved away from `token` before an attempt
/// or before the result could be handed back: the caller no longer wants it.
pub async fn with_retry<F, Fut, T>(
    scheduler: &RequestScheduler,
    context: &ChainContext,
    token: EpochToken,
    policy: &RetryPolicy,
    label: &str,
    call: F,
) -> Result<Option<T>, SyncError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    T: Send + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        if !context.is_current(&token) {
            debug!("{}: context changed (epoch {}), dropping request", label, token.epoch);
            return Ok(None);
        }

        attempt += 1;
        let pending = call();
        match scheduler.enqueue(move || pending).await {
            Ok(value) => {
                if !context.is_current(&token) {
                    debug!("{}: result arrived for stale epoch {}, discarding", label, token.epoch);
                    return Ok(None);
                }
                return Ok(Some(value));
            }
            Err(SyncError::StaleContext) => {
                debug!("{}: binding went stale, dropping request", label);
                return Ok(None);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    warn!("{} failed after {} attempts: {}", label, attempt, e);
                    return Err(e);
                }
                debug!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    label, attempt, max_attempts, e, delay
                );
                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
