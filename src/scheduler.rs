//! Outbound request scheduler.
//!
//! All node calls funnel through one queue drained by a single worker task.
//! The worker enforces a minimum spacing between dispatches (a leaky bucket of
//! size one) and pauses for a short settle delay after each dispatch, so the node
//! never sees two calls closer together than `min_interval`, however many
//! components are asking for data at once.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use crate::error::SyncError;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Clone)]
pub struct RequestScheduler {
    sender: mpsc::UnboundedSender<Job>,
    dispatched: Arc<AtomicU64>,
}

impl RequestScheduler {
    /// Start the worker loop. Must be called inside a tokio runtime.
    pub fn new(min_interval: Duration, settle_delay: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatched = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_worker(receiver, min_interval, settle_delay, dispatched.clone()));
        Self { sender, dispatched }
    }

    /// Queue `call` and wait for its result.
    ///
    /// Calls are dispatched in FIFO order; completion order follows the calls themselves.
    pub async fn enqueue<F, Fut, T>(&self, call: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = reply.send(call().await);
            })
        });

        self.sender.send(job).map_err(|_| SyncError::SchedulerClosed)?;
        response.await.map_err(|_| SyncError::SchedulerClosed)?
    }

    /// Number of calls dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    min_interval: Duration,
    settle_delay: Duration,
    dispatched: Arc<AtomicU64>,
) {
    let mut last_dispatch: Option<Instant> = None;

    while let Some(job) = receiver.recv().await {
        if let Some(last) = last_dispatch {
            let ready_at = last + min_interval;
            if Instant::now() < ready_at {
                sleep_until(ready_at).await;
            }
        }

        last_dispatch = Some(Instant::now());
        let count = dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Dispatching node call #{}", count);
        tokio::spawn(job());

        if !settle_delay.is_zero() {
            sleep(settle_delay).await;
        }
    }

    debug!("Request scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_spacing_respects_min_interval() {
        let min_interval = Duration::from_millis(200);
        let scheduler = RequestScheduler::new(min_interval, Duration::from_millis(10));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..5).map(|_| {
            let scheduler = scheduler.clone();
            let stamps = stamps.clone();
            async move {
                scheduler
                    .enqueue(move || async move {
                        stamps.lock().unwrap().push(Instant::now());
                        Ok::<_, SyncError>(())
                    })
                    .await
            }
        });
        for result in futures::future::join_all(calls).await {
            assert!(result.is_ok());
        }

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 5);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= min_interval);
        }
        assert_eq!(scheduler.dispatched(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_order_is_fifo() {
        let scheduler = RequestScheduler::new(Duration::from_millis(50), Duration::ZERO);
        let order = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..4u32).map(|i| {
            let scheduler = scheduler.clone();
            let order = order.clone();
            async move {
                scheduler
                    .enqueue(move || async move {
                        order.lock().unwrap().push(i);
                        Ok::<_, SyncError>(i)
                    })
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(results.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_call_does_not_stall_queue() {
        let scheduler = RequestScheduler::new(Duration::from_millis(50), Duration::from_millis(5));

        let failed = scheduler
            .enqueue(|| async { Err::<u32, _>(SyncError::Transient("boom".into())) })
            .await;
        assert!(failed.is_err());

        let ok = scheduler.enqueue(|| async { Ok::<_, SyncError>(7u32) }).await;
        tokio_test::assert_ok!(&ok);
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_does_not_block_next_dispatch() {
        let scheduler = RequestScheduler::new(Duration::from_millis(100), Duration::ZERO);
        let start = Instant::now();

        let slow = scheduler.enqueue(|| async {
            sleep(Duration::from_secs(10)).await;
            Ok::<_, SyncError>("slow")
        });
        let fast = scheduler.enqueue(|| async { Ok::<_, SyncError>(Instant::now()) });

        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), "slow");
        let fast_dispatched = fast.unwrap();
        assert!(fast_dispatched - start < Duration::from_secs(1));
    }
}
