//! Queues that hand deduplicated keys to workers
//!
//! [`WorkQueue`] is the basic deduplicating FIFO. [`RateLimitingQueue`] layers delayed adds and
//! per-item retry accounting on top of it, which is what a controller uses to requeue failed keys.
mod queue;
mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemBackoffRateLimiter,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};

use crate::scheduler::{scheduler, ScheduleRequest};
use futures::{channel::mpsc, StreamExt};
use std::{fmt::Debug, hash::Hash, pin::pin, sync::Arc, time::Duration};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};

/// Delays beyond this are clamped, the timer wheel cannot hold them
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A [`WorkQueue`] with delayed adds and rate-limited requeues
///
/// Cloning produces a new handle to the same queue.
pub struct RateLimitingQueue<T> {
    queue: WorkQueue<T>,
    delayed: mpsc::UnboundedSender<ScheduleRequest<T>>,
    rate_limiter: Arc<dyn RateLimiter<T>>,
    delayed_adds: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            delayed: self.delayed.clone(),
            rate_limiter: self.rate_limiter.clone(),
            delayed_adds: self.delayed_adds.clone(),
        }
    }
}

impl<T: Debug> Debug for RateLimitingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// Creates an empty queue whose requeues are paced by `rate_limiter`
    ///
    /// # Panics
    ///
    /// Delayed adds are driven by a background task, so this must be called from within a Tokio runtime.
    pub fn new(rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        let queue = WorkQueue::new();
        let (delayed, requests) = mpsc::unbounded();
        let delayed_adds = tokio::spawn(wait_for_delayed_adds(queue.clone(), requests));
        Self {
            queue,
            delayed,
            rate_limiter: Arc::new(rate_limiter),
            delayed_adds: Arc::new(Mutex::new(Some(delayed_adds))),
        }
    }

    /// Adds `item` once `delay` has passed
    ///
    /// A zero delay adds right away. If the item is already waiting, the earlier deadline wins.
    /// Dropped once the queue is shutting down.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }
        let request = ScheduleRequest {
            message: item,
            run_at: Instant::now() + delay.min(MAX_DELAY),
        };
        if self.delayed.unbounded_send(request).is_err() {
            tracing::debug!("delayed add dropped, queue is shutting down");
        }
    }

    /// Adds `item` after the delay its rate limiter prescribes
    ///
    /// Every call counts as one requeue of the item until it is [`forget`](Self::forget)-ed.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Stops tracking retries of `item`
    ///
    /// Does not remove the item from the queue.
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    /// How many times `item` has been requeued through [`add_rate_limited`](Self::add_rate_limited)
    #[must_use]
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// See [`WorkQueue::add`]
    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    /// See [`WorkQueue::get`]
    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    /// See [`WorkQueue::done`]
    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    /// See [`WorkQueue::len`]
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// See [`WorkQueue::is_empty`]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// See [`WorkQueue::shutdown`], pending delayed adds are discarded
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// See [`WorkQueue::shutdown_with_drain`]
    pub async fn shutdown_with_drain(&self) {
        self.queue.shutdown_with_drain().await;
    }

    /// Waits for the task behind [`add_after`](Self::add_after) to exit
    ///
    /// The task exits once the queue shuts down, so this only returns after [`shutdown`](Self::shutdown).
    /// Only the first caller waits, later calls return right away.
    pub async fn join_delayed_adds(&self) {
        let handle = self.delayed_adds.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "delayed add task exited abnormally");
            }
        }
    }

    /// See [`WorkQueue::is_shutting_down`]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// See [`WorkQueue::shutting_down`]
    pub async fn shutting_down(&self) {
        self.queue.shutting_down().await;
    }
}

/// Moves delayed items into `queue` as their deadlines pass
async fn wait_for_delayed_adds<T>(queue: WorkQueue<T>, requests: mpsc::UnboundedReceiver<ScheduleRequest<T>>)
where
    T: Clone + Eq + Hash,
{
    let mut ready = pin!(scheduler(requests));
    loop {
        tokio::select! {
            biased;
            () = queue.shutting_down() => break,
            item = ready.next() => match item {
                Some(item) => queue.add(item),
                // every handle is gone and nothing is pending
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ItemExponentialFailureRateLimiter, RateLimitingQueue};
    use futures::{poll, FutureExt};
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};

    fn queue() -> RateLimitingQueue<&'static str> {
        RateLimitingQueue::new(ItemExponentialFailureRateLimiter::exponential(
            Duration::from_secs(1),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_the_item() {
        let queue = queue();
        let start = Instant::now();
        queue.add_after("ns/foo", Duration::from_secs(3));
        assert!(queue.is_empty());
        let item = timeout(Duration::from_secs(10), queue.get()).await.unwrap();
        assert_eq!(item, Some("ns/foo"));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_adds_immediately() {
        let queue = queue();
        queue.add_after("ns/foo", Duration::ZERO);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_add_after_keeps_earliest_deadline() {
        let queue = queue();
        let start = Instant::now();
        queue.add_after("ns/foo", Duration::from_secs(10));
        queue.add_after("ns/foo", Duration::from_secs(1));
        let item = timeout(Duration::from_secs(5), queue.get()).await.unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        queue.done(&item);
        sleep(Duration::from_secs(20)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_count_requeues_until_forgotten() {
        let queue = queue();
        queue.add_rate_limited("ns/bar");
        queue.add_rate_limited("ns/bar");
        assert_eq!(queue.num_requeues(&"ns/bar"), 2);
        queue.forget(&"ns/bar");
        assert_eq!(queue.num_requeues(&"ns/bar"), 0);
        // forgetting does not pull the item out of the queue
        let item = timeout(Duration::from_secs(5), queue.get()).await.unwrap();
        assert_eq!(item, Some("ns/bar"));
        queue.add_rate_limited("ns/bar");
        assert_eq!(queue.num_requeues(&"ns/bar"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_task_exits_on_shutdown() {
        let queue = queue();
        queue.add_after("ns/foo", Duration::from_secs(30));
        let mut join = Box::pin(queue.join_delayed_adds());
        assert!(poll!(join.as_mut()).is_pending());
        queue.shutdown();
        timeout(Duration::from_secs(1), join).await.unwrap();
        // already joined
        assert!(queue.join_delayed_adds().now_or_never().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_pending_delayed_adds() {
        let queue = queue();
        queue.add_after("ns/foo", Duration::from_secs(1));
        queue.shutdown();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.get().await, None);
        queue.add_after("ns/foo", Duration::ZERO);
        assert!(queue.is_empty());
    }
}
