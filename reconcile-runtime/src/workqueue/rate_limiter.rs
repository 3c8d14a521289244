use ahash::AHashMap;
use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::Mutex;
use std::{hash::Hash, time::Duration};
use tokio::time::Instant;

/// Decides how long an item has to wait before it is retried
pub trait RateLimiter<T>: Send + Sync {
    /// Records a failure of `item` and returns how long to wait before retrying it
    fn when(&self, item: &T) -> Duration;
    /// Stops tracking `item`, resetting its backoff
    fn forget(&self, item: &T);
    /// How many times `item` has been requeued since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

impl<T, L: RateLimiter<T> + ?Sized> RateLimiter<T> for Box<L> {
    fn when(&self, item: &T) -> Duration {
        (**self).when(item)
    }

    fn forget(&self, item: &T) {
        (**self).forget(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        (**self).num_requeues(item)
    }
}

/// Per-item backoff: each item walks its own [`backon`] backoff sequence
///
/// The sequence for an item is rebuilt from scratch once the item is forgotten.
/// When a finite sequence runs out, the last delay is repeated.
pub struct ItemBackoffRateLimiter<T, B: BackoffBuilder = ExponentialBuilder> {
    backoff_builder: B,
    failures: Mutex<AHashMap<T, ItemBackoff<B::Backoff>>>,
}

struct ItemBackoff<I> {
    requeues: u32,
    backoff: I,
    last_delay: Duration,
}

/// Exponential per-item backoff: `base * 2^failures`, capped at `max`
pub type ItemExponentialFailureRateLimiter<T> = ItemBackoffRateLimiter<T, ExponentialBuilder>;

impl<T, B: BackoffBuilder> ItemBackoffRateLimiter<T, B> {
    /// Creates a limiter that builds a fresh backoff from `backoff_builder` for every failing item
    pub fn new(backoff_builder: B) -> Self {
        Self {
            backoff_builder,
            failures: Mutex::new(AHashMap::new()),
        }
    }
}

impl<T> ItemBackoffRateLimiter<T, ExponentialBuilder> {
    /// Doubles the delay on every failure, starting at `base_delay` and never exceeding `max_delay`
    #[must_use]
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(
            ExponentialBuilder::default()
                .with_min_delay(base_delay)
                .with_max_delay(max_delay)
                .with_factor(2.0)
                .with_max_times(usize::MAX),
        )
    }
}

impl<T, B> RateLimiter<T> for ItemBackoffRateLimiter<T, B>
where
    T: Clone + Eq + Hash + Send,
    B: BackoffBuilder + Clone + Send + Sync,
    B::Backoff: Send,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock();
        let entry = failures.entry(item.clone()).or_insert_with(|| ItemBackoff {
            requeues: 0,
            backoff: self.backoff_builder.clone().build(),
            last_delay: Duration::ZERO,
        });
        entry.requeues = entry.requeues.saturating_add(1);
        if let Some(delay) = entry.backoff.next() {
            entry.last_delay = delay;
        }
        entry.last_delay
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).map_or(0, |entry| entry.requeues)
    }
}

/// Overall token bucket shared by all items
///
/// Every call to [`when`](RateLimiter::when) reserves a token; the returned delay is how long
/// until that token becomes available. This bounds the total retry rate regardless of how many
/// distinct items are failing. Items are not tracked, so [`num_requeues`](RateLimiter::num_requeues)
/// is always zero.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Refills `qps` tokens per second up to `burst` tokens, starting full
    ///
    /// A non-positive or non-finite `qps` disables limiting.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines several limiters by always taking the worst case
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    /// Combines `limiters`; an empty set never delays
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // every limiter has to record the failure, so no short-circuiting here
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// The limiter controllers use unless configured otherwise
///
/// Per-item exponential backoff from 5ms up to 1000s, combined with an overall
/// bucket of 10 qps and a burst of 100.
#[must_use]
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::exponential(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )) as Box<dyn RateLimiter<T>>,
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::{
        default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, RateLimiter,
    };
    use std::time::Duration;

    #[test]
    fn exponential_backoff_doubles_up_to_the_cap() {
        let limiter = ItemExponentialFailureRateLimiter::exponential(Duration::from_secs(1), Duration::from_secs(4));
        let delays = (0..5).map(|_| limiter.when(&"ns/foo")).collect::<Vec<_>>();
        assert_eq!(delays, [1, 2, 4, 4, 4].map(Duration::from_secs));
        assert_eq!(limiter.num_requeues(&"ns/foo"), 5);
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(diff < Duration::from_micros(1), "{actual:?} != {expected:?}");
    }

    #[test]
    fn exponential_backoff_is_tracked_per_item() {
        let limiter =
            ItemExponentialFailureRateLimiter::exponential(Duration::from_secs(1), Duration::from_secs(1000));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(2));
        assert_eq!(limiter.when(&"b"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        assert_eq!(limiter.num_requeues(&"b"), 1);
        assert_eq!(limiter.num_requeues(&"c"), 0);
    }

    #[test]
    fn forget_resets_backoff_and_counter() {
        let limiter =
            ItemExponentialFailureRateLimiter::exponential(Duration::from_millis(5), Duration::from_secs(1000));
        for _ in 0..3 {
            limiter.when(&"a");
        }
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_close(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&"a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        let when = |limiter: &BucketRateLimiter| RateLimiter::<()>::when(limiter, &());
        assert_eq!(when(&limiter), Duration::ZERO);
        assert_eq!(when(&limiter), Duration::ZERO);
        assert_eq!(when(&limiter), Duration::from_millis(100));
        assert_eq!(when(&limiter), Duration::from_millis(200));
        tokio::time::advance(Duration::from_secs(1)).await;
        // refilled, but never beyond the burst
        assert_eq!(when(&limiter), Duration::ZERO);
        assert_eq!(RateLimiter::<()>::num_requeues(&limiter, &()), 0);
    }

    #[test]
    fn unlimited_bucket_never_delays() {
        let limiter = BucketRateLimiter::new(0.0, 0);
        for _ in 0..10 {
            assert_eq!(RateLimiter::<()>::when(&limiter, &()), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_takes_the_worst_case() {
        let limiter = default_controller_rate_limiter::<&str>();
        assert_close(limiter.when(&"a"), Duration::from_millis(5));
        assert_close(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }
}
