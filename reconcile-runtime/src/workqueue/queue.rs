use ahash::AHashSet;
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt::Debug, hash::Hash, sync::Arc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A deduplicating FIFO of items that need processing
///
/// Every item is in one of three overlapping sets:
/// - *dirty*: somebody asked for the item to be processed,
/// - *processing*: a worker took the item with [`get`](Self::get) and has not called [`done`](Self::done) yet,
/// - *queued*: dirty and not processing, waiting in FIFO order.
///
/// An item is never handed to two workers at once. Adding an item that is already queued is a no-op,
/// adding an item that is being processed marks it dirty so that it is queued again once the current
/// worker calls [`done`](Self::done).
///
/// Cloning produces a new handle to the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Wakes getters when an item is queued (`notify_one`) or the queue shuts down (`notify_waiters`)
    ready: Notify,
    /// Wakes drainers whenever the processing set becomes empty
    drained: Notify,
    shutdown: CancellationToken,
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: AHashSet<T>,
    processing: AHashSet<T>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: AHashSet::new(),
                    processing: AHashSet::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl<T: Debug> Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkQueue")
            .field("queue", &state.queue)
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash,
{
    /// Creates an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `item` as needing processing
    ///
    /// Ignored once the queue is shutting down.
    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            // already queued, or already requeued for after the current processing run
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.ready.notify_one();
    }

    /// Waits for the next item and marks it as processing
    ///
    /// Returns `None` once the queue has been shut down and every queued item has been handed out.
    /// The caller must call [`done`](Self::done) with the item when it has finished processing it.
    pub async fn get(&self) -> Option<T> {
        loop {
            let ready = self.shared.ready.notified();
            tokio::pin!(ready);
            // Register before inspecting the state so that a shutdown in between is not missed
            ready.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Marks `item` as done processing
    ///
    /// If the item was added again while it was processing, it is queued again right away.
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        let requeued = state.dirty.contains(item);
        if requeued {
            state.queue.push_back(item.clone());
        }
        let drained = state.processing.is_empty();
        drop(state);
        if requeued {
            self.shared.ready.notify_one();
        }
        if drained {
            self.shared.drained.notify_waiters();
        }
    }

    /// Number of items waiting to be handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether no items are waiting to be handed out
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items
    ///
    /// Items that are already queued are still handed out, after which [`get`](Self::get)
    /// returns `None` to every caller.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.shutdown.cancel();
        self.shared.ready.notify_waiters();
    }

    /// Shuts the queue down and waits until no item is processing anymore
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.shared.state.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves once the queue is shutting down
    pub async fn shutting_down(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::WorkQueue;
    use futures::{poll, FutureExt};
    use std::{sync::Arc, time::Duration};
    use tokio::{sync::Barrier, time::timeout};

    #[tokio::test]
    async fn add_is_deduplicated_while_queued() {
        let queue = WorkQueue::new();
        queue.add("ns/foo");
        queue.add("ns/foo");
        queue.add("ns/bar");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("ns/foo"));
        assert_eq!(queue.get().await, Some("ns/bar"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn adds_during_processing_coalesce_into_one_rerun() {
        let queue = WorkQueue::new();
        queue.add("ns/foo");
        let item = queue.get().await.unwrap();
        for _ in 0..10 {
            queue.add("ns/foo");
        }
        // held back while processing
        assert!(queue.is_empty());
        queue.done(&item);
        assert_eq!(queue.len(), 1);
        let again = queue.get().await.unwrap();
        queue.done(&again);
        assert!(queue.is_empty());
        assert!(queue.get().now_or_never().is_none());
    }

    #[tokio::test]
    async fn done_without_new_adds_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add(1_u32);
        let item = queue.get().await.unwrap();
        queue.done(&item);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let queue = WorkQueue::new();
        let mut get = Box::pin(queue.get());
        assert!(poll!(get.as_mut()).is_pending());
        queue.add(7_u32);
        assert_eq!(get.await, Some(7));
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let queue = WorkQueue::<u32>::new();
        let getters = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect::<Vec<_>>();
        tokio::task::yield_now().await;
        queue.shutdown();
        for getter in getters {
            assert_eq!(timeout(Duration::from_secs(1), getter).await.unwrap().unwrap(), None);
        }
    }

    #[tokio::test]
    async fn shutdown_hands_out_remaining_items_then_stops() {
        let queue = WorkQueue::new();
        queue.add(1_u32);
        queue.add(2);
        queue.shutdown();
        queue.add(3);
        assert!(queue.is_shutting_down());
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_with_drain_waits_for_processing_items() {
        let queue = WorkQueue::new();
        queue.add(1_u32);
        let item = queue.get().await.unwrap();
        let mut drain = Box::pin(queue.shutdown_with_drain());
        assert!(poll!(drain.as_mut()).is_pending());
        queue.done(&item);
        timeout(Duration::from_secs(1), drain).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_drain_returns_when_last_done_requeues() {
        let queue = WorkQueue::new();
        queue.add(1_u32);
        let item = queue.get().await.unwrap();
        queue.add(1);
        let mut drain = Box::pin(queue.shutdown_with_drain());
        assert!(poll!(drain.as_mut()).is_pending());
        queue.done(&item);
        timeout(Duration::from_secs(1), drain).await.unwrap();
        // the dirty item is still handed out after the drain
        assert_eq!(queue.get().await, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_getters_never_share_an_item() {
        let queue = WorkQueue::new();
        let in_flight = Arc::new(parking_lot::Mutex::new(ahash::AHashSet::new()));
        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles = (0..workers)
            .map(|_| {
                let queue = queue.clone();
                let in_flight = in_flight.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let mut processed = 0;
                    while let Some(item) = queue.get().await {
                        assert!(in_flight.lock().insert(item), "item {item} handed out twice");
                        tokio::task::yield_now().await;
                        in_flight.lock().remove(&item);
                        queue.done(&item);
                        processed += 1;
                    }
                    processed
                })
            })
            .collect::<Vec<_>>();
        for round in 0..50_u32 {
            for key in 0..5_u32 {
                queue.add(key);
            }
            if round % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
        queue.shutdown_with_drain().await;
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert!(total >= 5);
    }
}
