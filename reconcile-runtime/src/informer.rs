//! Feeds watch events into a [`Store`](crate::Store) and tells handlers what changed
use crate::{
    controller::{BoxError, Error, ErrorHandler},
    reflector::Writer,
    watcher,
    workqueue::RateLimitingQueue,
};
use futures::{Stream, StreamExt};
use reconcile_core::{DeletedObject, Notification, Resource};
use std::{pin::pin, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Reacts to changes of cached objects
///
/// Handlers are called from the informer task, in feed order, after the store has been updated.
/// Implement the callbacks of interest, or [`on_notification`](Self::on_notification) to see every change at once.
pub trait ResourceEventHandler<K>: Send + Sync {
    /// An object appeared
    fn on_add(&self, _obj: &K) {}
    /// An object changed from `old` to `new`
    fn on_update(&self, _old: &K, _new: &K) {}
    /// An object disappeared
    fn on_delete(&self, _obj: &DeletedObject<K>) {}

    /// Entry point of the informer, fans out to the callbacks above
    fn on_notification(&self, notification: &Notification<K>) {
        match notification {
            Notification::Added(obj) => self.on_add(obj),
            Notification::Updated { old, new } => self.on_update(old, new),
            Notification::Deleted(obj) => self.on_delete(obj),
        }
    }
}

/// Queues the key of every changed object
///
/// Keys that cannot be derived are passed to the error handler as [`Error::KeyExtraction`].
pub struct EnqueueHandler {
    queue: RateLimitingQueue<String>,
    error_handler: ErrorHandler,
}

impl EnqueueHandler {
    /// Adds keys to `queue`, reporting malformed objects to `error_handler`
    #[must_use]
    pub fn new(queue: RateLimitingQueue<String>, error_handler: ErrorHandler) -> Self {
        Self { queue, error_handler }
    }

}

impl<K: Resource> ResourceEventHandler<K> for EnqueueHandler {
    fn on_notification(&self, notification: &Notification<K>) {
        match notification.key() {
            Ok(key) => {
                tracing::trace!(%key, "queueing");
                self.queue.add(key);
            }
            Err(err) => (self.error_handler)(&Error::KeyExtraction(err)),
        }
    }
}

/// Drives a watch feed into a [`Writer`] and dispatches the resulting [`Notification`]s
pub struct Informer<K, S> {
    feed: S,
    writer: Writer<K>,
    handlers: Vec<Box<dyn ResourceEventHandler<K>>>,
    error_handler: ErrorHandler,
}

impl<K, S, E> Informer<K, S>
where
    K: Resource + Clone + Send + Sync + 'static,
    S: Stream<Item = Result<watcher::Event<K>, E>> + Send,
    E: Into<BoxError>,
{
    /// Applies `feed` to the store behind `writer`
    ///
    /// Feed errors are logged until [`with_error_handler`](Self::with_error_handler) says otherwise.
    pub fn new(feed: S, writer: Writer<K>) -> Self {
        Self {
            feed,
            writer,
            handlers: Vec::new(),
            error_handler: crate::controller::default_error_handler(),
        }
    }

    /// Registers a handler for every future notification
    #[must_use]
    pub fn with_handler(mut self, handler: impl ResourceEventHandler<K> + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Sets where feed errors are reported
    #[must_use]
    pub fn with_error_handler(mut self, error_handler: ErrorHandler) -> Self {
        self.error_handler = error_handler;
        self
    }

    /// Runs until the feed ends or `stop` is cancelled
    ///
    /// Feed errors are reported as [`Error::FeedFailed`] and do not stop the informer,
    /// the feed is expected to recover on its own.
    #[tracing::instrument(skip_all, fields(kind = K::kind()))]
    pub async fn run(self, stop: CancellationToken) {
        let Self {
            feed,
            mut writer,
            handlers,
            error_handler,
        } = self;
        let mut feed = pin!(feed);
        loop {
            let event = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                event = feed.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    for notification in writer.apply_watcher_event(&event) {
                        dispatch(&handlers, &notification);
                    }
                }
                Some(Err(err)) => error_handler(&Error::FeedFailed(err.into())),
                None => {
                    tracing::debug!("feed ended");
                    break;
                }
            }
        }
    }
}

fn dispatch<K>(handlers: &[Box<dyn ResourceEventHandler<K>>], notification: &Notification<K>) {
    for handler in handlers {
        handler.on_notification(notification);
    }
}

impl<K> ResourceEventHandler<K> for Arc<dyn ResourceEventHandler<K>> {
    fn on_add(&self, obj: &K) {
        (**self).on_add(obj);
    }

    fn on_update(&self, old: &K, new: &K) {
        (**self).on_update(old, new);
    }

    fn on_delete(&self, obj: &DeletedObject<K>) {
        (**self).on_delete(obj);
    }

    fn on_notification(&self, notification: &Notification<K>) {
        (**self).on_notification(notification);
    }
}
