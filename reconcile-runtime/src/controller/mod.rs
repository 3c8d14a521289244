//! Runs a reconciler for every key that comes out of a rate limited work queue
mod worker;

use crate::{
    config::Config,
    informer::{EnqueueHandler, Informer},
    reflector::{store::Writer, Lister, Store},
    watcher,
    workqueue::RateLimitingQueue,
};
use futures::{stream::BoxStream, Future, Stream, StreamExt, TryStreamExt};
use reconcile_core::{KeyError, ObjectRef, Resource};
use std::{fmt::Debug, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use worker::Worker;

/// A type-erased error, as returned by feeds, listers and reconcilers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Problems a running controller runs into
///
/// None of these stop the controller, they are passed to its [`ErrorHandler`].
#[derive(Debug, Error)]
pub enum Error {
    /// A queued key could not be split back into a reference, the key is dropped
    #[error("invalid resource key {key:?}: {source}")]
    InvalidKey {
        /// The offending key
        key: String,
        /// Why it could not be split
        #[source]
        source: KeyError,
    },

    /// The object behind a key is no longer cached, usually because it has been deleted
    #[error("object {0} no longer exists in the cache")]
    ObjectNotFound(ObjectRef),

    /// The cache could not answer a lookup, the key is retried
    #[error("failed to look up {obj_ref}: {source}")]
    LookupFailed {
        /// What was looked up
        obj_ref: ObjectRef,
        /// Why the lookup failed
        #[source]
        source: BoxError,
    },

    /// A key kept failing and was dropped out of the queue
    #[error("dropping {key} out of the queue after {retries} retries: {source}")]
    RetriesExhausted {
        /// The dropped key
        key: String,
        /// How often the key was requeued before giving up
        retries: u32,
        /// The last failure
        #[source]
        source: BoxError,
    },

    /// The cache did not complete its first listing in time, no worker was started
    #[error("timed out after {0:?} waiting for the cache to sync")]
    CacheSyncTimeout(Duration),

    /// A notification carried an object without a valid key
    #[error("failed to derive a key: {0}")]
    KeyExtraction(#[source] KeyError),

    /// The watch feed returned an error
    #[error("watch feed failed: {0}")]
    FeedFailed(#[source] BoxError),
}

/// Receives every non-fatal [`Error`] of a controller
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Logs errors through [`tracing`]
///
/// Objects that disappeared before they could be reconciled are expected and only logged at debug level.
#[must_use]
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|err: &Error| match err {
        Error::ObjectNotFound(obj_ref) => tracing::debug!(%obj_ref, "object no longer exists"),
        err => tracing::error!(error = %err, "controller error"),
    })
}

/// Reconciles every object of kind `K` that a watch feed reports as changed
///
/// Changes are collapsed into keys on a rate limited work queue. Workers take keys off the queue,
/// look the current object up through a [`Lister`] (the informer's [`Store`] unless replaced) and
/// pass it to the reconciler. Failed keys are retried with backoff until
/// [`Config::max_retries`] is exceeded.
///
/// ```no_run
/// use reconcile_runtime::{watcher, Config, Controller, ObjectMeta, Resource};
/// use std::{convert::Infallible, sync::Arc};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Clone, Debug)]
/// struct Redis {
///     metadata: ObjectMeta,
/// }
///
/// impl Resource for Redis {
///     fn kind() -> &'static str {
///         "Redis"
///     }
///     fn meta(&self) -> &ObjectMeta {
///         &self.metadata
///     }
///     fn meta_mut(&mut self) -> &mut ObjectMeta {
///         &mut self.metadata
///     }
/// }
///
/// # async fn wrapper(feed: futures::stream::BoxStream<'static, Result<watcher::Event<Redis>, std::io::Error>>) {
/// let stop = CancellationToken::new();
/// Controller::new(feed, Config::default())
///     .run(
///         |redis: Arc<Redis>, _ctx: Arc<()>| async move {
///             println!("reconciling {:?}", redis.metadata.name);
///             Ok::<_, Infallible>(())
///         },
///         Arc::new(()),
///         stop,
///     )
///     .await;
/// # }
/// ```
pub struct Controller<K, L = Store<K>> {
    feed: BoxStream<'static, Result<watcher::Event<K>, BoxError>>,
    writer: Writer<K>,
    lister: L,
    config: Config,
    error_handler: ErrorHandler,
}

impl<K> Controller<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Creates a controller that caches `feed` and looks objects up in that cache
    pub fn new<S, E>(feed: S, config: Config) -> Self
    where
        S: Stream<Item = Result<watcher::Event<K>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let writer = Writer::default();
        Self {
            feed: feed.map_err(Into::<BoxError>::into).boxed(),
            lister: writer.as_reader(),
            writer,
            config,
            error_handler: default_error_handler(),
        }
    }
}

impl<K, L> Controller<K, L>
where
    K: Resource + Clone + Send + Sync + 'static,
    L: Lister<K> + Clone + Send + Sync + 'static,
{
    /// A read handle to the cache the informer maintains
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Looks objects up through `lister` instead of the informer's cache
    ///
    /// The informer's cache is still what the sync barrier waits for.
    #[must_use]
    pub fn with_lister<L2>(self, lister: L2) -> Controller<K, L2>
    where
        L2: Lister<K> + Clone + Send + Sync + 'static,
    {
        Controller {
            feed: self.feed,
            writer: self.writer,
            lister,
            config: self.config,
            error_handler: self.error_handler,
        }
    }

    /// Sets where non-fatal errors go, [`default_error_handler`] otherwise
    #[must_use]
    pub fn with_error_handler(mut self, error_handler: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error_handler = Arc::new(error_handler);
        self
    }

    /// Runs the controller until `stop` is cancelled
    ///
    /// 1. Starts the informer on the feed.
    /// 2. Waits for the cache to sync. If `stop` fires first, the feed ends, or
    ///    [`Config::cache_sync_timeout`] passes (reported as [`Error::CacheSyncTimeout`]),
    ///    no worker is started and `stop` is cancelled.
    /// 3. Starts [`Config::workers`] workers.
    /// 4. Once `stop` is cancelled, shuts the queue down and waits for the informer, every
    ///    worker and the delayed add task. Keys that are already queued are still processed.
    ///
    /// # Panics
    ///
    /// Must be awaited from within a Tokio runtime.
    pub async fn run<R, Fut, E, Ctx>(self, reconciler: R, context: Arc<Ctx>, stop: CancellationToken)
    where
        R: Fn(Arc<K>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        Ctx: Send + Sync + 'static,
    {
        let Self {
            feed,
            writer,
            lister,
            config,
            error_handler,
        } = self;
        let queue = RateLimitingQueue::new(config.rate_limiter());
        let store = writer.as_reader();

        tracing::info!(kind = K::kind(), "starting controller");
        let informer = Informer::new(feed, writer)
            .with_handler(EnqueueHandler::new(queue.clone(), error_handler.clone()))
            .with_error_handler(error_handler.clone());
        let mut informer = tokio::spawn(informer.run(stop.clone()));
        let mut informer_result = None;

        tracing::info!("waiting for the cache to sync");
        let synced = tokio::select! {
            biased;
            () = store.wait_until_synced() => true,
            () = stop.cancelled() => false,
            joined = &mut informer => {
                tracing::warn!("feed ended before the cache synced");
                informer_result = Some(joined);
                stop.cancel();
                false
            }
            () = tokio::time::sleep(config.cache_sync_timeout.into()) => {
                error_handler(&Error::CacheSyncTimeout(config.cache_sync_timeout.into()));
                stop.cancel();
                false
            }
        };

        let mut workers = JoinSet::new();
        if synced {
            tracing::info!(workers = config.workers, "starting workers");
            let worker = Worker {
                queue: queue.clone(),
                lister,
                reconciler: Arc::new(reconciler),
                context,
                max_retries: config.max_retries,
                error_handler,
            };
            for id in 0..config.workers {
                workers.spawn(worker.clone().run(id));
            }
        }

        stop.cancelled().await;
        tracing::info!("shutting down workers");
        queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "worker exited abnormally");
            }
        }
        queue.join_delayed_adds().await;
        let joined = match informer_result {
            Some(joined) => joined,
            None => informer.await,
        };
        if let Err(err) = joined {
            tracing::error!(error = %err, "informer exited abnormally");
        }
        tracing::info!("controller stopped");
    }
}

impl<K, L: Debug> Debug for Controller<K, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("lister", &self.lister)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Cancels `stop` on Ctrl-C, or on SIGTERM on Unix
///
/// Returns early without cancelling anything if `stop` is cancelled elsewhere first.
pub async fn shutdown_on_signal(stop: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = stop.cancelled() => return,
        () = ctrl_c => tracing::warn!("intercepted Ctrl-C, shutting down"),
        () = terminate => tracing::warn!("intercepted SIGTERM, shutting down"),
    }
    stop.cancel();
}

#[cfg(test)]
mod tests {
    use super::{shutdown_on_signal, Error};
    use reconcile_core::{KeyError, ObjectRef};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn errors_render_their_context() {
        let err = Error::InvalidKey {
            key: "a/b/c".to_string(),
            source: KeyError::UnexpectedFormat("a/b/c".to_string()),
        };
        assert_eq!(
            err.to_string(),
            r#"invalid resource key "a/b/c": unexpected key format: "a/b/c""#
        );
        let err = Error::RetriesExhausted {
            key: "ns/bar".to_string(),
            retries: 5,
            source: "boom".into(),
        };
        assert_eq!(err.to_string(), "dropping ns/bar out of the queue after 5 retries: boom");
        assert_eq!(
            Error::ObjectNotFound(ObjectRef::new("bar").within("ns")).to_string(),
            "object ns/bar no longer exists in the cache"
        );
    }

    #[tokio::test]
    async fn shutdown_on_signal_returns_once_stopped_elsewhere() {
        let stop = CancellationToken::new();
        let watcher = tokio::spawn(shutdown_on_signal(stop.clone()));
        stop.cancel();
        timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
    }
}
