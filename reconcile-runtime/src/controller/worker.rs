use super::{BoxError, Error, ErrorHandler};
use crate::{reflector::Lister, workqueue::RateLimitingQueue};
use futures::{Future, FutureExt};
use reconcile_core::key::split_meta_namespace_key;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tracing::Instrument;

/// Everything a worker task needs, shared between all workers of a controller
pub(super) struct Worker<L, R, Ctx> {
    pub(super) queue: RateLimitingQueue<String>,
    pub(super) lister: L,
    pub(super) reconciler: Arc<R>,
    pub(super) context: Arc<Ctx>,
    pub(super) max_retries: u32,
    pub(super) error_handler: ErrorHandler,
}

impl<L: Clone, R, Ctx> Clone for Worker<L, R, Ctx> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            lister: self.lister.clone(),
            reconciler: self.reconciler.clone(),
            context: self.context.clone(),
            max_retries: self.max_retries,
            error_handler: self.error_handler.clone(),
        }
    }
}

/// Marks the key as done however processing ends, unwinding included
struct DoneGuard<'a> {
    queue: &'a RateLimitingQueue<String>,
    key: &'a String,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

impl<L, R, Ctx> Worker<L, R, Ctx> {
    /// Processes keys until the queue shuts down and runs dry
    pub(super) async fn run<K, Fut, E>(self, id: usize)
    where
        L: Lister<K>,
        R: Fn(Arc<K>, Arc<Ctx>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        tracing::debug!(worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            let _done = DoneGuard {
                queue: &self.queue,
                key: &key,
            };
            let span = tracing::info_span!("reconcile", worker = id, %key);
            let result = self.process(&key).instrument(span.clone()).await;
            span.in_scope(|| self.handle_result(&key, result));
        }
        tracing::debug!(worker = id, "worker stopped");
    }

    async fn process<K, Fut, E>(&self, key: &str) -> Result<(), BoxError>
    where
        L: Lister<K>,
        R: Fn(Arc<K>, Arc<Ctx>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let obj_ref = match split_meta_namespace_key(key) {
            Ok(obj_ref) => obj_ref,
            Err(source) => {
                (self.error_handler)(&Error::InvalidKey {
                    key: key.to_string(),
                    source,
                });
                return Ok(());
            }
        };
        let obj = match self.lister.get(&obj_ref) {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                (self.error_handler)(&Error::ObjectNotFound(obj_ref));
                return Ok(());
            }
            Err(source) => {
                return Err(Box::new(Error::LookupFailed {
                    obj_ref,
                    source: Box::new(source),
                }))
            }
        };
        // the call itself may panic before handing out a future
        let reconcile = async { (self.reconciler)(obj, self.context.clone()).await };
        match AssertUnwindSafe(reconcile).catch_unwind().await {
            Ok(result) => result.map_err(|err| Box::new(err) as BoxError),
            Err(_panic) => Err("reconciler panicked".into()),
        }
    }

    /// Forgets keys that succeeded, requeues failures until they run out of retries
    fn handle_result(&self, key: &str, result: Result<(), BoxError>) {
        let key = key.to_string();
        let err = match result {
            Ok(()) => {
                tracing::debug!("reconciled");
                self.queue.forget(&key);
                return;
            }
            Err(err) => err,
        };
        let retries = self.queue.num_requeues(&key);
        if retries < self.max_retries {
            tracing::warn!(attempt = retries + 1, error = %err, "reconcile failed, requeueing");
            self.queue.add_rate_limited(key);
        } else {
            tracing::warn!(retries, "giving up, dropping key out of the queue");
            self.queue.forget(&key);
            (self.error_handler)(&Error::RetriesExhausted {
                key,
                retries,
                source: err,
            });
        }
    }
}
