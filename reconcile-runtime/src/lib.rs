//! Crate with the runtime components of a level-triggered reconciler
//!
//! This crate contains the building blocks to turn a feed of watch events into
//! reconcile calls: a deduplicating, rate limited work queue, an in-memory cache
//! fed by an informer, and a controller loop that retries failed keys with backoff.
//!
//! Newcomers should generally get started with the [`Controller`] builder, which manages
//! all state internals for you.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]

pub use reconcile_core as core;

pub mod config;
pub mod controller;
pub mod informer;
pub mod reflector;
mod scheduler;
pub mod watcher;
pub mod workqueue;

pub use config::Config;
pub use controller::{default_error_handler, shutdown_on_signal, Controller, Error, ErrorHandler};
pub use informer::{EnqueueHandler, Informer, ResourceEventHandler};
pub use reconcile_core::{DeletedObject, Notification, ObjectMeta, ObjectRef, Resource, ResourceExt};
pub use reflector::{store, Lister, Store};
pub use workqueue::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter, RateLimitingQueue, WorkQueue,
};
