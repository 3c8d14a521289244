//! Shared types for building work-queue driven controllers
//!
//! This crate holds the client-less pieces of a controller: object metadata,
//! the [`Resource`] accessor trait, deterministic object keys and the
//! add/update/delete [`Notification`]s that a watch feed delivers.
//! The same information is re-exported from `reconcile-runtime` under `reconcile_runtime::core`.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod duration;
pub use duration::Duration;

pub mod key;
pub use key::{KeyError, ObjectRef};

pub mod metadata;
pub use metadata::{ObjectMeta, TypeMeta};

pub mod notification;
pub use notification::{DeletedObject, Notification};

mod resource;
pub use resource::{Resource, ResourceExt};
