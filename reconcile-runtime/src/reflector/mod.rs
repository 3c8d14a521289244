//! Caches objects in memory
//!
//! Create a [`Store`] through [`store()`]. The `writer` part is not clonable and must be
//! moved into an [`Informer`](crate::Informer). The `reader` part is the [`Store`] interface
//! that you can send to other parts of your program as state.
//!
//! The cache contains the last-seen state of objects, which may lag slightly behind the actual state.
pub mod store;

pub use store::{store, Lister, Store, Writer};
