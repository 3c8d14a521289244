//! Add/update/delete notifications delivered by a watch feed
use crate::{
    key::{deletion_handling_key, meta_namespace_key, KeyError},
    resource::Resource,
};

/// The last known state of a deleted object
#[derive(Debug, Clone, PartialEq)]
pub enum DeletedObject<K> {
    /// The delete was observed directly, `K` is the final state of the object
    Known(K),
    /// The object was removed from the local cache before the delete was dispatched
    ///
    /// This happens when the feed had to relist and the object was missing from the new listing.
    /// `obj` is the last state the cache held and may be stale; `key` is the key it was cached under.
    FinalStateUnknown {
        /// The key the object was cached under
        key: String,
        /// The last known state of the object
        obj: K,
    },
}

impl<K> DeletedObject<K> {
    /// The last known state of the object, tombstoned or not
    pub fn object(&self) -> &K {
        match self {
            DeletedObject::Known(obj) | DeletedObject::FinalStateUnknown { obj, .. } => obj,
        }
    }

    /// Unwraps the last known state of the object
    pub fn into_object(self) -> K {
        match self {
            DeletedObject::Known(obj) | DeletedObject::FinalStateUnknown { obj, .. } => obj,
        }
    }
}

/// A change notification for a tracked object
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    /// An object appeared
    Added(K),
    /// An object changed
    Updated {
        /// The previously cached state
        old: K,
        /// The new state
        new: K,
    },
    /// An object disappeared
    Deleted(DeletedObject<K>),
}

impl<K: Resource> Notification<K> {
    /// The queue key of the object this notification is about
    ///
    /// Updates are keyed by the new state, deletes go through [`deletion_handling_key`].
    ///
    /// # Errors
    ///
    /// Fails when the object is malformed, see [`meta_namespace_key`].
    pub fn key(&self) -> Result<String, KeyError> {
        match self {
            Notification::Added(obj) | Notification::Updated { new: obj, .. } => meta_namespace_key(obj),
            Notification::Deleted(deleted) => deletion_handling_key(deleted),
        }
    }
}
