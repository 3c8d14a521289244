//! Caches objects delivered by a watch feed
use crate::watcher;
use ahash::AHashMap;
use parking_lot::RwLock;
use reconcile_core::{DeletedObject, Notification, ObjectRef, Resource};
use std::{convert::Infallible, fmt::Debug, sync::Arc};
use tokio_util::sync::CancellationToken;

type Cache<K> = Arc<RwLock<AHashMap<ObjectRef, Arc<K>>>>;

/// Read access to cached objects, looked up by reference
///
/// Workers only need this much from a cache, which keeps the controller loop testable
/// against lookups that fail.
pub trait Lister<K> {
    /// Why a lookup could not be answered
    type Error: std::error::Error + Send + Sync + 'static;

    /// Look up the object referred to by `obj_ref`
    ///
    /// `Ok(None)` means the object does not exist (anymore).
    ///
    /// # Errors
    ///
    /// Fails when the lookup itself could not be performed.
    fn get(&self, obj_ref: &ObjectRef) -> Result<Option<Arc<K>>, Self::Error>;
}

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple informers.
/// In particular, relists will clobber the state of other connected informers.
pub struct Writer<K> {
    store: Cache<K>,
    buffer: Vec<K>,
    ready: CancellationToken,
}

impl<K> Default for Writer<K> {
    fn default() -> Self {
        Self {
            store: Arc::default(),
            buffer: Vec::new(),
            ready: CancellationToken::new(),
        }
    }
}

impl<K: Debug> Debug for Writer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("cached", &self.store.read().len())
            .field("buffered", &self.buffer.len())
            .field("synced", &self.ready.is_cancelled())
            .finish()
    }
}

impl<K: Resource + Clone> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
            ready: self.ready.clone(),
        }
    }

    /// Applies a single watcher event to the store, returning what changed
    ///
    /// Objects listed during a relist are buffered until [`InitDone`](watcher::Event::InitDone),
    /// which swaps the whole cache at once. Cached objects missing from the relist come back as
    /// [`DeletedObject::FinalStateUnknown`] tombstones. The first `InitDone` marks the store as synced.
    ///
    /// Objects without a valid key are never cached but are still reported, so that whoever consumes
    /// the notifications can surface them.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(obj) => {
                let Ok(obj_ref) = ObjectRef::from_obj(obj) else {
                    return vec![Notification::Added(obj.clone())];
                };
                let new = Arc::new(obj.clone());
                let notification = match self.store.write().insert(obj_ref, new) {
                    Some(old) => Notification::Updated {
                        old: K::clone(&old),
                        new: obj.clone(),
                    },
                    None => Notification::Added(obj.clone()),
                };
                vec![notification]
            }
            watcher::Event::Delete(obj) => {
                if let Ok(obj_ref) = ObjectRef::from_obj(obj) {
                    self.store.write().remove(&obj_ref);
                }
                vec![Notification::Deleted(DeletedObject::Known(obj.clone()))]
            }
            watcher::Event::Init => {
                self.buffer.clear();
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                self.buffer.push(obj.clone());
                Vec::new()
            }
            watcher::Event::InitDone => {
                let notifications = self.replace_with_buffer();
                self.ready.cancel();
                notifications
            }
        }
    }

    fn replace_with_buffer(&mut self) -> Vec<Notification<K>> {
        let mut notifications = Vec::with_capacity(self.buffer.len());
        let mut listed = AHashMap::with_capacity(self.buffer.len());
        let mut store = self.store.write();
        for obj in self.buffer.drain(..) {
            let Ok(obj_ref) = ObjectRef::from_obj(&obj) else {
                notifications.push(Notification::Added(obj));
                continue;
            };
            notifications.push(match store.get(&obj_ref) {
                Some(old) => Notification::Updated {
                    old: K::clone(old),
                    new: obj.clone(),
                },
                None => Notification::Added(obj.clone()),
            });
            listed.insert(obj_ref, Arc::new(obj));
        }
        for (obj_ref, old) in store.iter() {
            if !listed.contains_key(obj_ref) {
                notifications.push(Notification::Deleted(DeletedObject::FinalStateUnknown {
                    key: obj_ref.to_string(),
                    obj: K::clone(old),
                }));
            }
        }
        *store = listed;
        notifications
    }
}

/// A readable cache of objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
pub struct Store<K> {
    store: Cache<K>,
    ready: CancellationToken,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ready: self.ready.clone(),
        }
    }
}

impl<K: Debug> Debug for Store<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("cached", &self.store.read().len())
            .field("synced", &self.ready.is_cancelled())
            .finish()
    }
}

impl<K> Store<K> {
    /// Retrieve the entry referred to by `obj_ref`, if it is in the cache.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted upstream, and new objects may not yet exist in the cache.
    /// If any of these are a problem for you then you should abort your reconciler and retry later.
    #[must_use]
    pub fn get(&self, obj_ref: &ObjectRef) -> Option<Arc<K>> {
        self.store.read().get(obj_ref).cloned()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Whether the first full listing has been applied
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.ready.is_cancelled()
    }

    /// Wait for the first full listing to be applied
    ///
    /// Returns immediately if the store has already synced. Never returns if the feed never
    /// completes a listing, so callers usually race this against a timeout.
    pub async fn wait_until_synced(&self) {
        self.ready.cancelled().await;
    }
}

impl<K> Lister<K> for Store<K> {
    type Error = Infallible;

    fn get(&self, obj_ref: &ObjectRef) -> Result<Option<Arc<K>>, Self::Error> {
        Ok(Store::get(self, obj_ref))
    }
}

/// Create a (Reader, Writer) pair for a [`Store`]
///
/// The writer is handed to an [`Informer`](crate::Informer), the reader to whoever needs lookups.
#[must_use]
pub fn store<K: Resource + Clone>() -> (Store<K>, Writer<K>) {
    let w = Writer::default();
    let r = w.as_reader();
    (r, w)
}

#[cfg(test)]
mod tests {
    use super::{store, Lister};
    use crate::watcher::Event;
    use futures::{poll, FutureExt};
    use reconcile_core::{DeletedObject, Notification, ObjectMeta, ObjectRef, Resource};

    #[derive(Clone, Debug, PartialEq)]
    struct Widget {
        metadata: ObjectMeta,
        size: u32,
    }

    impl Resource for Widget {
        fn kind() -> &'static str {
            "Widget"
        }

        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }

        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    fn widget(ns: &str, name: &str, size: u32) -> Widget {
        Widget {
            metadata: ObjectMeta::namespaced(ns, name),
            size,
        }
    }

    #[test]
    fn should_allow_getting_applied_object() {
        let (reader, mut writer) = store();
        let w = widget("ns", "obj", 1);
        assert_eq!(writer.apply_watcher_event(&Event::Apply(w.clone())), [
            Notification::Added(w.clone())
        ]);
        let found = reader.get(&ObjectRef::new("obj").within("ns")).unwrap();
        assert_eq!(*found, w);
        assert_eq!(reader.get(&ObjectRef::new("obj")), None);
    }

    #[test]
    fn reapply_is_an_update_with_the_previous_state() {
        let (reader, mut writer) = store();
        writer.apply_watcher_event(&Event::Apply(widget("ns", "obj", 1)));
        let notifications = writer.apply_watcher_event(&Event::Apply(widget("ns", "obj", 2)));
        assert_eq!(notifications, [Notification::Updated {
            old: widget("ns", "obj", 1),
            new: widget("ns", "obj", 2),
        }]);
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.state()[0].size, 2);
    }

    #[test]
    fn delete_removes_object() {
        let (reader, mut writer) = store();
        let w = widget("ns", "obj", 1);
        writer.apply_watcher_event(&Event::Apply(w.clone()));
        assert_eq!(writer.apply_watcher_event(&Event::Delete(w.clone())), [
            Notification::Deleted(DeletedObject::Known(w))
        ]);
        assert!(reader.is_empty());
    }

    #[test]
    fn relist_replaces_cache_and_tombstones_missing_objects() {
        let (reader, mut writer) = store();
        writer.apply_watcher_event(&Event::Apply(widget("ns", "kept", 1)));
        writer.apply_watcher_event(&Event::Apply(widget("ns", "gone", 1)));

        assert!(writer.apply_watcher_event(&Event::Init).is_empty());
        assert!(writer
            .apply_watcher_event(&Event::InitApply(widget("ns", "kept", 2)))
            .is_empty());
        assert!(writer
            .apply_watcher_event(&Event::InitApply(widget("ns", "new", 1)))
            .is_empty());
        // nothing is swapped until the listing is complete
        assert_eq!(reader.len(), 2);

        let notifications = writer.apply_watcher_event(&Event::InitDone);
        assert_eq!(notifications, [
            Notification::Updated {
                old: widget("ns", "kept", 1),
                new: widget("ns", "kept", 2),
            },
            Notification::Added(widget("ns", "new", 1)),
            Notification::Deleted(DeletedObject::FinalStateUnknown {
                key: "ns/gone".to_string(),
                obj: widget("ns", "gone", 1),
            }),
        ]);
        assert_eq!(reader.len(), 2);
        assert!(reader.get(&ObjectRef::new("gone").within("ns")).is_none());
    }

    #[test]
    fn malformed_objects_are_reported_but_not_cached() {
        let (reader, mut writer) = store();
        let nameless = Widget {
            metadata: ObjectMeta::default(),
            size: 1,
        };
        assert_eq!(writer.apply_watcher_event(&Event::Apply(nameless.clone())), [
            Notification::Added(nameless)
        ]);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn store_syncs_at_first_init_done() {
        let (reader, mut writer) = store::<Widget>();
        assert!(!reader.has_synced());
        let mut synced = Box::pin(reader.wait_until_synced());
        assert!(poll!(synced.as_mut()).is_pending());

        writer.apply_watcher_event(&Event::Init);
        writer.apply_watcher_event(&Event::InitApply(widget("ns", "obj", 1)));
        assert!(!reader.has_synced());
        writer.apply_watcher_event(&Event::InitDone);

        assert!(reader.has_synced());
        assert!(synced.now_or_never().is_some());
        // clones share the barrier
        assert!(reader.clone().has_synced());
    }

    #[test]
    fn lister_never_fails_for_store() {
        let (reader, mut writer) = store();
        writer.apply_watcher_event(&Event::Apply(widget("ns", "obj", 1)));
        let lister: &dyn Lister<Widget, Error = std::convert::Infallible> = &reader;
        assert!(lister.get(&ObjectRef::new("obj").within("ns")).unwrap().is_some());
        assert!(lister.get(&ObjectRef::new("missing").within("ns")).unwrap().is_none());
    }
}
