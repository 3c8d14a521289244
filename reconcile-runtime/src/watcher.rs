//! The vocabulary of a watch feed
//!
//! A feed is any [`Stream`](futures::Stream) of `Result<Event<K>, E>`. How the feed lists and
//! watches its backing store is up to the feed; the [`Informer`](crate::Informer) only relies
//! on the event order described on [`Event`].

/// Watch events delivered by a feed
#[derive(Debug, Clone, PartialEq)]
pub enum Event<K> {
    /// An object was added or modified
    Apply(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the feed is unavailable. A relist reports such losses as tombstones.
    Delete(K),
    /// The feed is starting a (re)list
    ///
    /// Followed by zero or more [`InitApply`](Event::InitApply) events and a final
    /// [`InitDone`](Event::InitDone).
    Init,
    /// An object listed during a relist
    InitApply(K),
    /// The relist is complete
    ///
    /// Any objects that were previously [`Apply`](Event::Apply)-ed but are not listed since the
    /// last [`Init`](Event::Init) should be assumed to have been deleted.
    InitDone,
}

impl<K> Event<K> {
    /// Map each object in an event through a mutator fn
    ///
    /// ```
    /// use reconcile_runtime::watcher::Event;
    /// let ev = Event::Apply(1_u32).modify(|n| *n += 1);
    /// assert_eq!(ev, Event::Apply(2));
    /// ```
    #[must_use]
    pub fn modify(mut self, mut f: impl FnMut(&mut K)) -> Self {
        match &mut self {
            Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => (f)(obj),
            Event::Init | Event::InitDone => {}
        }
        self
    }

    /// The object carried by the event, if any
    pub fn object(&self) -> Option<&K> {
        match self {
            Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => Some(obj),
            Event::Init | Event::InitDone => None,
        }
    }
}
