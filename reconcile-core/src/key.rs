//! Deterministic deduplication keys for tracked objects
//!
//! A key is `namespace/name` for namespaced objects and a bare `name` for cluster-scoped ones.
//! Keys are derived from the object identity alone, so every notification about the same
//! object maps to the same key regardless of how often the object changed in between.
use crate::{notification::DeletedObject, resource::Resource};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Errors from deriving or splitting object keys
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The object has no `.metadata.name`
    #[error("object has no name")]
    MissingName,

    /// A name or namespace contained the key separator
    #[error("invalid key segment {0:?}: must not contain '/'")]
    InvalidSegment(String),

    /// A key string did not have the shape `name` or `namespace/name`
    #[error("unexpected key format: {0:?}")]
    UnexpectedFormat(String),
}

/// A namespaced (if relevant) reference to an object
///
/// `Display` renders the queue key of the object, and [`FromStr`] parses it back.
///
/// ```
/// use reconcile_core::ObjectRef;
/// let obj_ref = ObjectRef::new("foo").within("ns");
/// assert_eq!(obj_ref.to_string(), "ns/foo");
/// assert_eq!("ns/foo".parse::<ObjectRef>().unwrap(), obj_ref);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// The namespace of the object, `None` when cluster-scoped
    pub namespace: Option<String>,
    /// The name of the object
    pub name: String,
}

impl ObjectRef {
    /// A cluster-scoped reference to `name`
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Place the reference inside `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates an `ObjectRef` from the identity of `obj`
    ///
    /// # Errors
    ///
    /// Fails if the object has no name or if a segment contains `/`.
    pub fn from_obj<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = match meta.name.as_deref() {
            Some(name) if !name.is_empty() => checked_segment(name)?,
            _ => return Err(KeyError::MissingName),
        };
        let namespace = match meta.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Some(checked_segment(ns)?.to_string()),
            _ => None,
        };
        Ok(Self {
            namespace,
            name: name.to_string(),
        })
    }
}

fn checked_segment(segment: &str) -> Result<&str, KeyError> {
    if segment.contains('/') {
        Err(KeyError::InvalidSegment(segment.to_string()))
    } else {
        Ok(segment)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        write!(f, "{}", self.name)
    }
}

impl FromStr for ObjectRef {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        split_meta_namespace_key(key)
    }
}

/// Derives the queue key of `obj`
///
/// # Errors
///
/// Fails if the object has no name or if a segment contains `/`.
pub fn meta_namespace_key<K: Resource>(obj: &K) -> Result<String, KeyError> {
    ObjectRef::from_obj(obj).map(|obj_ref| obj_ref.to_string())
}

/// Derives the queue key of a deleted object
///
/// The [`DeletedObject::FinalStateUnknown`] tombstone already records the key the object was
/// cached under, so it is returned as-is.
///
/// # Errors
///
/// Fails like [`meta_namespace_key`] for objects that are not tombstoned.
pub fn deletion_handling_key<K: Resource>(deleted: &DeletedObject<K>) -> Result<String, KeyError> {
    match deleted {
        DeletedObject::Known(obj) => meta_namespace_key(obj),
        DeletedObject::FinalStateUnknown { key, .. } => Ok(key.clone()),
    }
}

/// Splits a queue key back into its namespace and name
///
/// # Errors
///
/// Fails unless the key is `name` or `namespace/name` with non-empty segments.
pub fn split_meta_namespace_key(key: &str) -> Result<ObjectRef, KeyError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok(ObjectRef::new(name)),
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
            Ok(ObjectRef::new(name).within(ns))
        }
        _ => Err(KeyError::UnexpectedFormat(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{deletion_handling_key, meta_namespace_key, split_meta_namespace_key, KeyError, ObjectRef};
    use crate::{metadata::ObjectMeta, notification::DeletedObject, resource::Resource};

    #[derive(Clone, Debug, PartialEq)]
    struct Widget {
        metadata: ObjectMeta,
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

    fn widget(meta: ObjectMeta) -> Widget {
        Widget { metadata: meta }
    }

    #[test]
    fn namespaced_objects_key_as_namespace_slash_name() {
        let w = widget(ObjectMeta::namespaced("ns", "foo"));
        assert_eq!(meta_namespace_key(&w).unwrap(), "ns/foo");
    }

    #[test]
    fn cluster_scoped_objects_key_as_bare_name() {
        let w = widget(ObjectMeta::cluster_scoped("foo"));
        assert_eq!(meta_namespace_key(&w).unwrap(), "foo");

        let mut empty_ns = ObjectMeta::cluster_scoped("foo");
        empty_ns.namespace = Some(String::new());
        assert_eq!(meta_namespace_key(&widget(empty_ns)).unwrap(), "foo");
    }

    #[test]
    fn key_ignores_mutable_fields() {
        let mut a = ObjectMeta::namespaced("ns", "foo");
        a.resource_version = Some("1".into());
        a.uid = Some("aaa".into());
        let mut b = ObjectMeta::namespaced("ns", "foo");
        b.resource_version = Some("2".into());
        b.labels.insert("tier".into(), "cache".into());
        assert_eq!(
            meta_namespace_key(&widget(a)).unwrap(),
            meta_namespace_key(&widget(b)).unwrap()
        );
    }

    #[test]
    fn nameless_objects_are_malformed() {
        assert_eq!(
            meta_namespace_key(&widget(ObjectMeta::default())),
            Err(KeyError::MissingName)
        );
        let mut generated = ObjectMeta::default();
        generated.generate_name = Some("foo-".into());
        assert_eq!(meta_namespace_key(&widget(generated)), Err(KeyError::MissingName));
    }

    #[test]
    fn separator_in_segment_is_rejected() {
        let w = widget(ObjectMeta::namespaced("a/b", "c"));
        assert_eq!(
            meta_namespace_key(&w),
            Err(KeyError::InvalidSegment("a/b".into()))
        );
    }

    #[test]
    fn tombstone_yields_same_key_as_add() {
        let obj = widget(ObjectMeta::namespaced("ns", "foo"));
        let added = meta_namespace_key(&obj).unwrap();
        let tombstone = DeletedObject::FinalStateUnknown {
            key: added.clone(),
            obj: obj.clone(),
        };
        assert_eq!(deletion_handling_key(&tombstone).unwrap(), added);
        assert_eq!(deletion_handling_key(&DeletedObject::Known(obj)).unwrap(), added);
    }

    #[test]
    fn split_handles_both_scopes() {
        assert_eq!(
            split_meta_namespace_key("ns/foo").unwrap(),
            ObjectRef::new("foo").within("ns")
        );
        assert_eq!(split_meta_namespace_key("foo").unwrap(), ObjectRef::new("foo"));
    }

    #[test]
    fn split_rejects_malformed_keys() {
        for key in ["", "a/b/c", "/foo", "ns/", "/"] {
            assert_eq!(
                split_meta_namespace_key(key),
                Err(KeyError::UnexpectedFormat(key.to_string())),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn display_matches_key() {
        let obj = widget(ObjectMeta::namespaced("ns", "foo"));
        assert_eq!(
            ObjectRef::from_obj(&obj).unwrap().to_string(),
            meta_namespace_key(&obj).unwrap()
        );
        assert_eq!(ObjectRef::new("node-a").to_string(), "node-a");
    }
}
