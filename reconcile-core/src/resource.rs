use crate::metadata::ObjectMeta;

/// An accessor trait for a tracked object.
///
/// Every object the controller handles carries [`ObjectMeta`]. These types SHOULD
/// have `.metadata.name` set, and MAY have `.metadata.namespace` set.
pub trait Resource {
    /// Returns the kind of this object
    fn kind() -> &'static str;

    /// Metadata that all tracked objects must have
    fn meta(&self) -> &ObjectMeta;

    /// Mutable access to the metadata
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Helper methods for resources.
pub trait ResourceExt: Resource {
    /// Returns the most useful name identifier available
    ///
    /// This tries `name`, then `generateName`, and falls back on an empty string when neither is set.
    fn name_any(&self) -> String;
    /// The namespace the resource is in
    fn namespace(&self) -> Option<String>;
    /// The resource version
    fn resource_version(&self) -> Option<String>;
    /// Unique ID (if you delete resource and then create a new
    /// resource with the same name, it will have different ID)
    fn uid(&self) -> Option<String>;
}

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        self.meta()
            .name
            .clone()
            .or_else(|| self.meta().generate_name.clone())
            .unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }
}
