//! Immutable records of reported shared-object accesses.

use std::fmt;
use std::sync::Arc;

/// The kind of access requested on a shared object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AccessType {
    /// The object is accessed but not modified.
    Read,
    /// The object is being modified.
    Write,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Opaque identifier for a shared object.
///
/// Any value that uniquely names the object across transactions works; the
/// kernel relies only on equality, hashing and display.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjectId(Arc<str>);

impl ObjectId {
    /// Wrap an object name.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Arbitrary description attached to an accessed object.
///
/// Descriptions are inspected lazily: the kernel never formats one unless a
/// profile listener asks for it.
pub type ObjectDescription = Arc<dyn fmt::Display + Send + Sync>;

/// A single reported access.
///
/// Two accessed objects are identical iff they were reported through
/// reporters registered under the same source name on the same coordinator
/// and their object id and access type are equal; descriptions do not take
/// part in identity.
#[derive(Clone)]
pub struct AccessedObject {
    object_id: ObjectId,
    access_type: AccessType,
    description: Option<ObjectDescription>,
    source: Arc<str>,
}

impl AccessedObject {
    pub(crate) fn new(object_id: ObjectId, access_type: AccessType, source: Arc<str>) -> Self {
        Self {
            object_id,
            access_type,
            description: None,
            source,
        }
    }

    /// The identifier of the accessed object.
    #[must_use]
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// The kind of access that was reported.
    #[must_use]
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// The supplied description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&ObjectDescription> {
        self.description.as_ref()
    }

    /// The name of the source that reported this access.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Attach a description if none is present yet.
    pub(crate) fn attach_description(&mut self, description: ObjectDescription) {
        if self.description.is_none() {
            self.description = Some(description);
        }
    }
}

impl PartialEq for AccessedObject {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.object_id == other.object_id
            && self.access_type == other.access_type
    }
}

impl Eq for AccessedObject {}

impl fmt::Debug for AccessedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessedObject")
            .field("object_id", &self.object_id)
            .field("access_type", &self.access_type)
            .field("description", &self.description.as_ref().map(|d| d.to_string()))
            .field("source", &self.source)
            .finish()
    }
}
