use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// Version counter of a server-hosted object. Non-decreasing per object.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[archive(check_bytes)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Metadata carried by every revisioned value (terms, lock state, entries).
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ObjectMeta {
    pub revision: Revision,
}

impl ObjectMeta {
    pub fn new(revision: u64) -> Self {
        Self {
            revision: Revision(revision),
        }
    }
}

/// A value that carries object metadata.
pub trait Object {
    fn meta(&self) -> &ObjectMeta;
}

impl Object for ObjectMeta {
    fn meta(&self) -> &ObjectMeta {
        self
    }
}

/// A request that embeds the metadata of the object it targets.
pub trait WithMeta {
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// "Only apply if the object is still at this revision."
///
/// The precondition is stamped into the request right before it is sent and
/// the server does the compare-and-swap. A mismatch comes back as
/// [`Error::PreconditionFailed`](super::error::Error::PreconditionFailed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IfMatch {
    revision: Revision,
}

impl IfMatch {
    /// Matches the revision the caller last observed on `object`.
    pub fn new<O: Object + ?Sized>(object: &O) -> Self {
        Self {
            revision: object.meta().revision,
        }
    }

    pub fn revision(revision: u64) -> Self {
        Self {
            revision: Revision(revision),
        }
    }

    pub fn expected(&self) -> Revision {
        self.revision
    }

    pub fn apply<R: WithMeta + ?Sized>(&self, request: &mut R) {
        request.meta_mut().revision = self.revision;
    }
}

/// Applies an optional precondition; `None` leaves the request untouched.
pub fn apply_match<R: WithMeta + ?Sized>(
    precondition: Option<IfMatch>,
    request: &mut R,
) {
    if let Some(precondition) = precondition {
        precondition.apply(request);
    }
}
