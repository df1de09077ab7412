use std::fmt;

use remora_protocol::{ObjectId, ObjectRef};

/// Identifies the [`Session`](crate::Session) a handle was issued by.
pub type SessionId = u64;

/// Reference to one object inside the target, bound to the session and
/// connection that produced it.
///
/// Handles are plain data. Whether one is still usable is decided by the
/// session when it is dispatched: a handle from a disposed session fails with
/// [`Error::Disposed`](crate::Error::Disposed), and one from an earlier
/// connection of the same session fails with a connection error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle {
    session: SessionId,
    epoch: u64,
    object: ObjectId,
    type_name: String,
}

impl RemoteHandle {
    pub(crate) fn new(session: SessionId, epoch: u64, object: ObjectRef) -> Self {
        Self {
            session,
            epoch,
            object: object.id,
            type_name: object.type_name,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Connection generation within the session.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Declared type of the object. Fixed for the handle's lifetime.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn to_object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.object, self.type_name.clone())
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@s{}", self.type_name, self.object, self.session)
    }
}
