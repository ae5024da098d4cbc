//! Plain instances: a class pointer, a field table, and optionally an
//! opaque internal payload owned by a built-in class.

use super::{InstanceCore, ObjRef};

/// An instance of a guest class.
#[derive(Debug, Default)]
pub struct InstanceObj {
    pub core: InstanceCore,
    /// Opaque data attached by built-in classes (threads, mutexes,
    /// blocks, iterators). Points at an `Internal` object.
    pub internal: Option<ObjRef>,
}

impl InstanceObj {
    pub fn new(core: InstanceCore) -> Self {
        Self {
            core,
            internal: None,
        }
    }
}
