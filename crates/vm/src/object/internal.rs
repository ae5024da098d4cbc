//! Internal objects: opaque payloads owned by built-in classes.
//!
//! The C original stores a `void*` plus mark/free callbacks; here the
//! payload is an enum the collector can match on to trace children, and
//! `Drop` releases owned resources.

use super::ObjRef;
use crate::value::Value;
use std::sync::{Arc, Condvar, Mutex};

/// Iteration state produced by the ITER opcode.
#[derive(Debug)]
pub struct IterState {
    /// The array, map-entries snapshot, or instance being iterated.
    pub target: Value,
    pub index: usize,
}

/// Guest mutex state. The uncontended path flips `locked` under the
/// GVL; the contended path waits on the condvar through the suspend
/// machinery.
#[derive(Debug, Default)]
pub struct MutexState {
    pub inner: Arc<(Mutex<bool>, Condvar)>,
    /// Registry slot of the owning thread while locked.
    pub owner: Option<usize>,
}

/// Pointer from a Thread instance to its registry slot.
#[derive(Debug, Clone, Copy)]
pub struct ThreadRef {
    pub slot: usize,
}

/// A captured per-call locals table, used when a binding outlives its
/// frame.
#[derive(Debug)]
pub struct ScopeObj {
    pub function: ObjRef,
    pub locals: Vec<Value>,
}

/// The payload of an Internal object.
#[derive(Debug)]
pub enum InternalData {
    /// Call-shape record embedded in a constant pool.
    CallInfo(super::CallInfo),
    /// Iterator state for ITER/ITER_NEXT.
    Iterator(IterState),
    /// The closure wrapped by a Block instance.
    Block { callable: ObjRef },
    /// Guest mutex handle.
    Mutex(MutexState),
    /// Guest thread handle.
    Thread(ThreadRef),
    /// Compiled regex handle: the pattern source. Pattern compilation
    /// itself is a library collaborator obligation.
    Regex { source: ObjRef },
}

/// An opaque data carrier attached to instances of built-in classes.
#[derive(Debug)]
pub struct InternalObj {
    pub data: InternalData,
}

impl InternalObj {
    pub fn new(data: InternalData) -> Self {
        Self { data }
    }

    pub fn call_info(&self) -> Option<&super::CallInfo> {
        match &self.data {
            InternalData::CallInfo(ci) => Some(ci),
            _ => None,
        }
    }
}
