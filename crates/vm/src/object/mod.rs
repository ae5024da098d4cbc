//! Heap object model for the Lox VM.
//!
//! Every managed object lives in an arena slot addressed by [`ObjRef`]
//! and carries an [`ObjHeader`] (kind tag, flag word, stable id, GC
//! generation) next to its kind-specific body. Cyclic structures
//! (class ↔ singleton class, upvalue chains) are plain index edges the
//! collector follows; nothing here is reference counted.

mod array;
mod class;
mod function;
mod instance;
mod internal;
mod map;
mod string;

pub use array::ArrayObj;
pub use string::hash_bytes;
pub use class::{ClassInfo, ClassObj, IClassObj};
pub use function::{
    BoundMethodObj, CallInfo, ClosureObj, FunctionKind, FunctionObj, NativeFn, NativeObj,
    UpvalueDesc, UpvalueObj, UpvalueState,
};
pub use instance::InstanceObj;
pub use internal::{InternalData, InternalObj, IterState, MutexState, ScopeObj, ThreadRef};
pub use map::MapObj;
pub use string::StringObj;

use bitflags::bitflags;

/// A reference to a heap object: an index into the VM's object arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    /// Builds a reference from a raw arena index.
    pub fn from_raw(index: u32) -> Self {
        ObjRef(index)
    }

    /// Returns the raw arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Object header flags.
    ///
    /// `USER1`..`USER3` are reinterpreted per kind: strings use them for
    /// static/interned/shared, arrays for shared/static.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u16 {
        const DARK           = 1 << 0;
        const HAS_FINALIZER  = 1 << 1;
        const FROZEN         = 1 << 2;
        const NO_GC          = 1 << 3;
        const PUSHED_VM_STACK = 1 << 4;
        const SINGLETON      = 1 << 5;
        const INSTANCE_LIKE  = 1 << 6;
        const USER1          = 1 << 10;
        const USER2          = 1 << 11;
        const USER3          = 1 << 12;

        // per-kind aliases
        const STRING_STATIC   = Self::USER1.bits();
        const STRING_INTERNED = Self::USER2.bits();
        const STRING_SHARED   = Self::USER3.bits();
        const ARRAY_SHARED    = Self::USER1.bits();
        const ARRAY_STATIC    = Self::USER2.bits();
    }
}

/// The kind tag of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Array,
    Map,
    Instance,
    Class,
    Module,
    IClass,
    Function,
    Closure,
    Upvalue,
    BoundMethod,
    Native,
    Internal,
    Scope,
}

impl ObjKind {
    /// Human-readable kind name, used in traces and type errors.
    pub fn name(self) -> &'static str {
        match self {
            ObjKind::String => "String",
            ObjKind::Array => "Array",
            ObjKind::Map => "Map",
            ObjKind::Instance => "Instance",
            ObjKind::Class => "Class",
            ObjKind::Module => "Module",
            ObjKind::IClass => "IClass",
            ObjKind::Function => "Function",
            ObjKind::Closure => "Closure",
            ObjKind::Upvalue => "Upvalue",
            ObjKind::BoundMethod => "BoundMethod",
            ObjKind::Native => "Native",
            ObjKind::Internal => "Internal",
            ObjKind::Scope => "Scope",
        }
    }
}

/// GC generation bounds. An object's generation starts at [`YOUNG_MIN`]
/// and advances by one for each minor collection it survives; at
/// [`OLD_MIN`] it leaves the nursery. [`OLD_MAX`] is a hard ceiling.
pub const YOUNG_MIN: u8 = 0;
pub const YOUNG_MAX: u8 = 2;
pub const OLD_MIN: u8 = 3;
pub const OLD_MAX: u8 = 5;

/// The header shared by all heap objects.
#[derive(Debug, Clone)]
pub struct ObjHeader {
    pub kind: ObjKind,
    pub flags: ObjFlags,
    /// Stable object id, monotonically assigned at allocation.
    pub id: u64,
    /// GC generation, `YOUNG_MIN..=OLD_MAX`.
    pub gen: u8,
}

impl ObjHeader {
    pub fn new(kind: ObjKind, id: u64) -> Self {
        Self {
            kind,
            flags: ObjFlags::empty(),
            id,
            gen: YOUNG_MIN,
        }
    }

    pub fn is_dark(&self) -> bool {
        self.flags.contains(ObjFlags::DARK)
    }

    pub fn is_frozen(&self) -> bool {
        self.flags.contains(ObjFlags::FROZEN)
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(ObjFlags::NO_GC)
    }

    pub fn is_old(&self) -> bool {
        self.gen >= OLD_MIN
    }

    pub fn is_instance_like(&self) -> bool {
        self.flags.contains(ObjFlags::INSTANCE_LIKE)
    }
}

/// The kind-specific payload of a heap object.
#[derive(Debug)]
pub enum ObjBody {
    String(StringObj),
    Array(ArrayObj),
    Map(MapObj),
    Instance(InstanceObj),
    /// Shared by `ObjKind::Class` and `ObjKind::Module`; the header kind
    /// disambiguates.
    Class(ClassObj),
    IClass(IClassObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    BoundMethod(BoundMethodObj),
    Native(NativeObj),
    Internal(InternalObj),
    Scope(ScopeObj),
    /// A swept slot awaiting reuse; holds the next free-list link.
    Free { next_free: Option<u32> },
}

/// One arena slot: header plus body.
#[derive(Debug)]
pub struct HeapObj {
    pub header: ObjHeader,
    pub body: ObjBody,
}

/// The common head shared by every instance-like object (strings,
/// arrays, maps, instances, classes, modules): class pointer, lazily
/// created singleton class, optional finalizer callable, and the
/// property table keyed by interned name.
#[derive(Debug, Default)]
pub struct InstanceCore {
    pub klass: Option<ObjRef>,
    pub singleton: Option<ObjRef>,
    pub finalizer: Option<ObjRef>,
    pub fields: hashbrown::HashMap<ObjRef, crate::value::Value>,
}

impl InstanceCore {
    pub fn with_class(klass: ObjRef) -> Self {
        Self {
            klass: Some(klass),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_flags() {
        let mut header = ObjHeader::new(ObjKind::String, 7);
        assert!(!header.is_frozen());
        header.flags |= ObjFlags::FROZEN | ObjFlags::STRING_INTERNED;
        assert!(header.is_frozen());
        assert!(header.flags.contains(ObjFlags::STRING_INTERNED));
        // USER2 and STRING_INTERNED are the same bit
        assert!(header.flags.contains(ObjFlags::USER2));
    }

    #[test]
    fn test_generations() {
        let header = ObjHeader::new(ObjKind::Array, 0);
        assert_eq!(header.gen, YOUNG_MIN);
        assert!(!header.is_old());
    }
}
