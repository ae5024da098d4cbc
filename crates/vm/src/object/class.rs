//! Classes, modules, and include-class chain links.
//!
//! A `Module` shares the class body; the header kind disambiguates. An
//! `IClass` is the chain link that splices an included module's method
//! tables into a class's superclass walk.

use super::{InstanceCore, ObjRef};
use crate::value::Value;
use hashbrown::HashMap;

/// The method/constant tables and chain edges of a class or module.
#[derive(Debug, Default)]
pub struct ClassInfo {
    /// Interned name string, if the class is named.
    pub name: Option<ObjRef>,
    /// Lexically enclosing class or module, if defined inside one.
    pub under: Option<ObjRef>,
    /// Superclass edge: a Class or an IClass link.
    pub superclass: Option<ObjRef>,
    /// Modules included into this class, in inclusion order.
    pub included: Vec<ObjRef>,
    /// Instance methods, keyed by interned name.
    pub methods: HashMap<ObjRef, Value>,
    /// Property getters, keyed by interned name.
    pub getters: HashMap<ObjRef, Value>,
    /// Property setters, keyed by interned name.
    pub setters: HashMap<ObjRef, Value>,
    /// Constants defined under this class/module.
    pub constants: HashMap<ObjRef, Value>,
    /// Back-pointer to the adorned object when this is a singleton class.
    pub singleton_of: Option<ObjRef>,
}

/// A class or module object.
#[derive(Debug, Default)]
pub struct ClassObj {
    pub core: InstanceCore,
    pub info: ClassInfo,
}

impl ClassObj {
    pub fn new(core: InstanceCore, info: ClassInfo) -> Self {
        Self { core, info }
    }
}

/// An include-class link: wraps a module as a superclass-chain node.
#[derive(Debug)]
pub struct IClassObj {
    /// The class this link was spliced into.
    pub klass: ObjRef,
    /// The wrapped module whose tables the walk consults.
    pub module: ObjRef,
    /// Next link up the chain: a Class or another IClass.
    pub superclass: Option<ObjRef>,
    pub is_setup: bool,
}

impl IClassObj {
    pub fn new(klass: ObjRef, module: ObjRef, superclass: Option<ObjRef>) -> Self {
        Self {
            klass,
            module,
            superclass,
            is_setup: false,
        }
    }
}

/// Which method table a lookup walk consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Method,
    Getter,
    Setter,
}
