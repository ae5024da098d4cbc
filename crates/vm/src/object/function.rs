//! Callable objects: functions, closures, upvalues, bound methods,
//! native methods, and the call-shape records the compiler embeds in
//! constant pools.

use super::ObjRef;
use crate::chunk::Chunk;
use crate::error::VmResult;
use crate::value::Value;

/// What kind of function a chunk was compiled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Named,
    Anon,
    Init,
    Method,
    Getter,
    Setter,
    ClassMethod,
    /// Top-level scripts compile as a function.
    TopLevel,
    Block,
}

/// One upvalue declaration on a function: either a local slot of the
/// enclosing frame or an upvalue slot of the enclosing closure.
#[derive(Debug, Clone, Copy)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub index: u8,
}

/// A compiled function: bytecode plus call shape.
#[derive(Debug)]
pub struct FunctionObj {
    pub chunk: Chunk,
    /// Interned name string; anonymous functions have none.
    pub name: Option<ObjRef>,
    pub kind: FunctionKind,
    /// Number of required positional parameters.
    pub arity: u16,
    pub num_default_args: u16,
    pub num_kwargs: u16,
    /// Interned names of declared keyword parameters.
    pub kwarg_names: Vec<ObjRef>,
    pub has_rest_arg: bool,
    pub has_block_arg: bool,
    pub is_block: bool,
    pub upvalues: Vec<UpvalueDesc>,
    /// Enclosing class or module when compiled as a method.
    pub klass: Option<ObjRef>,
}

impl FunctionObj {
    pub fn new(chunk: Chunk, kind: FunctionKind) -> Self {
        Self {
            chunk,
            name: None,
            kind,
            arity: 0,
            num_default_args: 0,
            num_kwargs: 0,
            kwarg_names: Vec::new(),
            has_rest_arg: false,
            has_block_arg: false,
            is_block: kind == FunctionKind::Block,
            upvalues: Vec::new(),
            klass: None,
        }
    }

    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }
}

/// Where an upvalue's value lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still on a thread's value stack.
    Open { thread: usize, slot: usize },
    /// Hoisted into the upvalue after the owning frame left.
    Closed(Value),
}

/// An indirection cell letting closures outlive the frame that owns the
/// captured local.
#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

/// A function bundled with its resolved upvalues.
#[derive(Debug)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
    pub is_block: bool,
}

/// A receiver paired with a resolved callable.
#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    /// A Closure or Native.
    pub callable: ObjRef,
}

/// Signature of a native method. `args[0]` is the receiver when the
/// native is a method. Errors are raised through the unwind mechanism,
/// never signalled by return value.
pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> VmResult<Value>;

/// A built-in method implemented in Rust.
pub struct NativeObj {
    pub name: ObjRef,
    pub function: NativeFn,
    /// Owning class or module, if registered as a method.
    pub klass: Option<ObjRef>,
    pub is_static: bool,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObj")
            .field("name", &self.name)
            .field("klass", &self.klass)
            .field("is_static", &self.is_static)
            .finish()
    }
}

/// Call shape carried as an opaque constant next to CALL/INVOKE:
/// positional count, keyword names, splat flag, and the literal block
/// function attached at the call site.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    /// Interned call-site name, for traces.
    pub name: Option<ObjRef>,
    pub argc: u8,
    pub num_kwargs: u8,
    pub kwarg_names: Vec<ObjRef>,
    pub uses_splat: bool,
    /// Function constant of the literal block at this call site.
    pub block_function: Option<ObjRef>,
}
