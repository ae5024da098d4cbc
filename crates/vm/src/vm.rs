//! The virtual machine core: value stacks, call frames, dispatch,
//! method lookup, unwinding, and the collector's root discovery.
//!
//! One `Vm` value owns all interpreter state; the GVL wrapper in
//! [`crate::gvl`] serializes access to it across OS threads. Guest
//! threads each own an entry in `threads`; `cur` names the one holding
//! the lock.

use crate::builder::ChunkBuilder;
use crate::chunk::{CatchKind, Chunk};
use crate::error::{SuspendOp, Unwind, VmError, VmResult};
use crate::heap::Heap;
use crate::instruction::Instruction;
use crate::interp::jump_table;
use crate::object::{
    ArrayObj, BoundMethodObj, CallInfo, ClassInfo, ClassObj, ClosureObj, FunctionKind,
    FunctionObj, IClassObj, InstanceCore, InstanceObj, InternalData, InternalObj, IterState,
    MapObj, NativeFn, NativeObj, ObjBody, ObjFlags, ObjKind, ObjRef, ScopeObj, StringObj,
    UpvalueObj, UpvalueState,
};
use crate::thread::{BlockEntry, CallFrame, ExecContext, LxThread, ThreadStatus};
use crate::value::Value;
use hashbrown::HashMap;

/// Frame-stack depth limit; crossing it raises the guest RecursionError.
pub const MAX_FRAMES: usize = 4096;
/// Nested VM re-entry limit (natives calling back into the interpreter).
pub const MAX_RUN_LEVELS: u32 = 256;

/// References to the bootstrapped core classes and modules.
#[derive(Debug, Default, Clone)]
pub struct CoreClasses {
    pub object: Option<ObjRef>,
    pub module: Option<ObjRef>,
    pub class: Option<ObjRef>,
    pub string: Option<ObjRef>,
    pub array: Option<ObjRef>,
    pub map: Option<ObjRef>,
    pub iterator: Option<ObjRef>,
    pub error: Option<ObjRef>,
    pub arg_error: Option<ObjRef>,
    pub type_error: Option<ObjRef>,
    pub name_error: Option<ObjRef>,
    pub syntax_error: Option<ObjRef>,
    pub system_error: Option<ObjRef>,
    pub load_error: Option<ObjRef>,
    pub regex_error: Option<ObjRef>,
    pub recursion_error: Option<ObjRef>,
    pub break_block_error: Option<ObjRef>,
    pub continue_block_error: Option<ObjRef>,
    pub return_block_error: Option<ObjRef>,
    pub thread: Option<ObjRef>,
    pub mutex: Option<ObjRef>,
    pub block: Option<ObjRef>,
    pub gc_module: Option<ObjRef>,
    pub signal_module: Option<ObjRef>,
}

/// Where PRINT output goes; tests capture it.
pub enum PrintTarget {
    Stdout,
    Capture(Vec<u8>),
}

/// What one execution slice produced, for the GVL runner.
#[derive(Debug)]
pub enum SliceOutcome {
    /// Budget exhausted or handoff requested; more work remains.
    Yielded,
    /// A native needs a blocking wait performed without the GVL.
    Suspended(SuspendOp),
    /// The context ran to completion.
    Done(Value),
    /// Explicit exit.
    Exited(i32),
    /// Uncaught guest throwable (already recorded on the thread).
    Errored(Value),
    /// Host fault; not recoverable.
    Faulted(VmError),
}

#[derive(Clone, Copy)]
enum BlockMode {
    /// Top-level loop: a block `return` makes the current frame return.
    Handle,
    /// Nested yield loop: block exits propagate to the native caller.
    Propagate,
}

/// The virtual machine.
pub struct Vm {
    pub heap: Heap,
    pub globals: HashMap<ObjRef, Value>,
    /// VM-wide constant table (top-level classes land here).
    pub constants: HashMap<ObjRef, Value>,
    interned: HashMap<Vec<u8>, ObjRef>,
    pub core: CoreClasses,
    pub threads: Vec<LxThread>,
    /// Registry slot of the thread currently holding the GVL.
    pub cur: usize,
    pub loaded_scripts: Vec<ObjRef>,
    /// Signal number → guest handler callable.
    pub traps: HashMap<i32, Value>,
    pub at_exit: Vec<Value>,
    /// errno → SystemError subclass.
    pub errno_classes: HashMap<i32, ObjRef>,
    /// Back-reference to the GVL wrapper, when one owns this VM.
    pub shared: Option<std::sync::Weak<crate::gvl::VmShared>>,
    pub print_target: PrintTarget,
    /// Finalizers scheduled by the last collection, run at safepoints.
    pending_finalizers: Vec<(ObjRef, ObjRef)>,
    /// Instructions executed since the last handoff check.
    slice_counter: u32,
}

impl Vm {
    /// Creates a VM with the core class hierarchy bootstrapped.
    pub fn new() -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            globals: HashMap::new(),
            constants: HashMap::new(),
            interned: HashMap::new(),
            core: CoreClasses::default(),
            threads: vec![LxThread::new()],
            cur: 0,
            loaded_scripts: Vec::new(),
            traps: HashMap::new(),
            at_exit: Vec::new(),
            errno_classes: HashMap::new(),
            shared: None,
            print_target: PrintTarget::Stdout,
            pending_finalizers: Vec::new(),
            slice_counter: 0,
        };
        crate::runtime::bootstrap(&mut vm);
        vm
    }

    // ---- thread plumbing ----

    pub fn thread(&self) -> &LxThread {
        &self.threads[self.cur]
    }

    pub fn thread_mut(&mut self) -> &mut LxThread {
        let cur = self.cur;
        &mut self.threads[cur]
    }

    pub fn ec(&self) -> &ExecContext {
        self.thread().ec()
    }

    pub fn ec_mut(&mut self) -> &mut ExecContext {
        self.thread_mut().ec_mut()
    }

    // ---- stack ----

    pub fn push(&mut self, v: Value) {
        self.ec_mut().stack.push(v);
    }

    pub fn pop(&mut self) -> VmResult<Value> {
        self.ec_mut()
            .stack
            .pop()
            .ok_or_else(|| VmError::stack_underflow(1, 0).into())
    }

    pub fn pop_n(&mut self, n: usize) -> VmResult<()> {
        let stack = &mut self.ec_mut().stack;
        if stack.len() < n {
            return Err(VmError::stack_underflow(n, stack.len()).into());
        }
        stack.truncate(stack.len() - n);
        Ok(())
    }

    /// Peeks `distance` values below the top.
    pub fn peek(&self, distance: usize) -> VmResult<Value> {
        let stack = &self.ec().stack;
        if stack.len() <= distance {
            return Err(VmError::stack_underflow(distance + 1, stack.len()).into());
        }
        Ok(stack[stack.len() - 1 - distance])
    }

    pub fn stack_len(&self) -> usize {
        self.ec().stack.len()
    }

    pub fn set_stack_at(&mut self, index: usize, v: Value) {
        self.ec_mut().stack[index] = v;
    }

    pub fn stack_at(&self, index: usize) -> Value {
        self.ec().stack[index]
    }

    // ---- frames ----

    pub fn frame(&self) -> &CallFrame {
        self.ec().frames.last().expect("no active frame")
    }

    pub fn frame_mut(&mut self) -> &mut CallFrame {
        self.ec_mut().frames.last_mut().expect("no active frame")
    }

    pub fn frame_count(&self) -> usize {
        self.ec().frames.len()
    }

    /// The function object of the current guest frame.
    pub fn frame_function(&self) -> ObjRef {
        let closure = self.frame().closure.expect("native frame has no chunk");
        self.heap.closure(closure).function
    }

    /// Fetches a constant from the current frame's chunk.
    pub fn frame_constant(&self, index: usize) -> VmResult<Value> {
        let func = self.frame_function();
        Ok(self.heap.function(func).chunk.constant(index)?)
    }

    /// Reads the interned-string constant at `index`.
    pub fn frame_string_constant(&self, index: usize) -> VmResult<ObjRef> {
        let value = self.frame_constant(index)?;
        value
            .as_obj()
            .filter(|r| self.heap.kind(*r) == ObjKind::String)
            .ok_or_else(|| VmError::parse("expected string constant").into())
    }

    /// The block attached to the nearest frame that carries one.
    pub fn nearest_block(&self) -> Option<Value> {
        self.ec().frames.iter().rev().find_map(|f| f.block)
    }

    // ---- interning / allocation ----

    /// Interns a string: frozen, unique by content, pinned old.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        self.intern_bytes(s.as_bytes())
    }

    pub fn intern_bytes(&mut self, bytes: &[u8]) -> ObjRef {
        if let Some(&r) = self.interned.get(bytes) {
            return r;
        }
        let mut s = StringObj::new(InstanceCore::default(), bytes.to_vec());
        s.core.klass = self.core.string;
        s.hash_mut();
        let r = self.heap.alloc(
            ObjKind::String,
            ObjBody::String(s),
            ObjFlags::INSTANCE_LIKE | ObjFlags::FROZEN | ObjFlags::STRING_INTERNED,
        );
        self.heap.promote_now(r);
        self.interned.insert(bytes.to_vec(), r);
        r
    }

    /// Allocates an object, collecting first if the heap asks for it
    /// and pinning the result while a native call is on the stack.
    pub fn alloc_object(&mut self, kind: ObjKind, body: ObjBody, flags: ObjFlags) -> ObjRef {
        if self.heap.wants_gc() {
            self.collect_garbage(false);
        }
        let r = self.heap.alloc(kind, body, flags);
        if self.thread().in_native > 0 {
            self.thread_mut().stack_objects.push(r);
        }
        r
    }

    pub fn new_string(&mut self, bytes: Vec<u8>) -> ObjRef {
        let mut s = StringObj::new(InstanceCore::default(), bytes);
        s.core.klass = self.core.string;
        self.alloc_object(ObjKind::String, ObjBody::String(s), ObjFlags::INSTANCE_LIKE)
    }

    pub fn new_array(&mut self, values: Vec<Value>) -> ObjRef {
        let mut a = ArrayObj::new(InstanceCore::default(), values);
        a.core.klass = self.core.array;
        self.alloc_object(ObjKind::Array, ObjBody::Array(a), ObjFlags::INSTANCE_LIKE)
    }

    /// Copy-on-write duplicate of an existing array.
    pub fn new_array_shared(&mut self, source: ObjRef) -> ObjRef {
        if self.heap.wants_gc() {
            self.collect_garbage(false);
        }
        let mut a = {
            let src = self.heap.array(source);
            ArrayObj::shared_from(InstanceCore::default(), src)
        };
        a.core.klass = self.core.array;
        let r = self.heap.alloc(
            ObjKind::Array,
            ObjBody::Array(a),
            ObjFlags::INSTANCE_LIKE | ObjFlags::ARRAY_SHARED,
        );
        if self.thread().in_native > 0 {
            self.thread_mut().stack_objects.push(r);
        }
        r
    }

    pub fn new_map(&mut self) -> ObjRef {
        let mut m = MapObj::new(InstanceCore::default());
        m.core.klass = self.core.map;
        self.alloc_object(ObjKind::Map, ObjBody::Map(m), ObjFlags::INSTANCE_LIKE)
    }

    pub fn new_instance(&mut self, klass: ObjRef) -> ObjRef {
        let i = InstanceObj::new(InstanceCore::with_class(klass));
        self.alloc_object(
            ObjKind::Instance,
            ObjBody::Instance(i),
            ObjFlags::INSTANCE_LIKE,
        )
    }

    pub fn alloc_function(&mut self, function: FunctionObj) -> ObjRef {
        let r = self
            .heap
            .alloc(ObjKind::Function, ObjBody::Function(function), ObjFlags::empty());
        // Functions are constants; keep them out of the nursery.
        self.heap.promote_now(r);
        r
    }

    pub fn alloc_call_info(&mut self, info: CallInfo) -> ObjRef {
        let r = self.heap.alloc(
            ObjKind::Internal,
            ObjBody::Internal(InternalObj::new(InternalData::CallInfo(info))),
            ObjFlags::empty(),
        );
        self.heap.promote_now(r);
        r
    }

    pub fn new_closure(&mut self, function: ObjRef, upvalues: Vec<ObjRef>) -> ObjRef {
        let is_block = self.heap.function(function).is_block;
        self.alloc_object(
            ObjKind::Closure,
            ObjBody::Closure(ClosureObj {
                function,
                upvalues,
                is_block,
            }),
            ObjFlags::empty(),
        )
    }

    pub fn new_native(&mut self, name: &str, function: NativeFn, klass: Option<ObjRef>) -> ObjRef {
        let name = self.intern(name);
        let r = self.heap.alloc(
            ObjKind::Native,
            ObjBody::Native(NativeObj {
                name,
                function,
                klass,
                is_static: false,
            }),
            ObjFlags::empty(),
        );
        self.heap.promote_now(r);
        r
    }

    pub fn new_bound_method(&mut self, receiver: Value, callable: ObjRef) -> ObjRef {
        self.alloc_object(
            ObjKind::BoundMethod,
            ObjBody::BoundMethod(BoundMethodObj { receiver, callable }),
            ObjFlags::empty(),
        )
    }

    pub fn new_internal(&mut self, data: InternalData) -> ObjRef {
        self.alloc_object(
            ObjKind::Internal,
            ObjBody::Internal(InternalObj::new(data)),
            ObjFlags::empty(),
        )
    }

    /// Captures the nearest guest frame's locals into a Scope object,
    /// the way a binding snapshots the frame it was created in.
    pub fn capture_scope(&mut self) -> ObjRef {
        let frames = &self.ec().frames;
        let index = frames
            .iter()
            .rposition(|f| !f.is_native)
            .expect("scope capture requires a guest frame");
        let base = frames[index].base;
        // The frame's window ends where the next frame begins.
        let end = frames
            .get(index + 1)
            .map(|f| f.base)
            .unwrap_or_else(|| self.stack_len());
        let closure = frames[index].closure.expect("guest frames carry closures");
        let function = self.heap.closure(closure).function;
        let locals = self.ec().stack[base..end].to_vec();
        self.alloc_object(
            ObjKind::Scope,
            ObjBody::Scope(ScopeObj { function, locals }),
            ObjFlags::empty(),
        )
    }

    // ---- classes ----

    /// Creates a class or module object.
    pub fn new_class(
        &mut self,
        name: Option<ObjRef>,
        superclass: Option<ObjRef>,
        is_module: bool,
    ) -> ObjRef {
        let kind = if is_module {
            ObjKind::Module
        } else {
            ObjKind::Class
        };
        let mut body = ClassObj::new(
            InstanceCore::default(),
            ClassInfo {
                name,
                superclass,
                ..ClassInfo::default()
            },
        );
        body.core.klass = if is_module {
            self.core.module
        } else {
            self.core.class
        };
        self.alloc_object(kind, ObjBody::Class(body), ObjFlags::INSTANCE_LIKE)
    }

    /// The class used for method dispatch on a value: its singleton
    /// class when one exists, else its class. Scalars have no class and
    /// yield None.
    pub fn dispatch_class(&self, v: &Value) -> Option<ObjRef> {
        let r = v.as_obj()?;
        let core = self.heap.instance_core(r)?;
        core.singleton.or(core.klass)
    }

    /// Lazily creates the singleton class of an object. Its superclass
    /// is the singleton class of the original's superclass, so lookup
    /// through singleton chains stays consistent.
    pub fn singleton_class_of(&mut self, r: ObjRef) -> VmResult<ObjRef> {
        if let Some(existing) = self.heap.instance_core(r).and_then(|c| c.singleton) {
            return Ok(existing);
        }
        let kind = self.heap.kind(r);
        let super_singleton = match kind {
            ObjKind::Class | ObjKind::Module => {
                match self.heap.class(r).info.superclass {
                    Some(sup) => {
                        let sup = self.resolve_chain_class(sup);
                        Some(self.singleton_class_of(sup)?)
                    }
                    None => self.core.class,
                }
            }
            _ => self.heap.instance_core(r).and_then(|c| c.klass),
        };
        let singleton = self.new_class(None, super_singleton, false);
        self.heap.set_flag(singleton, ObjFlags::SINGLETON);
        self.heap.class_mut(singleton).info.singleton_of = Some(r);
        // Singleton classes are wired into long-lived objects.
        self.heap.promote_now(singleton);
        if let Some(core) = self.heap.instance_core_mut(r) {
            core.singleton = Some(singleton);
        }
        self.heap.obj_write(r, Value::Obj(singleton));
        Ok(singleton)
    }

    /// Follows an IClass link to the class whose tables it exposes.
    fn resolve_chain_class(&self, link: ObjRef) -> ObjRef {
        match self.heap.kind(link) {
            ObjKind::IClass => self.heap.iclass(link).module,
            _ => link,
        }
    }

    /// Includes a module into a class by splicing an IClass link above
    /// the class. Re-including is idempotent.
    pub fn include_module(&mut self, klass: ObjRef, module: ObjRef) -> VmResult<()> {
        if self.heap.class(klass).info.included.contains(&module) {
            return Ok(());
        }
        let old_super = self.heap.class(klass).info.superclass;
        let link = self.alloc_object(
            ObjKind::IClass,
            ObjBody::IClass(IClassObj::new(klass, module, old_super)),
            ObjFlags::empty(),
        );
        self.heap.iclass_mut(link).is_setup = true;
        let info = &mut self.heap.class_mut(klass).info;
        info.superclass = Some(link);
        info.included.push(module);
        self.heap.obj_write(klass, Value::Obj(link));
        self.heap.obj_write(link, Value::Obj(module));
        Ok(())
    }

    /// Walks the superclass chain from `start`, consulting each link's
    /// method table. First match wins.
    pub fn find_method(&self, start: ObjRef, name: ObjRef) -> Option<Value> {
        self.find_in_tables(start, name, |info| &info.methods)
    }

    pub fn find_getter(&self, start: ObjRef, name: ObjRef) -> Option<Value> {
        self.find_in_tables(start, name, |info| &info.getters)
    }

    pub fn find_setter(&self, start: ObjRef, name: ObjRef) -> Option<Value> {
        self.find_in_tables(start, name, |info| &info.setters)
    }

    fn find_in_tables(
        &self,
        start: ObjRef,
        name: ObjRef,
        table: impl Fn(&ClassInfo) -> &HashMap<ObjRef, Value>,
    ) -> Option<Value> {
        let mut link = Some(start);
        while let Some(current) = link {
            let holder = self.resolve_chain_class(current);
            let info = &self.heap.class(holder).info;
            if let Some(&found) = table(info).get(&name) {
                return Some(found);
            }
            link = match self.heap.kind(current) {
                ObjKind::IClass => self.heap.iclass(current).superclass,
                _ => self.heap.class(current).info.superclass,
            };
        }
        None
    }

    /// Class-based `is-a`, walking superclasses and included modules.
    pub fn is_a(&self, v: &Value, klass: ObjRef) -> bool {
        let Some(start) = self
            .dispatch_class(v)
            .or_else(|| v.as_obj().and_then(|r| self.heap.instance_core(r)?.klass))
        else {
            return false;
        };
        let mut link = Some(start);
        while let Some(current) = link {
            let holder = self.resolve_chain_class(current);
            if holder == klass {
                return true;
            }
            link = match self.heap.kind(current) {
                ObjKind::IClass => self.heap.iclass(current).superclass,
                _ => self.heap.class(current).info.superclass,
            };
        }
        false
    }

    /// Printable name of a value's class or kind.
    pub fn type_name(&self, v: &Value) -> String {
        match v {
            Value::Nil => "nil".into(),
            Value::Bool(_) => "bool".into(),
            Value::Number(_) => "number".into(),
            Value::Undef => "undef".into(),
            Value::Obj(r) => {
                if let Some(klass) = self.heap.instance_core(*r).and_then(|c| c.klass) {
                    self.class_name(klass)
                } else {
                    self.heap.kind(*r).name().to_string()
                }
            }
        }
    }

    pub fn class_name(&self, klass: ObjRef) -> String {
        match self.heap.class(klass).info.name {
            Some(n) => self.heap.string(n).as_str_lossy().into_owned(),
            None => {
                if let Some(of) = self.heap.class(klass).info.singleton_of {
                    format!("#<Class of {}>", self.type_name(&Value::Obj(of)))
                } else {
                    "(anon)".to_string()
                }
            }
        }
    }

    // ---- guest errors ----

    /// Builds an instance of an error class with a message property.
    pub fn make_error(&mut self, klass: Option<ObjRef>, message: &str) -> Value {
        let klass = klass.or(self.core.error).expect("error classes bootstrapped");
        let key = self.intern("message");
        // Anchor the message on the stack across the next allocation.
        let msg = self.new_string(message.as_bytes().to_vec());
        self.push(Value::Obj(msg));
        let inst = self.new_instance(klass);
        self.pop().expect("anchor present");
        if let Some(core) = self.heap.instance_core_mut(inst) {
            core.fields.insert(key, Value::Obj(msg));
        }
        self.heap.obj_write(inst, Value::Obj(msg));
        Value::Obj(inst)
    }

    pub fn throw_error(&mut self, klass: Option<ObjRef>, message: &str) -> Unwind {
        Unwind::Throw(self.make_error(klass, message))
    }

    pub fn type_error(&mut self, message: &str) -> Unwind {
        let klass = self.core.type_error;
        self.throw_error(klass, message)
    }

    pub fn arg_error(&mut self, message: &str) -> Unwind {
        let klass = self.core.arg_error;
        self.throw_error(klass, message)
    }

    pub fn name_error(&mut self, message: &str) -> Unwind {
        let klass = self.core.name_error;
        self.throw_error(klass, message)
    }

    /// Raises when an object rejects mutation.
    pub fn frozen_error(&mut self, v: &Value) -> Unwind {
        let name = self.type_name(v);
        let klass = self.core.error;
        self.throw_error(klass, &format!("{name} object is frozen"))
    }

    /// Checks a native's arity window; -1 means unbounded.
    pub fn check_arity(&mut self, name: &str, min: i32, max: i32, argc: usize) -> VmResult<()> {
        let argc = argc as i32;
        let ok = argc >= min && (max < 0 || argc <= max);
        if ok {
            return Ok(());
        }
        let msg = if min == max {
            format!("Error in {name}, expected {min} arg{}, got {argc}", if min == 1 { "" } else { "s" })
        } else if max < 0 {
            format!("Error in {name}, expected at least {min} args, got {argc}")
        } else {
            format!("Error in {name}, expected {min} to {max} args, got {argc}")
        };
        Err(self.arg_error(&msg))
    }

    // ---- upvalues ----

    /// Finds or creates an open upvalue for a stack slot. The open list
    /// stays sorted by slot so closing can scan a suffix.
    pub fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let cur = self.cur;
        let pos = {
            let open = &self.threads[cur].open_upvalues;
            let mut found = None;
            for (i, &u) in open.iter().enumerate() {
                if let UpvalueState::Open { slot: s, .. } = self.heap.upvalue(u).state {
                    if s == slot {
                        found = Some(Err(u));
                        break;
                    }
                    if s > slot {
                        found = Some(Ok(i));
                        break;
                    }
                }
            }
            found
        };
        match pos {
            Some(Err(existing)) => existing,
            insert_at => {
                let u = self.alloc_object(
                    ObjKind::Upvalue,
                    ObjBody::Upvalue(UpvalueObj {
                        state: UpvalueState::Open { thread: cur, slot },
                    }),
                    ObjFlags::empty(),
                );
                let open = &mut self.threads[cur].open_upvalues;
                match insert_at {
                    Some(Ok(i)) => open.insert(i, u),
                    None => open.push(u),
                    Some(Err(_)) => unreachable!(),
                }
                u
            }
        }
    }

    /// Closes every open upvalue at or above `from_slot`: copies the
    /// stack value into the cell and drops the cell from the open list.
    pub fn close_upvalues(&mut self, from_slot: usize) {
        let cur = self.cur;
        let mut closed = Vec::new();
        {
            let open = &self.threads[cur].open_upvalues;
            for &u in open.iter().rev() {
                match self.heap.upvalue(u).state {
                    UpvalueState::Open { slot, .. } if slot >= from_slot => closed.push((u, slot)),
                    UpvalueState::Open { .. } => break,
                    UpvalueState::Closed(_) => {}
                }
            }
        }
        for &(u, slot) in &closed {
            let value = self.threads[cur].ec().stack.get(slot).copied().unwrap_or(Value::Nil);
            self.heap.upvalue_mut(u).state = UpvalueState::Closed(value);
            self.heap.obj_write(u, value);
        }
        let open = &mut self.threads[cur].open_upvalues;
        open.retain(|u| !closed.iter().any(|(c, _)| c == u));
    }

    /// Reads through an upvalue cell.
    pub fn upvalue_get(&self, u: ObjRef) -> Value {
        match self.heap.upvalue(u).state {
            UpvalueState::Open { thread, slot } => self.threads[thread].ec().stack[slot],
            UpvalueState::Closed(v) => v,
        }
    }

    /// Writes through an upvalue cell.
    pub fn upvalue_set(&mut self, u: ObjRef, v: Value) {
        match self.heap.upvalue(u).state {
            UpvalueState::Open { thread, slot } => {
                self.threads[thread].ec_mut().stack[slot] = v;
            }
            UpvalueState::Closed(_) => {
                self.heap.upvalue_mut(u).state = UpvalueState::Closed(v);
                self.heap.obj_write(u, v);
            }
        }
    }

    // ---- calls ----

    /// Calls the value sitting below the arguments on the stack.
    /// Stack layout: `[callable, arg1..argN, kwargsMap?]`; `argc`
    /// counts positionals only, and the callable slot becomes the
    /// frame's slot 0.
    pub fn call_value(
        &mut self,
        argc: usize,
        call_info: Option<&CallInfo>,
        this: Option<Value>,
    ) -> VmResult<()> {
        let mut argc = argc;
        let num_kwargs = call_info.map(|ci| ci.num_kwargs as usize).unwrap_or(0);

        // Splat: the last positional argument expands in place. It
        // sits below the kwargs map when one was pushed.
        if call_info.map(|ci| ci.uses_splat).unwrap_or(false) && argc > 0 {
            let kwargs = if num_kwargs > 0 { Some(self.pop()?) } else { None };
            let splat = self.pop()?;
            let Some(ary) = splat
                .as_obj()
                .filter(|r| self.heap.kind(*r) == ObjKind::Array)
            else {
                return Err(self.type_error("splat argument must be an Array"));
            };
            let values = self.heap.array(ary).values().to_vec();
            argc = argc - 1 + values.len();
            for v in values {
                self.push(v);
            }
            if let Some(kwargs) = kwargs {
                self.push(kwargs);
            }
        }

        let extra = if num_kwargs > 0 { 1 } else { 0 };
        let callee = self.peek(argc + extra)?;
        let Some(r) = callee.as_obj() else {
            let name = self.type_name(&callee);
            return Err(self.type_error(&format!("{name} is not callable")));
        };

        match self.heap.kind(r) {
            ObjKind::Closure => self.call_closure(r, argc, call_info, this),
            ObjKind::Native => self.call_native(r, argc, call_info, this),
            ObjKind::BoundMethod => {
                let (receiver, callable) = {
                    let bm = self.heap.bound_method(r);
                    (bm.receiver, bm.callable)
                };
                // Replace the bound method with the receiver in slot 0.
                let base = self.stack_len() - argc - extra - 1;
                self.set_stack_at(base, receiver);
                // The callable goes where the VM expects slot 0;
                // receiver rides in as `this`.
                match self.heap.kind(callable) {
                    ObjKind::Closure => self.call_closure(callable, argc, call_info, Some(receiver)),
                    _ => self.call_native(callable, argc, call_info, Some(receiver)),
                }
            }
            ObjKind::Class => {
                // Instantiate, then run init when defined.
                let instance = self.new_instance(r);
                let base = self.stack_len() - argc - extra - 1;
                self.set_stack_at(base, Value::Obj(instance));
                let init_name = self.intern("init");
                if let Some(init) = self.find_method(r, init_name) {
                    let callable = init.as_obj().expect("methods are callables");
                    match self.heap.kind(callable) {
                        ObjKind::Closure => self.call_closure(
                            callable,
                            argc,
                            call_info,
                            Some(Value::Obj(instance)),
                        ),
                        // A native init returns the receiver itself.
                        _ => self.call_native(callable, argc, call_info, Some(Value::Obj(instance))),
                    }
                } else if argc > 0 {
                    let name = self.class_name(r);
                    Err(self.arg_error(&format!(
                        "Error in {name}#init, expected 0 args, got {argc}"
                    )))
                } else {
                    // No init: the instance is the call's value.
                    self.pop_n(argc + extra)?;
                    Ok(())
                }
            }
            _ => {
                let name = self.type_name(&callee);
                Err(self.type_error(&format!("{name} is not callable")))
            }
        }
    }

    fn call_closure(
        &mut self,
        closure: ObjRef,
        argc: usize,
        call_info: Option<&CallInfo>,
        this: Option<Value>,
    ) -> VmResult<()> {
        if self.frame_count() >= MAX_FRAMES {
            let klass = self.core.recursion_error;
            return Err(self.throw_error(klass, "call stack too deep"));
        }

        let function = self.heap.closure(closure).function;
        let (arity, defaults, has_rest, num_kwargs, name, fkind) = {
            let f = self.heap.function(function);
            (
                f.arity as usize,
                f.num_default_args as usize,
                f.has_rest_arg,
                f.num_kwargs as usize,
                f.name,
                f.kind,
            )
        };

        // A trailing kwargs map is not a positional argument.
        let kwargs = if call_info.map(|ci| ci.num_kwargs > 0).unwrap_or(false) {
            Some(self.pop()?)
        } else {
            None
        };
        let mut argc = argc;

        if argc < arity {
            let fname = self.callable_name(name);
            return Err(self.arg_error(&format!(
                "Error in {fname}, expected at least {arity} args, got {argc}"
            )));
        }
        if argc > arity + defaults {
            if has_rest {
                // Collect extras into the rest array. The array is
                // allocated while the extras are still stack-rooted.
                let extra = argc - arity - defaults;
                let start = self.stack_len() - extra;
                let values: Vec<Value> = self.ec().stack[start..].to_vec();
                let rest = self.new_array(values);
                self.pop_n(extra)?;
                self.push(Value::Obj(rest));
                argc = arity + defaults + 1;
            } else {
                let fname = self.callable_name(name);
                let max = arity + defaults;
                return Err(self.arg_error(&format!(
                    "Error in {fname}, expected {arity} to {max} args, got {argc}"
                )));
            }
        } else {
            // Unsupplied optional parameters start undefined; compiled
            // default-initializers branch on that.
            let missing = arity + defaults - argc;
            if has_rest && missing == 0 {
                let rest = self.new_array(Vec::new());
                self.push(Value::Obj(rest));
                argc += 1;
            } else {
                for _ in 0..missing {
                    self.push(Value::Undef);
                }
                argc += missing;
                if has_rest {
                    let rest = self.new_array(Vec::new());
                    self.push(Value::Obj(rest));
                    argc += 1;
                }
            }
        }

        // The kwargs map lands after positionals, at its own slot.
        if num_kwargs > 0 {
            let map = match kwargs {
                Some(m) => m,
                None => {
                    let m = self.new_map();
                    Value::Obj(m)
                }
            };
            self.push(map);
            argc += 1;
        }

        let base = self.stack_len() - argc - 1;
        let block = self.block_argument(call_info)?;
        let cref = self.heap.function(function).klass;
        let this = this.or_else(|| {
            matches!(
                fkind,
                FunctionKind::Method | FunctionKind::Init | FunctionKind::Getter | FunctionKind::Setter
            )
            .then(|| self.stack_at(base))
        });

        self.ec_mut().frames.push(CallFrame {
            closure: Some(closure),
            ip: 0,
            base,
            this,
            cref,
            cref_stack: Vec::new(),
            name,
            file: None,
            is_native: false,
            block,
            active_catches: Vec::new(),
        });
        Ok(())
    }

    /// The innermost class/module body for constant definition and
    /// lookup: class bodies entered in this frame win over the
    /// function's lexical home. None outside any frame.
    pub fn effective_cref(&self) -> Option<ObjRef> {
        let frame = self.ec().frames.last()?;
        frame.cref_stack.last().copied().or(frame.cref)
    }

    fn call_native(
        &mut self,
        native: ObjRef,
        argc: usize,
        call_info: Option<&CallInfo>,
        this: Option<Value>,
    ) -> VmResult<()> {
        // A trailing kwargs map rides along as one more argument.
        let extra = call_info
            .map(|ci| usize::from(ci.num_kwargs > 0))
            .unwrap_or(0);
        let base = self.stack_len() - argc - extra - 1;
        let block = self.block_argument(call_info)?;
        let (function, name, is_method) = {
            let n = self.heap.native(native);
            (n.function, n.name, n.klass.is_some())
        };

        // Method natives see `args[0]` as the receiver; global natives
        // get the bare argument list.
        let mut args: Vec<Value> = Vec::with_capacity(argc + 1);
        if is_method || this.is_some() {
            args.push(this.unwrap_or_else(|| self.stack_at(base)));
        }
        args.extend_from_slice(&self.ec().stack[base + 1..]);

        self.ec_mut()
            .frames
            .push(CallFrame::native(base, Some(name), block));
        self.thread_mut().in_native += 1;
        let pinned = self.thread().stack_objects.len();

        let result = function(self, &args);

        self.thread_mut().in_native -= 1;
        self.thread_mut().stack_objects.truncate(pinned);

        match result {
            Ok(value) => {
                self.ec_mut().frames.pop();
                self.ec_mut().stack.truncate(base);
                self.push(value);
                Ok(())
            }
            Err(Unwind::Suspend(op)) => {
                // Leave the frame in place; the runner completes the
                // call after the wait via `complete_suspend`.
                Err(Unwind::Suspend(op))
            }
            Err(other) => {
                self.ec_mut().frames.pop();
                self.ec_mut().stack.truncate(base);
                Err(other)
            }
        }
    }

    /// Builds the block argument for a call from its CallInfo: a
    /// literal block function closes over the calling frame.
    fn block_argument(&mut self, call_info: Option<&CallInfo>) -> VmResult<Option<Value>> {
        let Some(ci) = call_info else { return Ok(None) };
        let Some(block_fn) = ci.block_function else {
            return Ok(None);
        };
        let closure = self.make_closure_over_current_frame(block_fn)?;
        Ok(Some(Value::Obj(closure)))
    }

    /// Instantiates a closure for `function`, resolving its upvalue
    /// descriptors against the current frame.
    pub fn make_closure_over_current_frame(&mut self, function: ObjRef) -> VmResult<ObjRef> {
        let descs = self.heap.function(function).upvalues.clone();
        let frame_base = self.frame().base;
        let enclosing = self.frame().closure;
        let mut upvalues = Vec::with_capacity(descs.len());
        for desc in descs {
            if desc.is_local {
                let u = self.capture_upvalue(frame_base + desc.index as usize);
                upvalues.push(u);
            } else {
                let enclosing = enclosing
                    .ok_or_else(|| VmError::invalid_operation_msg("upvalue from native frame"))?;
                upvalues.push(self.heap.closure(enclosing).upvalues[desc.index as usize]);
            }
        }
        Ok(self.new_closure(function, upvalues))
    }

    fn callable_name(&self, name: Option<ObjRef>) -> String {
        match name {
            Some(n) => self.heap.string(n).as_str_lossy().into_owned(),
            None => "(anon)".to_string(),
        }
    }

    /// Return from the current guest frame with `result`: close
    /// upvalues over its slots, pop it, drop its stack window, push the
    /// result for the caller.
    pub fn do_return(&mut self, result: Value) {
        let frame = self.ec_mut().frames.pop().expect("return without frame");
        self.close_upvalues(frame.base);
        self.ec_mut().stack.truncate(frame.base);
        self.push(result);
    }

    // ---- method invocation ----

    /// INVOKE: looks the method up on the receiver's dispatch chain and
    /// calls it. The receiver sits below the arguments.
    pub fn invoke_method(
        &mut self,
        name: ObjRef,
        argc: usize,
        call_info: Option<&CallInfo>,
    ) -> VmResult<()> {
        let extra = call_info
            .map(|ci| usize::from(ci.num_kwargs > 0))
            .unwrap_or(0);
        let receiver = self.peek(argc + extra)?;
        let Some(start) = self.dispatch_class(&receiver) else {
            let tname = self.type_name(&receiver);
            let mname = self.heap.string(name).as_str_lossy().into_owned();
            return Err(self.name_error(&format!("undefined method '{mname}' for {tname}")));
        };
        let Some(method) = self.find_method(start, name) else {
            let tname = self.type_name(&receiver);
            let mname = self.heap.string(name).as_str_lossy().into_owned();
            return Err(self.name_error(&format!("undefined method '{mname}' for {tname}")));
        };
        let callable = method.as_obj().expect("methods are callables");
        match self.heap.kind(callable) {
            ObjKind::Closure => self.call_closure(callable, argc, call_info, Some(receiver)),
            ObjKind::Native => self.call_native(callable, argc, call_info, Some(receiver)),
            _ => {
                let mname = self.heap.string(name).as_str_lossy().into_owned();
                Err(self.type_error(&format!("method '{mname}' is not callable")))
            }
        }
    }

    /// Synchronous re-entry: pushes `callable` and `args`, runs a
    /// nested interpreter pass, and returns the call's value. This is
    /// how natives, finalizers, and operator fallbacks call guest code.
    pub fn call_function_sync(
        &mut self,
        callable: Value,
        args: &[Value],
        block: Option<Value>,
    ) -> VmResult<Value> {
        if self.thread().run_level >= MAX_RUN_LEVELS {
            let klass = self.core.recursion_error;
            return Err(self.throw_error(klass, "VM recursion limit reached"));
        }
        let entry_frames = self.frame_count();
        self.push(callable);
        for &a in args {
            self.push(a);
        }
        let ci = CallInfo {
            argc: args.len() as u8,
            ..CallInfo::default()
        };
        self.call_value(args.len(), Some(&ci), None)?;

        // A native callee already completed and left its result on the
        // stack.
        if self.frame_count() == entry_frames {
            return self.pop();
        }
        if let Some(block) = block {
            self.frame_mut().block = Some(block);
        }

        self.thread_mut().run_level += 1;
        let result = self.run_until(entry_frames, BlockMode::Propagate);
        self.thread_mut().run_level -= 1;
        result
    }

    /// Invokes `receiver.method(args)` synchronously, for natives and
    /// operator fallbacks.
    pub fn call_method_sync(
        &mut self,
        receiver: Value,
        name: ObjRef,
        args: &[Value],
    ) -> VmResult<Value> {
        let entry_frames = self.frame_count();
        self.push(receiver);
        for &a in args {
            self.push(a);
        }
        self.invoke_method(name, args.len(), None)?;
        if self.frame_count() == entry_frames {
            return self.pop();
        }
        self.thread_mut().run_level += 1;
        let result = self.run_until(entry_frames, BlockMode::Propagate);
        self.thread_mut().run_level -= 1;
        result
    }

    /// Calls a resolved callable with an explicit receiver in slot 0,
    /// synchronously. Getters, setters, block yields, and finalizer
    /// dispatch use this; `this` may differ from the slot-0 value (a
    /// block runs with its home frame's receiver).
    pub fn call_callable_sync(
        &mut self,
        callable: ObjRef,
        slot0: Value,
        this: Option<Value>,
        args: &[Value],
    ) -> VmResult<Value> {
        if self.thread().run_level >= MAX_RUN_LEVELS {
            let klass = self.core.recursion_error;
            return Err(self.throw_error(klass, "VM recursion limit reached"));
        }
        let entry_frames = self.frame_count();
        self.push(slot0);
        for &a in args {
            self.push(a);
        }
        match self.heap.kind(callable) {
            ObjKind::Closure => self.call_closure(callable, args.len(), None, this)?,
            ObjKind::Native => self.call_native(callable, args.len(), None, this)?,
            _ => {
                self.pop_n(args.len() + 1)?;
                return Err(self.type_error("value is not callable"));
            }
        }
        if self.frame_count() == entry_frames {
            return self.pop();
        }
        self.thread_mut().run_level += 1;
        let result = self.run_until(entry_frames, BlockMode::Propagate);
        self.thread_mut().run_level -= 1;
        result
    }

    // ---- the interpreter loop ----

    /// Runs a whole function object to completion on the current
    /// thread; the embedding entry point for scripts. Re-entrant
    /// interpretation (a native calling back in while guest code runs)
    /// executes in its own execution context.
    pub fn interpret_function(&mut self, function: ObjRef) -> VmResult<Value> {
        let nested = self.frame_count() > 0 || self.stack_len() > 0;
        if nested {
            self.thread_mut().ecs.push(ExecContext::default());
        }
        let result = self.interpret_in_current_ec(function);
        if nested {
            self.thread_mut().ecs.pop();
        }
        result
    }

    fn interpret_in_current_ec(&mut self, function: ObjRef) -> VmResult<Value> {
        let closure = self.new_closure(function, Vec::new());
        self.push(Value::Obj(closure));
        let base = self.stack_len() - 1;
        let name = self.heap.function(function).name;
        self.ec_mut().frames.push(CallFrame {
            closure: Some(closure),
            ip: 0,
            base,
            this: None,
            cref: None,
            cref_stack: Vec::new(),
            name,
            file: None,
            is_native: false,
            block: None,
            active_catches: Vec::new(),
        });
        self.thread_mut().status = ThreadStatus::Running;
        let entry = self.frame_count() - 1;
        let result = self.run_until(entry, BlockMode::Handle);
        if let Err(Unwind::Throw(v)) = &result {
            let v = *v;
            self.report_uncaught(v);
        }
        result
    }

    /// Builds a top-level function around a chunk and runs it.
    pub fn interpret_chunk(&mut self, chunk: Chunk) -> VmResult<Value> {
        let mut function = FunctionObj::new(chunk, FunctionKind::TopLevel);
        function.name = Some(self.intern("main"));
        let function = self.alloc_function(function);
        self.interpret_function(function)
    }

    /// Runs until the frame stack drops back to `min_frames`.
    fn run_until(&mut self, min_frames: usize, mode: BlockMode) -> VmResult<Value> {
        loop {
            if self.frame_count() <= min_frames {
                // The awaited frame returned; its value is on top.
                return self.pop();
            }
            match self.step() {
                Ok(()) => {}
                Err(Unwind::ReturnBlock(v)) => match mode {
                    BlockMode::Handle if self.frame_count() > min_frames => {
                        // A block `return` returns from the method that
                        // contains the block.
                        self.do_return(v);
                    }
                    _ => {
                        self.unwind_to(min_frames);
                        return Err(Unwind::ReturnBlock(v));
                    }
                },
                Err(unwind) => match self.handle_unwind(unwind, min_frames)? {
                    Handled::Continue => {}
                    Handled::Propagate(unwind) => {
                        return Err(unwind);
                    }
                },
            }
        }
    }

    /// One execution slice for the GVL runner: up to `budget`
    /// instructions of the current thread's outermost loop.
    pub fn run_slice(&mut self, budget: u32) -> SliceOutcome {
        self.slice_counter = 0;
        loop {
            if self.frame_count() == 0 {
                let result = self.pop().unwrap_or(Value::Nil);
                self.thread_mut().result = result;
                return SliceOutcome::Done(result);
            }
            if self.slice_counter >= budget {
                return SliceOutcome::Yielded;
            }
            match self.step() {
                Ok(()) => {}
                Err(Unwind::ReturnBlock(v)) if self.frame_count() > 0 => {
                    self.do_return(v);
                }
                Err(unwind) => match self.handle_unwind(unwind, 0) {
                    Ok(Handled::Continue) => {}
                    Ok(Handled::Propagate(Unwind::Suspend(op))) => {
                        return SliceOutcome::Suspended(op);
                    }
                    Ok(Handled::Propagate(Unwind::Exit(code)))
                    | Err(Unwind::Exit(code)) => return SliceOutcome::Exited(code),
                    Ok(Handled::Propagate(Unwind::Throw(v))) | Err(Unwind::Throw(v)) => {
                        self.report_uncaught(v);
                        self.thread_mut().errored = true;
                        self.thread_mut().last_error = v;
                        return SliceOutcome::Errored(v);
                    }
                    Ok(Handled::Propagate(Unwind::Fault(e))) | Err(Unwind::Fault(e)) => {
                        return SliceOutcome::Faulted(e);
                    }
                    Ok(Handled::Propagate(other)) | Err(other) => {
                        // Block exits with no enclosing block context.
                        let v = self.make_error(
                            self.core.error,
                            &format!("unexpected block control flow: {other:?}"),
                        );
                        self.report_uncaught(v);
                        self.thread_mut().errored = true;
                        return SliceOutcome::Errored(v);
                    }
                },
            }
        }
    }

    /// Decodes and executes one instruction.
    fn step(&mut self) -> VmResult<()> {
        self.slice_counter = self.slice_counter.wrapping_add(1);
        self.safepoint()?;

        let frame = self.frame();
        let ip = frame.ip;
        let function = self.frame_function();
        let code_len = self.heap.function(function).chunk.len();
        if ip >= code_len {
            // Implicit return at end of chunk.
            self.do_return(Value::Nil);
            return Ok(());
        }
        let insn = {
            let f = self.heap.function(function);
            Instruction::parse(&f.chunk, &self.heap, ip)?
        };
        // Advance past the instruction before dispatch; jumps and calls
        // overwrite ip from here.
        self.frame_mut().ip = ip + insn.size();
        self.thread_mut().last_opcode = Some(insn.opcode);

        let handler = jump_table()
            .get(insn.opcode)
            .ok_or_else(|| VmError::invalid_opcode(insn.opcode as u8))?;
        handler(self, &insn)
    }

    /// Per-instruction safepoint: deliverable signals, interrupts, and
    /// injected raises.
    fn safepoint(&mut self) -> VmResult<()> {
        if let Some(v) = self.thread_mut().pending_raise.take() {
            self.thread_mut().last_error = v;
            return Err(Unwind::Throw(v));
        }
        let interrupts = self.thread().interrupts.clone();
        if interrupts.take_interrupt() {
            if interrupts
                .exit_requested
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                let code = interrupts
                    .exit_code
                    .load(std::sync::atomic::Ordering::SeqCst);
                return Err(Unwind::Exit(code));
            }
        }
        // Finalizers scheduled by the collector run here, with the GVL
        // held, outside any allocation path.
        if !self.pending_finalizers.is_empty() && self.thread().in_native == 0 {
            let pending = std::mem::take(&mut self.pending_finalizers);
            for (obj, finalizer) in pending {
                let _ = self.call_function_sync(
                    Value::Obj(finalizer),
                    &[Value::Obj(obj)],
                    None,
                );
            }
        }
        Ok(())
    }

    /// Drains one pending signal, if any, invoking the trap handler or
    /// raising. Called by the GVL runner on the main thread.
    pub fn deliver_pending_signal(&mut self, signo: i32) -> VmResult<()> {
        if let Some(&handler) = self.traps.get(&signo) {
            self.call_function_sync(handler, &[Value::Number(signo as f64)], None)?;
            Ok(())
        } else if signo == 2 {
            // SIGINT with no trap raises on the main thread.
            let klass = self.core.error;
            Err(self.throw_error(klass, "Interrupt"))
        } else {
            Ok(())
        }
    }

    // ---- unwinding ----

    fn unwind_to(&mut self, min_frames: usize) {
        while self.frame_count() > min_frames {
            let frame = self.ec_mut().frames.pop().expect("counted");
            self.close_upvalues(frame.base);
            self.ec_mut().stack.truncate(frame.base);
        }
    }

    /// Walks frames top-down looking for a catch-table row matching the
    /// in-flight unwind. Guest frames below `min_frames`, native
    /// frames, and non-matching unwind kinds propagate to the caller.
    fn handle_unwind(&mut self, unwind: Unwind, min_frames: usize) -> VmResult<Handled> {
        match &unwind {
            Unwind::Throw(_) | Unwind::BreakBlock | Unwind::ContinueBlock(_)
            | Unwind::ReturnBlock(_) => {}
            // Suspend, Exit, Fault never unwind guest frames here.
            _ => return Ok(Handled::Propagate(unwind)),
        }

        loop {
            if self.frame_count() <= min_frames {
                return Ok(Handled::Propagate(unwind));
            }
            let frame = self.frame();
            if frame.is_native {
                // The Rust caller owns cleanup past this boundary.
                return Ok(Handled::Propagate(unwind));
            }

            if let Some(row_index) = self.find_catch_row(&unwind)? {
                let function = self.frame_function();
                let (target, is_ensure) = {
                    let row = &self.heap.function(function).chunk.catch_tables[row_index];
                    (row.target, matches!(row.kind, CatchKind::Ensure))
                };
                // Stash the throwable on the row for GET_THROWN.
                if let Unwind::Throw(v) = &unwind {
                    let v = *v;
                    self.heap.function_mut(function).chunk.catch_tables[row_index].thrown =
                        Some(v);
                    self.heap.obj_write(function, v);
                }
                let pending = if is_ensure { Some(unwind) } else { None };
                let frame = self.frame_mut();
                frame.ip = target;
                frame.active_catches.push((row_index, pending));
                return Ok(Handled::Continue);
            }

            // No handler here: drop the frame and keep walking.
            let frame = self.ec_mut().frames.pop().expect("counted");
            self.close_upvalues(frame.base);
            self.ec_mut().stack.truncate(frame.base);
        }
    }

    /// Finds the innermost catch row of the current frame covering the
    /// current ip. Class rows resolve their name to a class lazily and
    /// cache it; ensure rows match any unwind.
    fn find_catch_row(&mut self, unwind: &Unwind) -> VmResult<Option<usize>> {
        let function = self.frame_function();
        // ip already points past the faulting instruction; its first
        // byte is what the table ranges cover.
        let ip = self.frame().ip.saturating_sub(1);

        let candidates: Vec<(usize, CatchKind)> = {
            let rows = &self.heap.function(function).chunk.catch_tables;
            rows.iter()
                .enumerate()
                .filter(|(_, row)| row.from <= ip && ip < row.to)
                .map(|(i, row)| (i, row.kind.clone()))
                .collect()
        };

        for (index, kind) in candidates {
            match kind {
                CatchKind::Ensure => return Ok(Some(index)),
                CatchKind::Class { name, resolved } => {
                    let Unwind::Throw(v) = unwind else { continue };
                    let klass = match resolved {
                        Some(k) => k,
                        None => {
                            let Some(k) = self.resolve_class_by_name(name) else {
                                continue;
                            };
                            // Cache the resolution on the row.
                            if let CatchKind::Class { resolved, .. } = &mut self
                                .heap
                                .function_mut(function)
                                .chunk
                                .catch_tables[index]
                                .kind
                            {
                                *resolved = Some(k);
                            }
                            k
                        }
                    };
                    if self.is_a(v, klass) {
                        return Ok(Some(index));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Resolves a class reference stored as a string: the cref chain,
    /// then the VM-wide constant table, then globals.
    pub fn resolve_class_by_name(&self, name: ObjRef) -> Option<ObjRef> {
        let mut found = None;
        let mut cref = self.effective_cref();
        while let Some(k) = cref {
            if let Some(v) = self.heap.class(k).info.constants.get(&name) {
                found = v.as_obj();
                break;
            }
            cref = self.heap.class(k).info.under;
        }
        let found = found
            .or_else(|| self.constants.get(&name).and_then(|v| v.as_obj()))
            .or_else(|| self.globals.get(&name).and_then(|v| v.as_obj()))?;
        matches!(self.heap.kind(found), ObjKind::Class | ObjKind::Module).then_some(found)
    }

    fn report_uncaught(&mut self, v: Value) {
        let class_name = self
            .dispatch_class(&v)
            .map(|k| self.class_name(k))
            .unwrap_or_else(|| self.type_name(&v));
        let message = v
            .as_obj()
            .and_then(|r| self.heap.instance_core(r))
            .and_then(|core| {
                let key = self.interned.get(b"message".as_slice())?;
                core.fields.get(key).copied()
            })
            .map(|m| self.display_value(&m))
            .unwrap_or_default();
        let mut trace = format!("Uncaught error, class: {class_name}, message:\n  \"{message}\"\nBacktrace:\n");
        for frame in self.ec().frames.iter().rev() {
            let name = self.callable_name(frame.name);
            trace.push_str(&format!("  in: {name}\n"));
        }
        self.print_raw(&trace);
        self.thread_mut().last_error = v;
    }

    // ---- printing ----

    pub fn display_value(&self, v: &Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Undef => "<undef>".to_string(),
            Value::Number(n) => format_number(*n),
            Value::Obj(r) => match self.heap.kind(*r) {
                ObjKind::String => self.heap.string(*r).as_str_lossy().into_owned(),
                ObjKind::Array => {
                    let parts: Vec<String> = self
                        .heap
                        .array(*r)
                        .values()
                        .iter()
                        .map(|e| self.inspect_value(e))
                        .collect();
                    format!("[{}]", parts.join(","))
                }
                ObjKind::Map => {
                    let parts: Vec<String> = self
                        .heap
                        .map(*r)
                        .table
                        .iter()
                        .map(|(k, e)| {
                            format!("{} => {}", self.inspect_value(&k), self.inspect_value(&e))
                        })
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                ObjKind::Class | ObjKind::Module => self.class_name(*r),
                ObjKind::Closure | ObjKind::Function | ObjKind::Native => {
                    "<fun>".to_string()
                }
                ObjKind::Instance => {
                    let name = self.type_name(v);
                    format!("#<{name}>")
                }
                kind => format!("<{}>", kind.name()),
            },
        }
    }

    fn inspect_value(&self, v: &Value) -> String {
        match v {
            Value::Obj(r) if self.heap.kind(*r) == ObjKind::String => {
                format!("\"{}\"", self.heap.string(*r).as_str_lossy())
            }
            _ => self.display_value(v),
        }
    }

    pub fn print_line(&mut self, s: &str) {
        match &mut self.print_target {
            PrintTarget::Stdout => println!("{s}"),
            PrintTarget::Capture(buf) => {
                buf.extend_from_slice(s.as_bytes());
                buf.push(b'\n');
            }
        }
    }

    fn print_raw(&mut self, s: &str) {
        match &mut self.print_target {
            PrintTarget::Stdout => eprint!("{s}"),
            PrintTarget::Capture(buf) => buf.extend_from_slice(s.as_bytes()),
        }
    }

    /// Switches PRINT into capture mode; tests read the buffer back.
    pub fn capture_output(&mut self) {
        self.print_target = PrintTarget::Capture(Vec::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.print_target {
            PrintTarget::Capture(buf) => String::from_utf8_lossy(&std::mem::take(buf)).into_owned(),
            PrintTarget::Stdout => String::new(),
        }
    }

    // ---- iteration support ----

    /// ITER: converts a value into an iterator object.
    pub fn make_iterator(&mut self, target: Value) -> VmResult<Value> {
        let Some(r) = target.as_obj() else {
            let name = self.type_name(&target);
            return Err(self.type_error(&format!("{name} is not iterable")));
        };
        let target = match self.heap.kind(r) {
            ObjKind::Array => target,
            ObjKind::Map => {
                // Iterate a snapshot of entries as [key, value] pairs,
                // anchoring each pair on the stack while the rest
                // allocate.
                let entries: Vec<(Value, Value)> = self.heap.map(r).table.iter().collect();
                let count = entries.len();
                for (k, v) in entries {
                    let pair = self.new_array(vec![k, v]);
                    self.push(Value::Obj(pair));
                }
                let start = self.stack_len() - count;
                let pairs = self.ec().stack[start..].to_vec();
                let snapshot = self.new_array(pairs);
                self.pop_n(count)?;
                Value::Obj(snapshot)
            }
            _ => {
                let name = self.type_name(&target);
                return Err(self.type_error(&format!("{name} is not iterable")));
            }
        };
        // Anchor the target while the iterator cell allocates.
        self.push(target);
        let iter = self.new_internal(InternalData::Iterator(IterState { target, index: 0 }));
        self.pop()?;
        Ok(Value::Obj(iter))
    }

    /// ITER_NEXT: the next element, or undef when exhausted.
    pub fn iterator_next(&mut self, iter: Value) -> VmResult<Value> {
        let Some(r) = iter
            .as_obj()
            .filter(|r| self.heap.kind(*r) == ObjKind::Internal)
        else {
            return Err(self.type_error("ITER_NEXT on a non-iterator"));
        };
        let (target, index) = match &self.heap.internal(r).data {
            InternalData::Iterator(st) => (st.target, st.index),
            _ => return Err(self.type_error("ITER_NEXT on a non-iterator")),
        };
        let ary = target.as_obj().expect("iterator target is an array");
        let next = self.heap.array(ary).get(index);
        match next {
            Some(v) => {
                if let InternalData::Iterator(st) = &mut self.heap.internal_mut(r).data {
                    st.index += 1;
                }
                Ok(v)
            }
            None => Ok(Value::Undef),
        }
    }

    // ---- map helpers ----
    // LoxTable key hashing routes through the heap, so the table is
    // taken out of its slot for the duration of a mutation.

    pub fn map_set(&mut self, map: ObjRef, key: Value, value: Value) {
        let mut table = std::mem::take(&mut self.heap.map_mut(map).table);
        table.set(&self.heap, key, value);
        self.heap.map_mut(map).table = table;
        self.heap.obj_write(map, key);
        self.heap.obj_write(map, value);
    }

    pub fn map_get(&self, map: ObjRef, key: &Value) -> Option<Value> {
        self.heap.map(map).table.get(&self.heap, key)
    }

    pub fn map_delete(&mut self, map: ObjRef, key: &Value) -> Option<Value> {
        let mut table = std::mem::take(&mut self.heap.map_mut(map).table);
        let removed = table.delete(&self.heap, key);
        self.heap.map_mut(map).table = table;
        removed
    }

    // ---- suspension ----

    /// Completes a suspended native call after the runner performed the
    /// blocking wait: drops the native frame and arguments, pushes the
    /// wait's result.
    pub fn complete_suspend(&mut self, result: Value) {
        let frame = self
            .ec_mut()
            .frames
            .pop()
            .expect("suspended native frame present");
        debug_assert!(frame.is_native);
        self.ec_mut().stack.truncate(frame.base);
        self.push(result);
    }

    // ---- garbage collection ----

    /// Runs a collection cycle and schedules finalizers.
    pub fn collect_garbage(&mut self, major: bool) {
        if !self.heap.gc_enabled {
            return;
        }
        let roots = self.gather_roots();
        let outcome = self.heap.collect(&roots, major);
        self.pending_finalizers.extend(outcome.finalizable);
    }

    /// Enumerates every root the collector must start from.
    fn gather_roots(&self) -> Vec<ObjRef> {
        let mut roots: Vec<ObjRef> = Vec::with_capacity(256);
        let mut push_value = |roots: &mut Vec<ObjRef>, v: &Value| {
            if let Value::Obj(r) = v {
                roots.push(*r);
            }
        };

        for thread in &self.threads {
            for ec in &thread.ecs {
                for v in &ec.stack {
                    push_value(&mut roots, v);
                }
                for frame in &ec.frames {
                    roots.extend(frame.closure);
                    roots.extend(frame.cref);
                    roots.extend(frame.name);
                    roots.extend(frame.file);
                    if let Some(this) = &frame.this {
                        push_value(&mut roots, this);
                    }
                    if let Some(block) = &frame.block {
                        push_value(&mut roots, block);
                    }
                    for (_, pending) in &frame.active_catches {
                        if let Some(Unwind::Throw(v) | Unwind::ContinueBlock(v) | Unwind::ReturnBlock(v)) = pending {
                            push_value(&mut roots, v);
                        }
                    }
                }
            }
            roots.extend(thread.open_upvalues.iter().copied());
            roots.extend(thread.stack_objects.iter().copied());
            roots.extend(thread.instance);
            push_value(&mut roots, &thread.last_error);
            push_value(&mut roots, &thread.result);
            if let Some(v) = &thread.pending_raise {
                push_value(&mut roots, v);
            }
            for entry in &thread.blocks {
                match &entry.acc {
                    crate::thread::BlockAccum::Map(vs)
                    | crate::thread::BlockAccum::Select(vs)
                    | crate::thread::BlockAccum::Reject(vs) => {
                        for v in vs {
                            push_value(&mut roots, v);
                        }
                    }
                    crate::thread::BlockAccum::Find(Some(v))
                    | crate::thread::BlockAccum::Reduce(v) => push_value(&mut roots, v),
                    _ => {}
                }
            }
        }

        for (k, v) in &self.globals {
            roots.push(*k);
            push_value(&mut roots, v);
        }
        for (k, v) in &self.constants {
            roots.push(*k);
            push_value(&mut roots, v);
        }
        roots.extend(self.interned.values().copied());
        roots.extend(self.loaded_scripts.iter().copied());
        for v in self.traps.values() {
            push_value(&mut roots, v);
        }
        for v in &self.at_exit {
            push_value(&mut roots, v);
        }
        for (obj, fin) in &self.pending_finalizers {
            roots.push(*obj);
            roots.push(*fin);
        }

        let core = &self.core;
        for r in [
            core.object, core.module, core.class, core.string, core.array, core.map,
            core.iterator, core.error, core.arg_error, core.type_error, core.name_error,
            core.syntax_error, core.system_error, core.load_error, core.regex_error,
            core.recursion_error, core.break_block_error, core.continue_block_error,
            core.return_block_error, core.thread, core.mutex, core.block, core.gc_module,
            core.signal_module,
        ] {
            roots.extend(r);
        }
        roots
    }

    // ---- registration API for built-ins ----

    /// Defines a global function.
    pub fn add_global_function(&mut self, name: &str, function: NativeFn) -> ObjRef {
        let native = self.new_native(name, function, None);
        let key = self.intern(name);
        self.globals.insert(key, Value::Obj(native));
        native
    }

    /// Defines (or reopens) a global class.
    pub fn add_global_class(&mut self, name: &str, superclass: Option<ObjRef>) -> ObjRef {
        let key = self.intern(name);
        if let Some(existing) = self.constants.get(&key).and_then(|v| v.as_obj()) {
            return existing;
        }
        let klass = self.new_class(Some(key), superclass, false);
        self.heap.promote_now(klass);
        self.constants.insert(key, Value::Obj(klass));
        self.globals.insert(key, Value::Obj(klass));
        klass
    }

    /// Defines a global module.
    pub fn add_global_module(&mut self, name: &str) -> ObjRef {
        let key = self.intern(name);
        if let Some(existing) = self.constants.get(&key).and_then(|v| v.as_obj()) {
            return existing;
        }
        let module = self.new_class(Some(key), None, true);
        self.heap.promote_now(module);
        self.constants.insert(key, Value::Obj(module));
        self.globals.insert(key, Value::Obj(module));
        module
    }

    /// Registers a native instance method on a class or module.
    pub fn add_native_method(&mut self, klass: ObjRef, name: &str, function: NativeFn) -> ObjRef {
        let native = self.new_native(name, function, Some(klass));
        let key = self.intern(name);
        self.heap
            .class_mut(klass)
            .info
            .methods
            .insert(key, Value::Obj(native));
        self.heap.obj_write(klass, Value::Obj(native));
        native
    }

    /// Registers a native static method (on the singleton class).
    pub fn add_native_static_method(
        &mut self,
        klass: ObjRef,
        name: &str,
        function: NativeFn,
    ) -> ObjRef {
        let singleton = self
            .singleton_class_of(klass)
            .expect("singleton creation cannot fail during bootstrap");
        let native = self.add_native_method(singleton, name, function);
        match &mut self.heap.get_mut(native).body {
            ObjBody::Native(n) => n.is_static = true,
            _ => unreachable!(),
        }
        native
    }

    /// Registers a native property getter.
    pub fn add_native_getter(&mut self, klass: ObjRef, name: &str, function: NativeFn) -> ObjRef {
        let native = self.new_native(name, function, Some(klass));
        let key = self.intern(name);
        self.heap
            .class_mut(klass)
            .info
            .getters
            .insert(key, Value::Obj(native));
        self.heap.obj_write(klass, Value::Obj(native));
        native
    }

    /// Defines a constant under a class/module.
    pub fn add_constant_under(&mut self, owner: ObjRef, name: &str, value: Value) {
        let key = self.intern(name);
        self.heap.class_mut(owner).info.constants.insert(key, value);
        self.heap.obj_write(owner, value);
    }

    /// Convenience for tests and the CLI: a fresh builder.
    pub fn builder(&mut self) -> ChunkBuilder {
        ChunkBuilder::new()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

enum Handled {
    Continue,
    Propagate(Unwind),
}

/// Prints integral doubles without a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Iteration-helper plumbing shared with natives: push a block entry.
impl Vm {
    pub fn push_block_entry(&mut self, acc: crate::thread::BlockAccum) {
        let home_frame = self.frame_count().saturating_sub(2);
        self.thread_mut().blocks.push(BlockEntry {
            home_frame,
            acc,
            iter_stop: false,
        });
    }

    pub fn pop_block_entry(&mut self) -> Option<BlockEntry> {
        self.thread_mut().blocks.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_code::OpCode;

    #[test]
    fn test_interpret_arithmetic() {
        let mut vm = Vm::new();
        let mut b = ChunkBuilder::new();
        b.number(3.0).unwrap();
        b.number(4.0).unwrap();
        b.op(OpCode::Add);
        b.op(OpCode::Return);
        let result = vm.interpret_chunk(b.finish()).unwrap();
        assert_eq!(result, Value::Number(7.0));
    }

    #[test]
    fn test_stack_balance_after_statement() {
        let mut vm = Vm::new();
        vm.capture_output();
        let mut b = ChunkBuilder::new();
        b.number(1.0).unwrap();
        b.op(OpCode::Print);
        b.op(OpCode::Nil).op(OpCode::Return);
        vm.interpret_chunk(b.finish()).unwrap();
        // The whole context unwound cleanly.
        assert_eq!(vm.stack_len(), 0);
        assert_eq!(vm.frame_count(), 0);
    }

    #[test]
    fn test_undefined_global_raises_name_error() {
        let mut vm = Vm::new();
        vm.capture_output();
        let mut b = ChunkBuilder::new();
        b.named(&mut vm, OpCode::GetGlobal, "nope").unwrap();
        b.op(OpCode::Return);
        let err = vm.interpret_chunk(b.finish()).unwrap_err();
        let Unwind::Throw(v) = err else {
            panic!("expected guest throw, got {err:?}")
        };
        assert!(vm.is_a(&v, vm.core.name_error.unwrap()));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(1.5), "1.5");
    }

    // A native that re-enters the interpreter; the nested pass runs in
    // its own execution context.
    fn nested_eval(vm: &mut Vm, args: &[Value]) -> crate::error::VmResult<Value> {
        vm.check_arity("nestedEval", 0, 0, args.len())?;
        assert_eq!(vm.thread().ecs.len(), 1);
        let mut b = ChunkBuilder::new();
        b.number(5.0).unwrap();
        b.number(6.0).unwrap();
        b.op(OpCode::Multiply);
        b.op(OpCode::Return);
        let result = vm.interpret_chunk(b.finish())?;
        assert_eq!(vm.thread().ecs.len(), 1);
        Ok(result)
    }

    #[test]
    fn test_reentrant_interpret_uses_fresh_context() {
        let mut vm = Vm::new();
        vm.add_global_function("nestedEval", nested_eval);

        let mut b = ChunkBuilder::new();
        b.named(&mut vm, OpCode::GetGlobal, "nestedEval").unwrap();
        b.call(&mut vm, 0).unwrap();
        b.op(OpCode::Return);
        let result = vm.interpret_chunk(b.finish()).unwrap();
        assert_eq!(result, Value::Number(30.0));
    }

    // A native capturing its caller's locals into a Scope object.
    fn capture_caller_scope(vm: &mut Vm, args: &[Value]) -> crate::error::VmResult<Value> {
        vm.check_arity("captureScope", 0, 0, args.len())?;
        let scope = vm.capture_scope();
        Ok(Value::Obj(scope))
    }

    #[test]
    fn test_scope_capture_snapshots_locals() {
        let mut vm = Vm::new();
        vm.add_global_function("captureScope", capture_caller_scope);

        let mut b = ChunkBuilder::new();
        b.named(&mut vm, OpCode::GetGlobal, "captureScope").unwrap();
        b.call(&mut vm, 0).unwrap();
        b.op(OpCode::Return);
        let result = vm.interpret_chunk(b.finish()).unwrap();

        let scope = result.as_obj().expect("scope object");
        assert_eq!(vm.heap.kind(scope), crate::object::ObjKind::Scope);
        // Slot 0 of the captured frame is the frame's own callable.
        assert!(!vm.heap.scope(scope).locals.is_empty());
        // Stack-rooted scopes survive collection through tracing.
        vm.push(result);
        vm.collect_garbage(true);
        assert!(!vm.heap.scope(scope).locals.is_empty());
        vm.pop().unwrap();
    }
}
