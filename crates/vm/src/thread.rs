//! Per-thread interpreter state: value stack, call frames, open
//! upvalues, block stack, pins, and interrupt flags.

use crate::error::Unwind;
use crate::object::ObjRef;
use crate::value::Value;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Scheduling status of a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ready,
    Running,
    /// Blocked in a native call with the GVL released.
    Stopped,
    Zombie,
}

/// One activation record.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Executing closure; None for native frames.
    pub closure: Option<ObjRef>,
    /// Next byte to execute in the closure's chunk.
    pub ip: usize,
    /// Stack index of slot 0 (the callee or receiver).
    pub base: usize,
    /// Receiver, when this is a method call.
    pub this: Option<Value>,
    /// Enclosing class/module for constant lookup, from the function's
    /// definition site.
    pub cref: Option<ObjRef>,
    /// Class bodies entered within this frame (IN/POP_CREF).
    pub cref_stack: Vec<ObjRef>,
    /// Frame name, for traces.
    pub name: Option<ObjRef>,
    /// Source file, when known.
    pub file: Option<ObjRef>,
    pub is_native: bool,
    /// Block argument attached to this call, if any.
    pub block: Option<Value>,
    /// Catch-table rows entered by unwinding, innermost last. Holds the
    /// row index paired with the value to re-raise for ensure entries.
    pub active_catches: Vec<(usize, Option<Unwind>)>,
}

impl CallFrame {
    pub fn native(base: usize, name: Option<ObjRef>, block: Option<Value>) -> Self {
        Self {
            closure: None,
            ip: 0,
            base,
            this: None,
            cref: None,
            cref_stack: Vec::new(),
            name,
            file: None,
            is_native: true,
            block,
            active_catches: Vec::new(),
        }
    }
}

/// A value stack plus its frame stack. Threads hold a list of these;
/// each nested VM re-entry pushes a fresh one.
#[derive(Debug, Default)]
pub struct ExecContext {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
}

/// Iterator-helper accumulator attached to a block-stack entry.
#[derive(Debug)]
pub enum BlockAccum {
    None,
    Map(Vec<Value>),
    Select(Vec<Value>),
    Reject(Vec<Value>),
    Find(Option<Value>),
    Reduce(Value),
}

/// One active iteration: where its home frame sits and what the native
/// helper is accumulating.
#[derive(Debug)]
pub struct BlockEntry {
    /// Frame index of the caller that supplied the block.
    pub home_frame: usize,
    pub acc: BlockAccum,
    /// Set by accumulators that finish early (`find`).
    pub iter_stop: bool,
}

/// Flags another thread (or a signal producer) may set while this
/// thread runs. Shared outside the GVL.
#[derive(Debug, Default)]
pub struct InterruptState {
    pub interrupt: AtomicBool,
    pub trap_pending: AtomicBool,
    /// Set when the thread must die with this exit code.
    pub exit_code: AtomicI32,
    pub exit_requested: AtomicBool,
}

impl InterruptState {
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }

    pub fn request_exit(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.exit_requested.store(true, Ordering::SeqCst);
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

/// All interpreter state owned by one guest thread.
pub struct LxThread {
    /// Execution contexts; the last one is current.
    pub ecs: Vec<ExecContext>,
    /// Open upvalues into this thread's stack, sorted by slot.
    pub open_upvalues: Vec<ObjRef>,
    /// Objects pinned while native calls run.
    pub stack_objects: Vec<ObjRef>,
    /// Active iteration entries.
    pub blocks: Vec<BlockEntry>,
    pub status: ThreadStatus,
    pub interrupts: Arc<InterruptState>,
    /// Depth of native (Rust) calls currently on the C stack.
    pub in_native: u32,
    /// Nested interpreter re-entries (natives calling back into the VM).
    pub run_level: u32,
    /// Opcode of the last dispatched instruction, for traces.
    pub last_opcode: Option<crate::op_code::OpCode>,
    /// The guest Thread instance backing this thread, once created.
    pub instance: Option<ObjRef>,
    /// Last uncaught throwable seen on this thread.
    pub last_error: Value,
    /// Throwable injected from outside (an errored join target, a
    /// signal); raised at the next safepoint.
    pub pending_raise: Option<Value>,
    /// Value the thread's top-level callable returned.
    pub result: Value,
    pub errored: bool,
    /// OS join handle, present for spawned threads until joined.
    pub join_handle: Option<std::thread::JoinHandle<()>>,
}

impl LxThread {
    pub fn new() -> Self {
        Self {
            ecs: vec![ExecContext::default()],
            open_upvalues: Vec::new(),
            stack_objects: Vec::new(),
            blocks: Vec::new(),
            status: ThreadStatus::Ready,
            interrupts: Arc::new(InterruptState::default()),
            in_native: 0,
            run_level: 0,
            last_opcode: None,
            instance: None,
            last_error: Value::Nil,
            pending_raise: None,
            result: Value::Nil,
            errored: false,
            join_handle: None,
        }
    }

    pub fn ec(&self) -> &ExecContext {
        self.ecs.last().expect("thread always has a context")
    }

    pub fn ec_mut(&mut self) -> &mut ExecContext {
        self.ecs.last_mut().expect("thread always has a context")
    }
}

impl Default for LxThread {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flags() {
        let state = InterruptState::default();
        assert!(!state.take_interrupt());
        state.request_interrupt();
        assert!(state.take_interrupt());
        assert!(!state.take_interrupt());

        state.request_exit(3);
        assert!(state.exit_requested.load(Ordering::SeqCst));
        assert_eq!(state.exit_code.load(Ordering::SeqCst), 3);
        assert!(state.take_interrupt());
    }
}
