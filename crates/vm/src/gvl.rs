//! The Global VM Lock and the OS-thread runners that drive guest
//! threads through it.
//!
//! One `parking_lot::Mutex<Vm>` serializes all interpreter state: at
//! any moment at most one OS thread executes bytecode. Scheduling is
//! cooperative. A runner executes a bounded slice of instructions, then
//! hands the lock off if anyone is waiting; a native that must block
//! (sleep, join, a contended guest mutex) surfaces a [`SuspendOp`] so
//! the runner performs the wait with the lock released and completes
//! the call afterwards. Every release is paired with a re-acquire on
//! all paths, unwinds included, because the guard itself enforces it.

use crate::chunk::Chunk;
use crate::error::{SuspendOp, VmError};
use crate::object::{InternalData, ObjRef};
use crate::signal::SignalRing;
use crate::thread::ThreadStatus;
use crate::value::Value;
use crate::vm::{SliceOutcome, Vm};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Instructions per slice between handoff checks.
const SLICE_BUDGET: u32 = 4096;

/// The shared VM: the GVL plus the lock-free signal queue.
pub struct VmShared {
    gvl: Mutex<Vm>,
    waiters: AtomicUsize,
    pub signals: SignalRing,
}

impl VmShared {
    /// Acquires the GVL, counting this thread as a waiter while it
    /// parks.
    fn acquire(&self) -> MutexGuard<'_, Vm> {
        if let Some(guard) = self.gvl.try_lock() {
            return guard;
        }
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let guard = self.gvl.lock();
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    fn contended(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }
}

/// How a program run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Clean completion with the program's value.
    Value(Value),
    /// Explicit exit.
    Exit(i32),
    /// Uncaught guest exception; the trace was already printed.
    Uncaught(String),
    /// Host fault.
    Fault(VmError),
}

impl RunOutcome {
    /// Process exit code per the runtime contract: 0 on clean
    /// shutdown, the explicit code on exit, 70 on an uncaught error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Value(_) => 0,
            RunOutcome::Exit(code) => *code,
            RunOutcome::Uncaught(_) => 70,
            RunOutcome::Fault(_) => 70,
        }
    }
}

/// The embedding entry point: a VM behind its GVL.
pub struct Runtime {
    shared: Arc<VmShared>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        let shared = Arc::new(VmShared {
            gvl: Mutex::new(Vm::new()),
            waiters: AtomicUsize::new(0),
            signals: SignalRing::new(),
        });
        shared.gvl.lock().shared = Some(Arc::downgrade(&shared));
        Self { shared }
    }

    /// Runs a closure with the GVL held.
    pub fn with_vm<R>(&self, f: impl FnOnce(&mut Vm) -> R) -> R {
        let mut guard = self.shared.acquire();
        f(&mut guard)
    }

    /// Enqueues a signal for the main thread; it is drained at the
    /// next safepoint.
    pub fn deliver_signal(&self, signo: i32) {
        self.shared.signals.enqueue(signo);
        self.with_vm(|vm| {
            let interrupts = &vm.threads[0].interrupts;
            interrupts.trap_pending.store(true, Ordering::SeqCst);
            interrupts.request_interrupt();
        });
    }

    /// Runs a chunk as the main thread until completion, driving GVL
    /// handoff and blocking operations.
    pub fn interpret(&self, chunk: Chunk) -> RunOutcome {
        {
            let mut vm = self.shared.acquire();
            vm.cur = 0;
            let mut function =
                crate::object::FunctionObj::new(chunk, crate::object::FunctionKind::TopLevel);
            function.name = Some(vm.intern("main"));
            let function = vm.alloc_function(function);
            let closure = vm.new_closure(function, Vec::new());
            vm.push(Value::Obj(closure));
            if let Err(unwind) = vm.call_value(0, None, None) {
                return RunOutcome::Fault(crate::error::VmError::invalid_operation_msg(
                    format!("failed to start main: {unwind:?}"),
                ));
            }
        }
        let outcome = run_thread_loop(&self.shared, 0);
        self.run_at_exit_handlers();
        outcome
    }

    fn run_at_exit_handlers(&self) {
        let mut vm = self.shared.acquire();
        vm.cur = 0;
        let handlers = std::mem::take(&mut vm.at_exit);
        for handler in handlers.into_iter().rev() {
            if let Err(unwind) = vm.call_function_sync(handler, &[], None) {
                log::debug!("atExit handler raised: {unwind:?}");
            }
        }
    }
}

/// Spawns the OS thread backing guest thread `slot`. The child
/// acquires the GVL, installs itself as current, and invokes the
/// closure rooted on its stack.
pub fn spawn_thread(shared: Arc<VmShared>, slot: usize) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        {
            let mut vm = shared.acquire();
            vm.cur = slot;
            vm.threads[slot].status = ThreadStatus::Running;
            // The entry closure was rooted on this thread's stack at
            // spawn time.
            if let Err(unwind) = vm.call_value(0, None, None) {
                log::debug!("thread {slot} failed to start: {unwind:?}");
                vm.threads[slot].status = ThreadStatus::Zombie;
                return;
            }
        }
        let outcome = run_thread_loop(&shared, slot);
        let mut vm = shared.acquire();
        vm.cur = slot;
        if let RunOutcome::Uncaught(_) = outcome {
            vm.threads[slot].errored = true;
        }
        vm.threads[slot].status = ThreadStatus::Zombie;
        log::debug!("guest thread {slot} finished: {outcome:?}");
    })
}

/// Drives one guest thread to completion: slices under the GVL,
/// cooperative handoff, suspension for blocking waits, and signal
/// delivery on the main thread.
fn run_thread_loop(shared: &Arc<VmShared>, slot: usize) -> RunOutcome {
    let mut vm = shared.acquire();
    loop {
        vm.cur = slot;
        vm.threads[slot].status = ThreadStatus::Running;

        // Signals always drain on the main thread; the trap flag is
        // the cheap "something is queued" gate.
        if slot == 0
            && vm.threads[0]
                .interrupts
                .trap_pending
                .swap(false, Ordering::SeqCst)
        {
            while let Some(signo) = shared.signals.drain_one() {
                if let Err(unwind) = vm.deliver_pending_signal(signo) {
                    return match unwind {
                        crate::error::Unwind::Throw(v) => {
                            RunOutcome::Uncaught(vm.display_value(&v))
                        }
                        crate::error::Unwind::Exit(code) => RunOutcome::Exit(code),
                        other => RunOutcome::Fault(VmError::invalid_operation_msg(format!(
                            "signal delivery failed: {other:?}"
                        ))),
                    };
                }
            }
        }

        match vm.run_slice(SLICE_BUDGET) {
            SliceOutcome::Yielded => {
                if shared.contended() {
                    // Handoff: let a waiter take the lock.
                    drop(vm);
                    std::thread::yield_now();
                    vm = shared.acquire();
                }
            }
            SliceOutcome::Suspended(op) => {
                vm.threads[slot].status = ThreadStatus::Stopped;
                let joined = match &op {
                    SuspendOp::Join(target) => Some(*target),
                    _ => None,
                };
                match perform_suspend(shared, vm, slot, op) {
                    Ok((guard, value)) => {
                        vm = guard;
                        vm.cur = slot;
                        vm.complete_suspend(value);
                        // An errored thread re-raises on whoever joins
                        // it.
                        if let Some(target) = joined {
                            if vm.threads[target].errored {
                                let error = vm.threads[target].last_error;
                                vm.threads[slot].pending_raise = Some(error);
                            }
                        }
                    }
                    Err(outcome) => return outcome,
                }
            }
            SliceOutcome::Done(value) => {
                vm.threads[slot].status = ThreadStatus::Zombie;
                return RunOutcome::Value(value);
            }
            SliceOutcome::Exited(code) => return RunOutcome::Exit(code),
            SliceOutcome::Errored(v) => {
                let rendered = vm.display_value(&v);
                return RunOutcome::Uncaught(rendered);
            }
            SliceOutcome::Faulted(e) => return RunOutcome::Fault(e),
        }
    }
}

/// Performs a blocking operation with the GVL released: consumes the
/// guard, waits, and hands back a freshly acquired guard, so release
/// and re-acquire stay paired on every path by construction.
fn perform_suspend<'a>(
    shared: &'a Arc<VmShared>,
    mut vm: MutexGuard<'a, Vm>,
    slot: usize,
    op: SuspendOp,
) -> Result<(MutexGuard<'a, Vm>, Value), RunOutcome> {
    match op {
        SuspendOp::Sleep(millis) => {
            drop(vm);
            std::thread::sleep(std::time::Duration::from_millis(millis));
            Ok((shared.acquire(), Value::Nil))
        }
        SuspendOp::Join(target) => {
            let handle = vm.threads[target].join_handle.take();
            match handle {
                Some(handle) => {
                    drop(vm);
                    let _ = handle.join();
                    let vm = shared.acquire();
                    let result = vm.threads[target].result;
                    Ok((vm, result))
                }
                None => {
                    let result = vm.threads[target].result;
                    Ok((vm, result))
                }
            }
        }
        SuspendOp::LockMutex(internal) => {
            let inner = match &vm.heap.internal(internal).data {
                InternalData::Mutex(st) => st.inner.clone(),
                _ => {
                    return Err(RunOutcome::Fault(VmError::invalid_operation_msg(
                        "suspended on a non-mutex",
                    )))
                }
            };
            drop(vm);
            {
                let (lock, condvar) = &*inner;
                let mut locked = lock.lock().expect("mutex state poisoned");
                while *locked {
                    locked = condvar.wait(locked).expect("mutex state poisoned");
                }
                *locked = true;
            }
            let mut vm = shared.acquire();
            mark_mutex_owner(&mut vm, internal, slot);
            Ok((vm, Value::Nil))
        }
    }
}

fn mark_mutex_owner(vm: &mut Vm, internal: ObjRef, slot: usize) {
    if let InternalData::Mutex(st) = &mut vm.heap.internal_mut(internal).data {
        st.owner = Some(slot);
    }
}
