//! Guest threads, the GVL, and signal delivery.

use lox_vm::builder::ChunkBuilder;
use lox_vm::chunk::Chunk;
use lox_vm::object::{FunctionKind, FunctionObj, ObjRef};
use lox_vm::op_code::OpCode;
use lox_vm::value::Value;
use lox_vm::vm::Vm;
use lox_vm::{RunOutcome, Runtime};

fn make_function(vm: &mut Vm, name: &str, arity: u16, chunk: Chunk) -> ObjRef {
    let mut function = FunctionObj::new(chunk, FunctionKind::Named);
    function.name = Some(vm.intern(name));
    function.arity = arity;
    vm.alloc_function(function)
}

/// Two threads each increment a shared counter 100 000 times under a
/// guest Mutex; the final value is exact.
#[test]
fn two_threads_increment_under_a_mutex() {
    let runtime = Runtime::new();
    let chunk = runtime.with_vm(|vm| {
        vm.capture_output();

        // Thread body: 100000 locked increments of the counter global.
        let mut b = ChunkBuilder::new();
        b.number(0.0).unwrap(); // i in slot 1
        let loop_top = b.here();
        b.local(vm, OpCode::GetLocal, 1, "i").unwrap();
        b.number(100000.0).unwrap();
        b.op(OpCode::Less);
        let done = b.jump(OpCode::JumpIfFalse);

        b.named(vm, OpCode::GetGlobal, "m").unwrap();
        b.invoke(vm, "lock", 0).unwrap();
        b.op(OpCode::Pop);

        b.named(vm, OpCode::GetGlobal, "counter").unwrap();
        b.number(1.0).unwrap();
        b.op(OpCode::Add);
        b.named(vm, OpCode::SetGlobal, "counter").unwrap();
        b.op(OpCode::Pop);

        b.named(vm, OpCode::GetGlobal, "m").unwrap();
        b.invoke(vm, "unlock", 0).unwrap();
        b.op(OpCode::Pop);

        b.local(vm, OpCode::GetLocal, 1, "i").unwrap();
        b.number(1.0).unwrap();
        b.op(OpCode::Add);
        b.local(vm, OpCode::SetLocal, 1, "i").unwrap();
        b.op(OpCode::Pop);
        b.loop_to(loop_top).unwrap();

        b.patch_jump(done).unwrap();
        b.op(OpCode::Nil).op(OpCode::Return);
        let body = make_function(vm, "(worker)", 0, b.finish());

        // main: m = Mutex(); counter = 0; spawn two workers; join.
        let mut b = ChunkBuilder::new();
        b.named(vm, OpCode::GetGlobal, "Mutex").unwrap();
        b.call(vm, 0).unwrap();
        b.named(vm, OpCode::DefineGlobal, "m").unwrap();
        b.number(0.0).unwrap();
        b.named(vm, OpCode::DefineGlobal, "counter").unwrap();

        for t in ["t1", "t2"] {
            b.named(vm, OpCode::GetGlobal, "newThread").unwrap();
            let idx = b.constant(Value::Obj(body)).unwrap();
            b.op_byte(OpCode::Closure, idx);
            b.call(vm, 1).unwrap();
            b.named(vm, OpCode::DefineGlobal, t).unwrap();
        }
        for t in ["t1", "t2"] {
            b.named(vm, OpCode::GetGlobal, "joinThread").unwrap();
            b.named(vm, OpCode::GetGlobal, t).unwrap();
            b.call(vm, 1).unwrap();
            b.op(OpCode::Pop);
        }
        b.named(vm, OpCode::GetGlobal, "counter").unwrap();
        b.op(OpCode::Print);
        b.op(OpCode::Nil).op(OpCode::Return);
        b.finish()
    });

    let outcome = runtime.interpret(chunk);
    assert!(matches!(outcome, RunOutcome::Value(_)), "got {outcome:?}");
    let out = runtime.with_vm(|vm| vm.take_output());
    assert_eq!(out, "200000\n");
}

/// sleep releases the GVL and the thread resumes afterwards.
#[test]
fn sleep_suspends_and_resumes() {
    let runtime = Runtime::new();
    let chunk = runtime.with_vm(|vm| {
        vm.capture_output();
        let mut b = ChunkBuilder::new();
        b.named(vm, OpCode::GetGlobal, "sleep").unwrap();
        b.number(0.01).unwrap();
        b.call(vm, 1).unwrap();
        b.op(OpCode::Pop);
        b.string(vm, "awake", true).unwrap();
        b.op(OpCode::Print);
        b.op(OpCode::Nil).op(OpCode::Return);
        b.finish()
    });
    let outcome = runtime.interpret(chunk);
    assert!(matches!(outcome, RunOutcome::Value(_)), "got {outcome:?}");
    assert_eq!(runtime.with_vm(|vm| vm.take_output()), "awake\n");
}

/// A spawned thread's result comes back through join.
#[test]
fn join_returns_the_thread_value() {
    let runtime = Runtime::new();
    let chunk = runtime.with_vm(|vm| {
        vm.capture_output();
        let mut b = ChunkBuilder::new();
        b.number(21.0).unwrap();
        b.number(2.0).unwrap();
        b.op(OpCode::Multiply);
        b.op(OpCode::Return);
        let body = make_function(vm, "(worker)", 0, b.finish());

        let mut b = ChunkBuilder::new();
        b.named(vm, OpCode::GetGlobal, "newThread").unwrap();
        let idx = b.constant(Value::Obj(body)).unwrap();
        b.op_byte(OpCode::Closure, idx);
        b.call(vm, 1).unwrap();
        b.invoke(vm, "join", 0).unwrap();
        b.op(OpCode::Print);
        b.op(OpCode::Nil).op(OpCode::Return);
        b.finish()
    });
    let outcome = runtime.interpret(chunk);
    assert!(matches!(outcome, RunOutcome::Value(_)), "got {outcome:?}");
    assert_eq!(runtime.with_vm(|vm| vm.take_output()), "42\n");
}

/// A registered trap handler runs when its signal is drained at a
/// main-thread safepoint.
#[test]
fn trap_handler_runs_on_delivery() {
    let runtime = Runtime::new();

    // First run registers the trap.
    let chunk = runtime.with_vm(|vm| {
        vm.capture_output();
        let mut b = ChunkBuilder::new();
        b.string(vm, "sig", true).unwrap();
        b.op(OpCode::Print);
        b.op(OpCode::Nil).op(OpCode::Return);
        let handler = make_function(vm, "(trap)", 1, b.finish());

        let mut b = ChunkBuilder::new();
        b.named(vm, OpCode::GetGlobal, "Signal").unwrap();
        b.number(10.0).unwrap();
        let idx = b.constant(Value::Obj(handler)).unwrap();
        b.op_byte(OpCode::Closure, idx);
        b.invoke(vm, "trap", 2).unwrap();
        b.op(OpCode::Pop);
        b.op(OpCode::Nil).op(OpCode::Return);
        b.finish()
    });
    assert!(matches!(runtime.interpret(chunk), RunOutcome::Value(_)));

    // Deliver, then run again: the pending signal drains before the
    // next slice and invokes the handler.
    runtime.deliver_signal(10);
    let chunk = runtime.with_vm(|_vm| {
        let mut b = ChunkBuilder::new();
        b.op(OpCode::Nil).op(OpCode::Return);
        b.finish()
    });
    assert!(matches!(runtime.interpret(chunk), RunOutcome::Value(_)));

    let out = runtime.with_vm(|vm| vm.take_output());
    assert_eq!(out, "sig\n");
}

/// Explicit exit surfaces its status code.
#[test]
fn exit_code_propagates() {
    let runtime = Runtime::new();
    let chunk = runtime.with_vm(|vm| {
        vm.capture_output();
        let mut b = ChunkBuilder::new();
        b.named(vm, OpCode::GetGlobal, "exit").unwrap();
        b.number(3.0).unwrap();
        b.call(vm, 1).unwrap();
        b.op(OpCode::Nil).op(OpCode::Return);
        b.finish()
    });
    let outcome = runtime.interpret(chunk);
    assert!(matches!(outcome, RunOutcome::Exit(3)), "got {outcome:?}");
    assert_eq!(outcome.exit_code(), 3);
}

/// An uncaught error from the main thread reports exit code 70.
#[test]
fn uncaught_error_exit_code() {
    let runtime = Runtime::new();
    let chunk = runtime.with_vm(|vm| {
        vm.capture_output();
        let mut b = ChunkBuilder::new();
        b.string(vm, "kaboom", false).unwrap();
        b.op(OpCode::Throw);
        b.op(OpCode::Nil).op(OpCode::Return);
        b.finish()
    });
    let outcome = runtime.interpret(chunk);
    assert!(matches!(outcome, RunOutcome::Uncaught(_)), "got {outcome:?}");
    assert_eq!(outcome.exit_code(), 70);
}
