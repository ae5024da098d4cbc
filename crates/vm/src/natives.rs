//! Built-in native methods and global functions.
//!
//! Natives receive `(vm, args)` where `args[0]` is the receiver for
//! method natives, and raise through the unwind mechanism. Only the
//! VM-facing obligations of the class library live here; the full
//! built-in library is a separate collaborator.

use crate::blocks::{self, YieldOutcome};
use crate::error::{SuspendOp, Unwind, VmResult};
use crate::object::{InternalData, MutexState, ObjFlags, ObjKind, ObjRef, ThreadRef};
use crate::thread::BlockAccum;
use crate::value::Value;
use crate::vm::Vm;

/// Registers every built-in on a freshly bootstrapped VM.
pub fn register_all(vm: &mut Vm) {
    register_globals(vm);
    register_object(vm);
    register_class(vm);
    register_error(vm);
    register_string(vm);
    register_array(vm);
    register_map(vm);
    register_gc(vm);
    register_thread(vm);
    register_mutex(vm);
    register_block(vm);
    register_signal(vm);
    register_env(vm);
}

fn register_globals(vm: &mut Vm) {
    vm.add_global_function("clock", native_clock);
    vm.add_global_function("typeof", native_typeof);
    vm.add_global_function("classof", native_classof);
    vm.add_global_function("exit", native_exit);
    vm.add_global_function("atExit", native_at_exit);
    vm.add_global_function("sleep", native_sleep);
    vm.add_global_function("newThread", native_new_thread);
    vm.add_global_function("joinThread", native_join_thread);
    vm.add_global_function("yield", native_yield);
    vm.add_global_function("blockGiven", native_block_given);
}

fn native_clock(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("clock", 0, 0, args.len())?;
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(secs))
}

fn native_typeof(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("typeof", 1, 1, args.len())?;
    let name = match &args[0] {
        Value::Nil => "nil".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::Undef => "undef".to_string(),
        Value::Obj(r) => match vm.heap.kind(*r) {
            ObjKind::String => "string".to_string(),
            ObjKind::Array => "array".to_string(),
            ObjKind::Map => "map".to_string(),
            ObjKind::Class => "class".to_string(),
            ObjKind::Module => "module".to_string(),
            ObjKind::Closure | ObjKind::Function | ObjKind::Native | ObjKind::BoundMethod => {
                "function".to_string()
            }
            _ => "instance".to_string(),
        },
    };
    let s = vm.new_string(name.into_bytes());
    Ok(Value::Obj(s))
}

fn native_classof(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("classof", 1, 1, args.len())?;
    Ok(args[0]
        .as_obj()
        .and_then(|r| vm.heap.instance_core(r))
        .and_then(|c| c.klass)
        .map(Value::Obj)
        .unwrap_or(Value::Nil))
}

fn native_exit(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("exit", 0, 1, args.len())?;
    let code = args
        .first()
        .and_then(|v| v.as_number())
        .map(|n| n as i32)
        .unwrap_or(0);
    Err(Unwind::Exit(code))
}

fn native_at_exit(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("atExit", 1, 1, args.len())?;
    vm.at_exit.push(args[0]);
    Ok(Value::Nil)
}

fn native_sleep(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("sleep", 1, 1, args.len())?;
    let Some(secs) = args[0].as_number().filter(|s| *s >= 0.0) else {
        return Err(vm.type_error("sleep expects a non-negative number of seconds"));
    };
    let millis = (secs * 1000.0) as u64;
    if vm.thread().run_level == 0 && vm.shared.is_some() {
        // The runner performs the wait with the GVL released.
        Err(Unwind::Suspend(SuspendOp::Sleep(millis)))
    } else {
        // Inside a nested VM pass there is no clean suspension point;
        // the wait holds the lock.
        std::thread::sleep(std::time::Duration::from_millis(millis));
        Ok(Value::Nil)
    }
}

fn native_yield(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let Some(block) = blocks::current_block(vm) else {
        let klass = vm.core.error;
        return Err(vm.throw_error(klass, "no block given"));
    };
    match blocks::yield_to_block(vm, block, args)? {
        YieldOutcome::Value(v) => Ok(v),
        YieldOutcome::Break => Ok(Value::Nil),
        YieldOutcome::Return(v) => Err(Unwind::ReturnBlock(v)),
    }
}

fn native_block_given(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("blockGiven", 0, 0, args.len())?;
    Ok(Value::Bool(blocks::current_block(vm).is_some()))
}

// ---- Object ----

fn register_object(vm: &mut Vm) {
    let object = vm.core.object.expect("bootstrapped");
    vm.add_native_method(object, "freeze", object_freeze);
    vm.add_native_method(object, "unfreeze", object_unfreeze);
    vm.add_native_method(object, "isFrozen", object_is_frozen);
    vm.add_native_method(object, "dup", object_dup);
    vm.add_native_method(object, "hashKey", object_hash_key);
    vm.add_native_method(object, "opEquals", object_op_equals);
    vm.add_native_method(object, "isSame", object_is_same);
    vm.add_native_method(object, "send", object_send);
    vm.add_native_method(object, "objectId", object_object_id);
    vm.add_native_method(object, "class", object_class);
    vm.add_native_method(object, "singletonClass", object_singleton_class);
    vm.add_native_method(object, "extend", object_extend);
    vm.add_native_method(object, "isA", object_is_a);
    vm.add_native_method(object, "inspect", object_inspect);
}

fn receiver_ref(vm: &mut Vm, args: &[Value], what: &str) -> VmResult<ObjRef> {
    match args[0].as_obj() {
        Some(r) => Ok(r),
        None => {
            let tname = vm.type_name(&args[0]);
            Err(vm.type_error(&format!("{what} requires an object receiver, got {tname}")))
        }
    }
}

fn object_freeze(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#freeze", 1, 1, args.len())?;
    let r = receiver_ref(vm, args, "freeze")?;
    vm.heap.set_flag(r, ObjFlags::FROZEN);
    Ok(args[0])
}

fn object_unfreeze(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#unfreeze", 1, 1, args.len())?;
    let r = receiver_ref(vm, args, "unfreeze")?;
    if vm.heap.has_flag(r, ObjFlags::STRING_INTERNED) {
        return Err(vm.frozen_error(&args[0]));
    }
    vm.heap.unset_flag(r, ObjFlags::FROZEN);
    Ok(args[0])
}

fn object_is_frozen(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#isFrozen", 1, 1, args.len())?;
    let r = receiver_ref(vm, args, "isFrozen")?;
    Ok(Value::Bool(vm.heap.header(r).is_frozen()))
}

fn object_dup(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#dup", 1, 1, args.len())?;
    let r = receiver_ref(vm, args, "dup")?;
    let dup = match vm.heap.kind(r) {
        ObjKind::String => {
            let bytes = vm.heap.string(r).bytes.clone();
            vm.new_string(bytes)
        }
        // Array duplication shares the buffer copy-on-write.
        ObjKind::Array => vm.new_array_shared(r),
        ObjKind::Map => {
            let entries: Vec<(Value, Value)> = vm.heap.map(r).table.iter().collect();
            let dup = vm.new_map();
            for (k, v) in entries {
                vm.map_set(dup, k, v);
            }
            dup
        }
        ObjKind::Instance => {
            let klass = vm
                .heap
                .instance(r)
                .core
                .klass
                .expect("instances carry a class");
            let fields: Vec<(ObjRef, Value)> = vm
                .heap
                .instance(r)
                .core
                .fields
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect();
            let dup = vm.new_instance(klass);
            for (k, v) in fields {
                if let Some(core) = vm.heap.instance_core_mut(dup) {
                    core.fields.insert(k, v);
                }
                vm.heap.obj_write(dup, v);
            }
            dup
        }
        _ => {
            let tname = vm.type_name(&args[0]);
            return Err(vm.type_error(&format!("cannot dup a {tname}")));
        }
    };
    Ok(Value::Obj(dup))
}

fn object_hash_key(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#hashKey", 1, 1, args.len())?;
    let hash = vm.heap.value_hash(&args[0]);
    Ok(Value::Number((hash as u32) as f64))
}

fn object_op_equals(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#opEquals", 2, 2, args.len())?;
    Ok(Value::Bool(vm.heap.values_equal(&args[0], &args[1])))
}

fn object_is_same(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#isSame", 2, 2, args.len())?;
    Ok(Value::Bool(args[0].same(&args[1])))
}

fn object_send(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#send", 2, -1, args.len())?;
    let Some(name) = args[1]
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::String)
    else {
        return Err(vm.type_error("send expects a method name string"));
    };
    let name_bytes = vm.heap.string(name).bytes.clone();
    let name = vm.intern_bytes(&name_bytes);
    vm.call_method_sync(args[0], name, &args[2..])
}

fn object_object_id(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#objectId", 1, 1, args.len())?;
    let r = receiver_ref(vm, args, "objectId")?;
    Ok(Value::Number(vm.heap.header(r).id as f64))
}

fn object_class(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#class", 1, 1, args.len())?;
    native_classof(vm, &args[..1])
}

fn object_singleton_class(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#singletonClass", 1, 1, args.len())?;
    let r = receiver_ref(vm, args, "singletonClass")?;
    let singleton = vm.singleton_class_of(r)?;
    Ok(Value::Obj(singleton))
}

fn object_extend(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#extend", 2, 2, args.len())?;
    let r = receiver_ref(vm, args, "extend")?;
    let Some(module) = args[1]
        .as_obj()
        .filter(|m| vm.heap.kind(*m) == ObjKind::Module)
    else {
        return Err(vm.type_error("extend expects a module"));
    };
    let singleton = vm.singleton_class_of(r)?;
    vm.include_module(singleton, module)?;
    Ok(args[0])
}

fn object_is_a(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#isA", 2, 2, args.len())?;
    let Some(klass) = args[1]
        .as_obj()
        .filter(|r| matches!(vm.heap.kind(*r), ObjKind::Class | ObjKind::Module))
    else {
        return Err(vm.type_error("isA expects a class or module"));
    };
    Ok(Value::Bool(vm.is_a(&args[0], klass)))
}

fn object_inspect(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Object#inspect", 1, 1, args.len())?;
    let rendered = vm.display_value(&args[0]);
    let s = vm.new_string(rendered.into_bytes());
    Ok(Value::Obj(s))
}

// ---- Class / Module ----

fn register_class(vm: &mut Vm) {
    let class = vm.core.class.expect("bootstrapped");
    vm.add_native_method(class, "include", class_include);
    vm.add_native_method(class, "superclass", class_superclass);
    vm.add_native_method(class, "name", class_name);
    vm.add_native_method(class, "ancestors", class_ancestors);
}

fn class_receiver(vm: &mut Vm, args: &[Value], what: &str) -> VmResult<ObjRef> {
    match args[0]
        .as_obj()
        .filter(|r| matches!(vm.heap.kind(*r), ObjKind::Class | ObjKind::Module))
    {
        Some(r) => Ok(r),
        None => {
            let tname = vm.type_name(&args[0]);
            Err(vm.type_error(&format!("{what} requires a class receiver, got {tname}")))
        }
    }
}

fn class_include(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Class#include", 2, 2, args.len())?;
    let klass = class_receiver(vm, args, "include")?;
    let Some(module) = args[1]
        .as_obj()
        .filter(|m| vm.heap.kind(*m) == ObjKind::Module)
    else {
        return Err(vm.type_error("include expects a module"));
    };
    vm.include_module(klass, module)?;
    Ok(args[0])
}

fn class_superclass(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Class#superclass", 1, 1, args.len())?;
    let klass = class_receiver(vm, args, "superclass")?;
    // Skip IClass links: the guest sees real classes only.
    let mut link = vm.heap.class(klass).info.superclass;
    while let Some(k) = link {
        match vm.heap.kind(k) {
            ObjKind::IClass => link = vm.heap.iclass(k).superclass,
            _ => return Ok(Value::Obj(k)),
        }
    }
    Ok(Value::Nil)
}

fn class_name(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Class#name", 1, 1, args.len())?;
    let klass = class_receiver(vm, args, "name")?;
    let name = vm.class_name(klass);
    let s = vm.new_string(name.into_bytes());
    Ok(Value::Obj(s))
}

fn class_ancestors(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Class#ancestors", 1, 1, args.len())?;
    let klass = class_receiver(vm, args, "ancestors")?;
    let mut out = Vec::new();
    let mut link = Some(klass);
    while let Some(k) = link {
        match vm.heap.kind(k) {
            ObjKind::IClass => {
                out.push(Value::Obj(vm.heap.iclass(k).module));
                link = vm.heap.iclass(k).superclass;
            }
            _ => {
                out.push(Value::Obj(k));
                link = vm.heap.class(k).info.superclass;
            }
        }
    }
    let ary = vm.new_array(out);
    Ok(Value::Obj(ary))
}

// ---- Error ----

fn register_error(vm: &mut Vm) {
    let error = vm.core.error.expect("bootstrapped");
    vm.add_native_method(error, "init", error_init);
}

fn error_init(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Error#init", 1, 2, args.len())?;
    let r = receiver_ref(vm, args, "Error#init")?;
    let message = args.get(1).copied().unwrap_or(Value::Nil);
    let key = vm.intern("message");
    if let Some(core) = vm.heap.instance_core_mut(r) {
        core.fields.insert(key, message);
    }
    vm.heap.obj_write(r, message);
    Ok(args[0])
}

// ---- String ----

fn register_string(vm: &mut Vm) {
    let string = vm.core.string.expect("bootstrapped");
    vm.add_native_method(string, "opAdd", string_op_add);
    vm.add_native_method(string, "opEquals", string_op_equals);
    vm.add_native_method(string, "push", string_push);
    vm.add_native_getter(string, "size", string_size);
}

fn string_receiver(vm: &mut Vm, args: &[Value], what: &str) -> VmResult<ObjRef> {
    match args[0]
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::String)
    {
        Some(r) => Ok(r),
        None => {
            let tname = vm.type_name(&args[0]);
            Err(vm.type_error(&format!("{what} requires a String receiver, got {tname}")))
        }
    }
}

fn string_op_add(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("String#opAdd", 2, 2, args.len())?;
    let lhs = string_receiver(vm, args, "String#+")?;
    let Some(rhs) = args[1]
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::String)
    else {
        let tname = vm.type_name(&args[1]);
        return Err(vm.type_error(&format!(
            "String#+ (opAdd) called with non-string argument. Type: {tname}"
        )));
    };
    let mut bytes = vm.heap.string(lhs).bytes.clone();
    bytes.extend_from_slice(&vm.heap.string(rhs).bytes);
    let s = vm.new_string(bytes);
    Ok(Value::Obj(s))
}

fn string_op_equals(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("String#opEquals", 2, 2, args.len())?;
    Ok(Value::Bool(vm.heap.values_equal(&args[0], &args[1])))
}

fn string_push(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("String#push", 2, 2, args.len())?;
    let r = string_receiver(vm, args, "String#push")?;
    if vm.heap.header(r).is_frozen() {
        return Err(vm.frozen_error(&args[0]));
    }
    let Some(other) = args[1]
        .as_obj()
        .filter(|o| vm.heap.kind(*o) == ObjKind::String)
    else {
        return Err(vm.type_error("String#push expects a string"));
    };
    let bytes = vm.heap.string(other).bytes.clone();
    vm.heap.string_mut(r).push_bytes(&bytes);
    Ok(args[0])
}

fn string_size(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let r = string_receiver(vm, args, "String#size")?;
    Ok(Value::Number(vm.heap.string(r).len() as f64))
}

// ---- Array ----

fn register_array(vm: &mut Vm) {
    let array = vm.core.array.expect("bootstrapped");
    vm.add_native_method(array, "push", array_push);
    vm.add_native_method(array, "opShovelLeft", array_push);
    vm.add_native_method(array, "pop", array_pop);
    vm.add_native_method(array, "clear", array_clear);
    vm.add_native_method(array, "dup", array_dup);
    vm.add_native_method(array, "each", array_each);
    vm.add_native_method(array, "map", array_map);
    vm.add_native_method(array, "select", array_select);
    vm.add_native_method(array, "reject", array_reject);
    vm.add_native_method(array, "find", array_find);
    vm.add_native_method(array, "reduce", array_reduce);
    vm.add_native_method(array, "opEquals", array_op_equals);
    vm.add_native_getter(array, "size", array_size);
}

fn array_receiver(vm: &mut Vm, args: &[Value], what: &str) -> VmResult<ObjRef> {
    match args[0]
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Array)
    {
        Some(r) => Ok(r),
        None => {
            let tname = vm.type_name(&args[0]);
            Err(vm.type_error(&format!("{what} requires an Array receiver, got {tname}")))
        }
    }
}

fn check_mutable(vm: &mut Vm, r: ObjRef, receiver: &Value) -> VmResult<()> {
    if vm.heap.header(r).is_frozen() {
        return Err(vm.frozen_error(receiver));
    }
    Ok(())
}

fn array_push(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#push", 2, 2, args.len())?;
    let r = array_receiver(vm, args, "Array#push")?;
    check_mutable(vm, r, &args[0])?;
    vm.heap.array_mut(r).push(args[1]);
    vm.heap.obj_write(r, args[1]);
    Ok(args[0])
}

fn array_pop(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#pop", 1, 1, args.len())?;
    let r = array_receiver(vm, args, "Array#pop")?;
    check_mutable(vm, r, &args[0])?;
    Ok(vm.heap.array_mut(r).pop().unwrap_or(Value::Nil))
}

fn array_clear(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#clear", 1, 1, args.len())?;
    let r = array_receiver(vm, args, "Array#clear")?;
    check_mutable(vm, r, &args[0])?;
    vm.heap.array_mut(r).clear();
    Ok(args[0])
}

fn array_dup(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#dup", 1, 1, args.len())?;
    let r = array_receiver(vm, args, "Array#dup")?;
    let dup = vm.new_array_shared(r);
    Ok(Value::Obj(dup))
}

fn array_size(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let r = array_receiver(vm, args, "Array#size")?;
    Ok(Value::Number(vm.heap.array(r).len() as f64))
}

fn array_op_equals(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#opEquals", 2, 2, args.len())?;
    let lhs = array_receiver(vm, args, "Array#opEquals")?;
    let Some(rhs) = args[1]
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Array)
    else {
        return Ok(Value::FALSE);
    };
    if vm.heap.array(lhs).len() != vm.heap.array(rhs).len() {
        return Ok(Value::FALSE);
    }
    let len = vm.heap.array(lhs).len();
    for i in 0..len {
        let a = vm.heap.array(lhs).get(i).unwrap_or(Value::Nil);
        let b = vm.heap.array(rhs).get(i).unwrap_or(Value::Nil);
        if !vm.heap.values_equal(&a, &b) {
            return Ok(Value::FALSE);
        }
    }
    Ok(Value::TRUE)
}

/// The block for an iteration helper, from the helper's own frame.
fn iteration_block(vm: &mut Vm, what: &str) -> VmResult<Value> {
    match blocks::current_block(vm) {
        Some(b) => Ok(b),
        None => {
            let klass = vm.core.error;
            Err(vm.throw_error(klass, &format!("no block given for {what}")))
        }
    }
}

fn array_each(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#each", 1, 1, args.len())?;
    let r = array_receiver(vm, args, "Array#each")?;
    let block = iteration_block(vm, "Array#each")?;
    let items = vm.heap.array(r).values().to_vec();
    vm.push_block_entry(BlockAccum::None);
    let driven = blocks::drive_block_iteration(vm, block, &items, |_, _, _| false);
    vm.pop_block_entry();
    match driven? {
        Some(early) => Ok(early),
        None => Ok(args[0]),
    }
}

fn array_map(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#map", 1, 1, args.len())?;
    let r = array_receiver(vm, args, "Array#map")?;
    let block = iteration_block(vm, "Array#map")?;
    let items = vm.heap.array(r).values().to_vec();
    vm.push_block_entry(BlockAccum::Map(Vec::new()));
    let driven = blocks::drive_block_iteration(vm, block, &items, |vm, _, v| {
        if let Some(BlockAccum::Map(acc)) = vm.thread_mut().blocks.last_mut().map(|e| &mut e.acc)
        {
            acc.push(v);
        }
        false
    });
    let entry = vm.pop_block_entry();
    match driven? {
        Some(early) => Ok(early),
        None => {
            let acc = match entry.map(|e| e.acc) {
                Some(BlockAccum::Map(acc)) => acc,
                _ => Vec::new(),
            };
            let out = vm.new_array(acc);
            Ok(Value::Obj(out))
        }
    }
}

fn array_filter(vm: &mut Vm, args: &[Value], what: &str, keep_truthy: bool) -> VmResult<Value> {
    vm.check_arity(what, 1, 1, args.len())?;
    let r = array_receiver(vm, args, what)?;
    let block = iteration_block(vm, what)?;
    let items = vm.heap.array(r).values().to_vec();
    let acc = if keep_truthy {
        BlockAccum::Select(Vec::new())
    } else {
        BlockAccum::Reject(Vec::new())
    };
    vm.push_block_entry(acc);
    let driven = blocks::drive_block_iteration(vm, block, &items, move |vm, item, v| {
        let keep = v.truthy() == keep_truthy;
        match vm.thread_mut().blocks.last_mut().map(|e| &mut e.acc) {
            Some(BlockAccum::Select(acc)) | Some(BlockAccum::Reject(acc)) if keep => {
                acc.push(item)
            }
            _ => {}
        }
        false
    });
    let entry = vm.pop_block_entry();
    match driven? {
        Some(early) => Ok(early),
        None => {
            let acc = match entry.map(|e| e.acc) {
                Some(BlockAccum::Select(acc)) | Some(BlockAccum::Reject(acc)) => acc,
                _ => Vec::new(),
            };
            let out = vm.new_array(acc);
            Ok(Value::Obj(out))
        }
    }
}

fn array_select(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    array_filter(vm, args, "Array#select", true)
}

fn array_reject(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    array_filter(vm, args, "Array#reject", false)
}

fn array_find(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#find", 1, 1, args.len())?;
    let r = array_receiver(vm, args, "Array#find")?;
    let block = iteration_block(vm, "Array#find")?;
    let items = vm.heap.array(r).values().to_vec();
    vm.push_block_entry(BlockAccum::Find(None));
    let driven = blocks::drive_block_iteration(vm, block, &items, |vm, item, v| {
        if v.truthy() {
            if let Some(entry) = vm.thread_mut().blocks.last_mut() {
                entry.acc = BlockAccum::Find(Some(item));
                // Early exit: the accumulator is satisfied.
                entry.iter_stop = true;
            }
            true
        } else {
            false
        }
    });
    let entry = vm.pop_block_entry();
    driven?;
    match entry.map(|e| e.acc) {
        Some(BlockAccum::Find(Some(found))) => Ok(found),
        _ => Ok(Value::Nil),
    }
}

fn array_reduce(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Array#reduce", 2, 2, args.len())?;
    let r = array_receiver(vm, args, "Array#reduce")?;
    let block = iteration_block(vm, "Array#reduce")?;
    let items = vm.heap.array(r).values().to_vec();
    vm.push_block_entry(BlockAccum::Reduce(args[1]));
    let mut result = Ok(None);
    for &item in &items {
        let acc = match vm.thread().blocks.last().map(|e| &e.acc) {
            Some(BlockAccum::Reduce(acc)) => *acc,
            _ => Value::Nil,
        };
        match blocks::yield_to_block(vm, block, &[acc, item]) {
            Ok(YieldOutcome::Value(v)) => {
                if let Some(entry) = vm.thread_mut().blocks.last_mut() {
                    entry.acc = BlockAccum::Reduce(v);
                }
            }
            Ok(YieldOutcome::Break) => {
                result = Ok(Some(Value::Nil));
                break;
            }
            Ok(YieldOutcome::Return(v)) => {
                result = Err(Unwind::ReturnBlock(v));
                break;
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    let entry = vm.pop_block_entry();
    match result? {
        Some(early) => Ok(early),
        None => match entry.map(|e| e.acc) {
            Some(BlockAccum::Reduce(acc)) => Ok(acc),
            _ => Ok(Value::Nil),
        },
    }
}

// ---- Map ----

fn register_map(vm: &mut Vm) {
    let map = vm.core.map.expect("bootstrapped");
    vm.add_native_method(map, "opIndexGet", map_op_index_get);
    vm.add_native_method(map, "opIndexSet", map_op_index_set);
    vm.add_native_method(map, "delete", map_delete);
    vm.add_native_method(map, "opEquals", map_op_equals);
    vm.add_native_method(map, "keys", map_keys);
    vm.add_native_getter(map, "size", map_size);
}

fn map_receiver(vm: &mut Vm, args: &[Value], what: &str) -> VmResult<ObjRef> {
    match args[0].as_obj().filter(|r| vm.heap.kind(*r) == ObjKind::Map) {
        Some(r) => Ok(r),
        None => {
            let tname = vm.type_name(&args[0]);
            Err(vm.type_error(&format!("{what} requires a Map receiver, got {tname}")))
        }
    }
}

fn map_op_index_get(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Map#opIndexGet", 2, 2, args.len())?;
    let r = map_receiver(vm, args, "Map#opIndexGet")?;
    Ok(vm.map_get(r, &args[1]).unwrap_or(Value::Nil))
}

fn map_op_index_set(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Map#opIndexSet", 3, 3, args.len())?;
    let r = map_receiver(vm, args, "Map#opIndexSet")?;
    check_mutable(vm, r, &args[0])?;
    vm.map_set(r, args[1], args[2]);
    Ok(args[2])
}

fn map_delete(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Map#delete", 2, 2, args.len())?;
    let r = map_receiver(vm, args, "Map#delete")?;
    check_mutable(vm, r, &args[0])?;
    Ok(vm.map_delete(r, &args[1]).unwrap_or(Value::Nil))
}

fn map_op_equals(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Map#opEquals", 2, 2, args.len())?;
    let lhs = map_receiver(vm, args, "Map#opEquals")?;
    let Some(rhs) = args[1].as_obj().filter(|r| vm.heap.kind(*r) == ObjKind::Map) else {
        return Ok(Value::FALSE);
    };
    if vm.heap.map(lhs).len() != vm.heap.map(rhs).len() {
        return Ok(Value::FALSE);
    }
    let entries: Vec<(Value, Value)> = vm.heap.map(lhs).table.iter().collect();
    for (k, v) in entries {
        match vm.map_get(rhs, &k) {
            Some(other) if vm.heap.values_equal(&v, &other) => {}
            _ => return Ok(Value::FALSE),
        }
    }
    Ok(Value::TRUE)
}

fn map_keys(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Map#keys", 1, 1, args.len())?;
    let r = map_receiver(vm, args, "Map#keys")?;
    let keys: Vec<Value> = vm.heap.map(r).table.iter().map(|(k, _)| k).collect();
    let out = vm.new_array(keys);
    Ok(Value::Obj(out))
}

fn map_size(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let r = map_receiver(vm, args, "Map#size")?;
    Ok(Value::Number(vm.heap.map(r).len() as f64))
}

// ---- GC module ----

fn register_gc(vm: &mut Vm) {
    let gc = vm.core.gc_module.expect("bootstrapped");
    vm.add_native_static_method(gc, "collect", gc_collect);
    vm.add_native_static_method(gc, "collectYoung", gc_collect_young);
    vm.add_native_static_method(gc, "stats", gc_stats);
    vm.add_native_static_method(gc, "setFinalizer", gc_set_finalizer);
    vm.add_native_static_method(gc, "off", gc_off);
    vm.add_native_static_method(gc, "on", gc_on);
}

fn gc_collect(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("GC.collect", 1, 1, args.len())?;
    vm.collect_garbage(true);
    Ok(Value::Nil)
}

fn gc_collect_young(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("GC.collectYoung", 1, 1, args.len())?;
    vm.collect_garbage(false);
    Ok(Value::Nil)
}

fn gc_stats(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("GC.stats", 1, 1, args.len())?;
    let stats = vm.heap.stats.clone();
    let live_objects = vm.heap.live_objects();
    let live_bytes = vm.heap.live_bytes();
    let map = vm.new_map();
    for (name, value) in [
        ("liveObjects", live_objects as f64),
        ("liveBytes", live_bytes as f64),
        ("minorCycles", stats.minor_cycles as f64),
        ("majorCycles", stats.major_cycles as f64),
        ("objectsFreed", stats.objects_freed as f64),
        ("finalizersScheduled", stats.finalizers_scheduled as f64),
    ] {
        let key = vm.new_string(name.as_bytes().to_vec());
        vm.map_set(map, Value::Obj(key), Value::Number(value));
    }
    Ok(Value::Obj(map))
}

fn gc_set_finalizer(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("GC.setFinalizer", 3, 3, args.len())?;
    let Some(target) = args[1].as_obj() else {
        return Err(vm.type_error("setFinalizer target must be an object"));
    };
    let Some(callable) = args[2].as_obj().filter(|r| {
        matches!(vm.heap.kind(*r), ObjKind::Closure | ObjKind::Native)
    }) else {
        return Err(vm.type_error("finalizer must be callable"));
    };
    match vm.heap.instance_core_mut(target) {
        Some(core) => core.finalizer = Some(callable),
        None => return Err(vm.type_error("object cannot carry a finalizer")),
    }
    vm.heap.set_flag(target, ObjFlags::HAS_FINALIZER);
    vm.heap.obj_write(target, Value::Obj(callable));
    Ok(args[1])
}

fn gc_off(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("GC.off", 1, 1, args.len())?;
    vm.heap.gc_enabled = false;
    Ok(Value::Nil)
}

fn gc_on(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("GC.on", 1, 1, args.len())?;
    vm.heap.gc_enabled = true;
    Ok(Value::Nil)
}

// ---- Threads ----

fn register_thread(vm: &mut Vm) {
    // Thread objects are created through the global newThread; join is
    // a method for convenience.
    let thread = vm.core.thread.expect("bootstrapped");
    vm.add_native_method(thread, "join", thread_join);
}

fn native_new_thread(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("newThread", 1, 1, args.len())?;
    let Some(closure) = args[0]
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Closure)
    else {
        return Err(vm.type_error("newThread expects a function"));
    };
    let Some(shared) = vm.shared.as_ref().and_then(|w| w.upgrade()) else {
        let klass = vm.core.error;
        return Err(vm.throw_error(klass, "threading requires a runtime"));
    };

    let slot = vm.threads.len();
    let mut child = crate::thread::LxThread::new();
    // Root the entry closure on the child's own stack.
    child.ec_mut().stack.push(Value::Obj(closure));
    vm.threads.push(child);

    let thread_class = vm.core.thread.expect("bootstrapped");
    let instance = vm.new_instance(thread_class);
    let internal = vm.new_internal(InternalData::Thread(ThreadRef { slot }));
    vm.heap.instance_mut(instance).internal = Some(internal);
    vm.heap.obj_write(instance, Value::Obj(internal));
    vm.threads[slot].instance = Some(instance);

    let handle = crate::gvl::spawn_thread(shared, slot);
    vm.threads[slot].join_handle = Some(handle);
    log::debug!("spawned guest thread in slot {slot}");
    Ok(Value::Obj(instance))
}

fn thread_slot(vm: &mut Vm, v: &Value) -> VmResult<usize> {
    let internal = v
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Instance)
        .and_then(|r| vm.heap.instance(r).internal);
    match internal.map(|i| &vm.heap.internal(i).data) {
        Some(InternalData::Thread(t)) => Ok(t.slot),
        _ => Err(vm.type_error("expected a Thread")),
    }
}

fn native_join_thread(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("joinThread", 1, 1, args.len())?;
    let slot = thread_slot(vm, &args[0])?;
    join_slot(vm, slot)
}

fn thread_join(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Thread#join", 1, 1, args.len())?;
    let slot = thread_slot(vm, &args[0])?;
    join_slot(vm, slot)
}

fn join_slot(vm: &mut Vm, slot: usize) -> VmResult<Value> {
    if slot == vm.cur {
        let klass = vm.core.error;
        return Err(vm.throw_error(klass, "a thread cannot join itself"));
    }
    if vm.thread().run_level > 0 {
        // Joining here would hold the GVL across the wait and starve
        // the joined thread.
        let klass = vm.core.error;
        return Err(vm.throw_error(klass, "cannot join from a nested VM call"));
    }
    if vm.threads[slot].join_handle.is_none() {
        // Already joined; its outcome is final.
        if vm.threads[slot].errored {
            return Err(Unwind::Throw(vm.threads[slot].last_error));
        }
        return Ok(vm.threads[slot].result);
    }
    Err(Unwind::Suspend(SuspendOp::Join(slot)))
}

// ---- Mutex ----

fn register_mutex(vm: &mut Vm) {
    let mutex = vm.core.mutex.expect("bootstrapped");
    vm.add_native_method(mutex, "init", mutex_init);
    vm.add_native_method(mutex, "lock", mutex_lock);
    vm.add_native_method(mutex, "unlock", mutex_unlock);
    vm.add_native_method(mutex, "synchronize", mutex_synchronize);
}

fn mutex_internal(vm: &mut Vm, v: &Value) -> VmResult<ObjRef> {
    let internal = v
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Instance)
        .and_then(|r| vm.heap.instance(r).internal);
    match internal {
        Some(i) if matches!(vm.heap.internal(i).data, InternalData::Mutex(_)) => Ok(i),
        _ => Err(vm.type_error("expected a Mutex")),
    }
}

fn mutex_init(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Mutex#init", 1, 1, args.len())?;
    let r = receiver_ref(vm, args, "Mutex#init")?;
    let internal = vm.new_internal(InternalData::Mutex(MutexState::default()));
    vm.heap.instance_mut(r).internal = Some(internal);
    vm.heap.obj_write(r, Value::Obj(internal));
    Ok(args[0])
}

fn mutex_lock(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Mutex#lock", 1, 1, args.len())?;
    let internal = mutex_internal(vm, &args[0])?;
    let inner = match &vm.heap.internal(internal).data {
        InternalData::Mutex(st) => st.inner.clone(),
        _ => unreachable!(),
    };
    // Uncontended fast path: take the lock without touching the GVL.
    let acquired = {
        let mut locked = inner.0.lock().expect("mutex state poisoned");
        if !*locked {
            *locked = true;
            true
        } else {
            false
        }
    };
    if acquired {
        let cur = vm.cur;
        if let InternalData::Mutex(st) = &mut vm.heap.internal_mut(internal).data {
            st.owner = Some(cur);
        }
        return Ok(Value::Nil);
    }
    // Contended: the wait is a blocking operation and must not hold
    // the GVL (see DESIGN notes on the documented trade-off). A nested
    // VM pass has no suspension point to resume from, and waiting
    // there would starve the unlocking thread.
    if vm.thread().run_level > 0 {
        let klass = vm.core.error;
        return Err(vm.throw_error(klass, "Mutex contended inside a nested VM call"));
    }
    Err(Unwind::Suspend(SuspendOp::LockMutex(internal)))
}

fn mutex_unlock(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Mutex#unlock", 1, 1, args.len())?;
    let internal = mutex_internal(vm, &args[0])?;
    let inner = match &vm.heap.internal(internal).data {
        InternalData::Mutex(st) => st.inner.clone(),
        _ => unreachable!(),
    };
    {
        let mut locked = inner.0.lock().expect("mutex state poisoned");
        if !*locked {
            let klass = vm.core.error;
            return Err(vm.throw_error(klass, "unlock of an unlocked Mutex"));
        }
        *locked = false;
        inner.1.notify_one();
    }
    if let InternalData::Mutex(st) = &mut vm.heap.internal_mut(internal).data {
        st.owner = None;
    }
    Ok(Value::Nil)
}

fn mutex_synchronize(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Mutex#synchronize", 1, 1, args.len())?;
    let block = iteration_block(vm, "Mutex#synchronize")?;
    mutex_lock(vm, args)?;
    let outcome = blocks::yield_to_block(vm, block, &[]);
    // The unlock pairs with the lock on every path.
    let unlock_result = mutex_unlock(vm, args);
    let outcome = outcome?;
    unlock_result?;
    match outcome {
        YieldOutcome::Value(v) => Ok(v),
        YieldOutcome::Break => Ok(Value::Nil),
        YieldOutcome::Return(v) => Err(Unwind::ReturnBlock(v)),
    }
}

// ---- Block ----

fn register_block(vm: &mut Vm) {
    let block = vm.core.block.expect("bootstrapped");
    vm.add_native_method(block, "init", block_init);
    vm.add_native_method(block, "yield", block_yield);
}

fn block_init(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Block#init", 2, 2, args.len())?;
    let r = receiver_ref(vm, args, "Block#init")?;
    let Some(callable) = args[1].as_obj().filter(|c| {
        matches!(vm.heap.kind(*c), ObjKind::Closure | ObjKind::Native)
    }) else {
        return Err(vm.type_error("Block#init expects a function"));
    };
    let internal = vm.new_internal(InternalData::Block { callable });
    vm.heap.instance_mut(r).internal = Some(internal);
    vm.heap.obj_write(r, Value::Obj(internal));
    Ok(args[0])
}

fn block_yield(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Block#yield", 1, -1, args.len())?;
    match blocks::yield_to_block(vm, args[0], &args[1..])? {
        YieldOutcome::Value(v) => Ok(v),
        YieldOutcome::Break => Ok(Value::Nil),
        YieldOutcome::Return(v) => Ok(v),
    }
}

// ---- Signal ----

fn register_signal(vm: &mut Vm) {
    let signal = vm.core.signal_module.expect("bootstrapped");
    vm.add_native_static_method(signal, "trap", signal_trap);
}

fn signal_trap(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("Signal.trap", 3, 3, args.len())?;
    let Some(signo) = args[1].as_number().map(|n| n as i32) else {
        return Err(vm.type_error("Signal.trap expects a signal number"));
    };
    let previous = vm.traps.insert(signo, args[2]).unwrap_or(Value::Nil);
    Ok(previous)
}

// ---- ENV ----

fn register_env(vm: &mut Vm) {
    let object = vm.core.object.expect("bootstrapped");
    let env_class = vm.add_global_class("Env", Some(object));
    vm.add_native_method(env_class, "opIndexGet", env_op_index_get);
    vm.add_native_method(env_class, "opIndexSet", env_op_index_set);
    let env = vm.new_instance(env_class);
    vm.heap.promote_now(env);
    let key = vm.intern("ENV");
    vm.globals.insert(key, Value::Obj(env));
    vm.constants.insert(key, Value::Obj(env));
}

fn env_string_arg(vm: &mut Vm, v: &Value, what: &str) -> VmResult<String> {
    match v.as_obj().filter(|r| vm.heap.kind(*r) == ObjKind::String) {
        Some(r) => Ok(vm.heap.string(r).as_str_lossy().into_owned()),
        None => Err(vm.type_error(&format!("{what} expects a string"))),
    }
}

fn env_op_index_get(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("ENV#opIndexGet", 2, 2, args.len())?;
    let name = env_string_arg(vm, &args[1], "ENV[]")?;
    match std::env::var(&name) {
        Ok(v) => {
            let s = vm.new_string(v.into_bytes());
            Ok(Value::Obj(s))
        }
        Err(_) => Ok(Value::Nil),
    }
}

fn env_op_index_set(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    vm.check_arity("ENV#opIndexSet", 3, 3, args.len())?;
    let name = env_string_arg(vm, &args[1], "ENV[]=")?;
    let value = env_string_arg(vm, &args[2], "ENV[]=")?;
    std::env::set_var(name, value);
    Ok(args[2])
}
