//! Exception, indexing, and block non-local-exit instructions.

use super::JumpTable;
use crate::error::{Unwind, VmResult};
use crate::instruction::Instruction;
use crate::object::ObjKind;
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Throw, op_throw);
    table.register(OpCode::GetThrown, op_get_thrown);
    table.register(OpCode::RethrowIfErr, op_rethrow_if_err);
    table.register(OpCode::IndexGet, op_index_get);
    table.register(OpCode::IndexSet, op_index_set);
    table.register(OpCode::BlockBreak, |_, _| Err(Unwind::BreakBlock));
    table.register(OpCode::BlockContinue, |vm, _| {
        let value = vm.pop()?;
        Err(Unwind::ContinueBlock(value))
    });
    table.register(OpCode::BlockReturn, |vm, _| {
        let value = vm.pop()?;
        Err(Unwind::ReturnBlock(value))
    });
}

fn op_throw(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let value = vm.pop()?;
    // A bare string throw wraps itself in Error(msg).
    let throwable = match value.as_obj() {
        Some(r) if vm.heap.kind(r) == ObjKind::String => {
            let msg = vm.heap.string(r).as_str_lossy().into_owned();
            vm.make_error(vm.core.error, &msg)
        }
        Some(r) if vm.heap.header(r).is_instance_like() => {
            let error_class = vm.core.error.expect("bootstrapped");
            if !vm.is_a(&value, error_class) {
                let tname = vm.type_name(&value);
                return Err(vm.type_error(&format!("cannot throw a {tname}")));
            }
            value
        }
        _ => {
            let tname = vm.type_name(&value);
            return Err(vm.type_error(&format!("cannot throw a {tname}")));
        }
    };
    vm.thread_mut().last_error = throwable;
    Err(Unwind::Throw(throwable))
}

/// Reads the throwable stashed on the catch row the frame entered last.
fn op_get_thrown(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let function = vm.frame_function();
    let thrown = vm
        .frame()
        .active_catches
        .last()
        .and_then(|(row, pending)| {
            match pending {
                Some(Unwind::Throw(v)) => Some(*v),
                _ => vm.heap.function(function).chunk.catch_tables[*row].thrown,
            }
        })
        .unwrap_or(Value::Nil);
    vm.push(thrown);
    Ok(())
}

/// Ends a handler: pops the frame's innermost active catch entry and,
/// for an ensure entered by unwinding, re-raises what was in flight.
fn op_rethrow_if_err(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    match vm.frame_mut().active_catches.pop() {
        Some((_, Some(pending))) => Err(pending),
        _ => Ok(()),
    }
}

fn op_index_get(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let index = vm.pop()?;
    let receiver = vm.pop()?;
    let Some(r) = receiver.as_obj() else {
        let tname = vm.type_name(&receiver);
        return Err(vm.type_error(&format!("{tname} cannot be indexed")));
    };
    match vm.heap.kind(r) {
        ObjKind::Array => {
            let Value::Number(n) = index else {
                let tname = vm.type_name(&index);
                return Err(vm.type_error(&format!("array index must be a number, got {tname}")));
            };
            // Out-of-range and negative reads yield nil.
            let value = if n < 0.0 {
                Value::Nil
            } else {
                vm.heap.array(r).get(n as usize).unwrap_or(Value::Nil)
            };
            vm.push(value);
            Ok(())
        }
        ObjKind::Map => {
            let value = vm
                .heap
                .map(r)
                .table
                .get(&vm.heap, &index)
                .unwrap_or(Value::Nil);
            vm.push(value);
            Ok(())
        }
        _ => {
            let name = vm.intern("opIndexGet");
            let result = vm.call_method_sync(receiver, name, &[index])?;
            vm.push(result);
            Ok(())
        }
    }
}

fn op_index_set(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let value = vm.pop()?;
    let index = vm.pop()?;
    let receiver = vm.pop()?;
    let Some(r) = receiver.as_obj() else {
        let tname = vm.type_name(&receiver);
        return Err(vm.type_error(&format!("{tname} cannot be indexed")));
    };
    if vm.heap.header(r).is_frozen() {
        return Err(vm.frozen_error(&receiver));
    }
    match vm.heap.kind(r) {
        ObjKind::Array => {
            let Value::Number(n) = index else {
                let tname = vm.type_name(&index);
                return Err(vm.type_error(&format!("array index must be a number, got {tname}")));
            };
            if n < 0.0 {
                return Err(vm.type_error("array index must not be negative"));
            }
            vm.heap.array_mut(r).set(n as usize, value);
            vm.heap.obj_write(r, value);
            vm.push(value);
            Ok(())
        }
        ObjKind::Map => {
            vm.map_set(r, index, value);
            vm.push(value);
            Ok(())
        }
        _ => {
            let name = vm.intern("opIndexSet");
            let result = vm.call_method_sync(receiver, name, &[index, value])?;
            vm.push(result);
            Ok(())
        }
    }
}
