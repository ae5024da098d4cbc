//! Literal and constant-pool instructions.

use super::JumpTable;
use crate::error::VmResult;
use crate::instruction::Instruction;
use crate::object::{ObjFlags, ObjKind};
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Constant, op_constant);
    table.register(OpCode::True, |vm, _| {
        vm.push(Value::TRUE);
        Ok(())
    });
    table.register(OpCode::False, |vm, _| {
        vm.push(Value::FALSE);
        Ok(())
    });
    table.register(OpCode::Nil, |vm, _| {
        vm.push(Value::Nil);
        Ok(())
    });
    table.register(OpCode::String, op_string);
    table.register(OpCode::Array, op_array);
    table.register(OpCode::DupArray, op_dup_array);
    table.register(OpCode::Map, op_map);
    table.register(OpCode::DupMap, op_dup_map);
    table.register(OpCode::Regex, op_regex);
}

fn op_constant(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let value = vm.frame_constant(insn.byte(0) as usize)?;
    vm.push(value);
    Ok(())
}

fn op_string(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let constant = vm.frame_string_constant(insn.byte(0) as usize)?;
    let is_static = insn.byte(1) != 0;
    if is_static {
        // Static literals push the frozen interned constant itself.
        vm.push(Value::Obj(constant));
    } else {
        let bytes = vm.heap.string(constant).bytes.clone();
        let fresh = vm.new_string(bytes);
        vm.push(Value::Obj(fresh));
    }
    Ok(())
}

fn op_array(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let n = insn.byte(0) as usize;
    let start = vm
        .stack_len()
        .checked_sub(n)
        .ok_or_else(|| crate::error::VmError::stack_underflow(n, vm.stack_len()))?;
    // Allocate while the elements are still stack-rooted.
    let values = vm.ec().stack[start..].to_vec();
    let ary = vm.new_array(values);
    vm.pop_n(n)?;
    vm.push(Value::Obj(ary));
    Ok(())
}

fn op_dup_array(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let constant = vm.frame_constant(insn.byte(0) as usize)?;
    let Some(source) = constant
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Array)
    else {
        return Err(vm.type_error("DUPARRAY constant is not an array"));
    };
    let dup = vm.new_array_shared(source);
    vm.push(Value::Obj(dup));
    Ok(())
}

fn op_map(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let n = insn.byte(0) as usize;
    let len = 2 * n;
    let start = vm
        .stack_len()
        .checked_sub(len)
        .ok_or_else(|| crate::error::VmError::stack_underflow(len, vm.stack_len()))?;
    // Allocate while the entries are still stack-rooted; inserting
    // afterwards allocates nothing.
    let pairs = vm.ec().stack[start..].to_vec();
    let map = vm.new_map();
    vm.pop_n(len)?;
    for pair in pairs.chunks(2) {
        vm.map_set(map, pair[0], pair[1]);
    }
    vm.push(Value::Obj(map));
    Ok(())
}

fn op_dup_map(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let constant = vm.frame_constant(insn.byte(0) as usize)?;
    let Some(source) = constant
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Map)
    else {
        return Err(vm.type_error("DUPMAP constant is not a map"));
    };
    let entries: Vec<(Value, Value)> = vm.heap.map(source).table.iter().collect();
    let map = vm.new_map();
    for (k, v) in entries {
        vm.map_set(map, k, v);
    }
    vm.push(Value::Obj(map));
    Ok(())
}

fn op_regex(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let source = vm.frame_string_constant(insn.byte(0) as usize)?;
    let regex = vm.new_internal(crate::object::InternalData::Regex { source });
    vm.heap.set_flag(regex, ObjFlags::FROZEN);
    vm.push(Value::Obj(regex));
    Ok(())
}
