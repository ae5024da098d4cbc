//! Locals, upvalues, globals, and constant lookup.

use super::JumpTable;
use crate::error::VmResult;
use crate::instruction::Instruction;
use crate::object::ObjKind;
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::GetLocal, op_get_local);
    table.register(OpCode::SetLocal, op_set_local);
    table.register(OpCode::UnpackSetLocal, op_unpack_set_local);
    table.register(OpCode::GetUpvalue, op_get_upvalue);
    table.register(OpCode::SetUpvalue, op_set_upvalue);
    table.register(OpCode::CloseUpvalue, op_close_upvalue);
    table.register(OpCode::GetGlobal, op_get_global);
    table.register(OpCode::SetGlobal, op_set_global);
    table.register(OpCode::DefineGlobal, op_define_global);
    table.register(OpCode::UnpackDefineGlobal, op_unpack_define_global);
    table.register(OpCode::GetConst, op_get_const);
    table.register(OpCode::SetConst, op_set_const);
    table.register(OpCode::GetConstUnder, op_get_const_under);
}

fn op_get_local(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let slot = insn.byte(0) as usize;
    let base = vm.frame().base;
    let value = vm.stack_at(base + slot);
    vm.push(value);
    Ok(())
}

fn op_set_local(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let slot = insn.byte(0) as usize;
    let base = vm.frame().base;
    // Assignment is an expression; the value stays on the stack.
    let value = vm.peek(0)?;
    vm.set_stack_at(base + slot, value);
    Ok(())
}

fn op_unpack_set_local(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let slot = insn.byte(0) as usize;
    let unpack_index = insn.byte(1) as usize;
    let base = vm.frame().base;
    let rhs = vm.peek(0)?;
    let element = match rhs.as_obj() {
        Some(r) if vm.heap.kind(r) == ObjKind::Array => {
            vm.heap.array(r).get(unpack_index).unwrap_or(Value::Nil)
        }
        // Destructuring a non-array gives the whole value to index 0.
        _ if unpack_index == 0 => rhs,
        _ => Value::Nil,
    };
    vm.set_stack_at(base + slot, element);
    Ok(())
}

fn op_get_upvalue(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let slot = insn.byte(0) as usize;
    let closure = vm
        .frame()
        .closure
        .expect("upvalue access requires a guest frame");
    let cell = vm.heap.closure(closure).upvalues[slot];
    let value = vm.upvalue_get(cell);
    vm.push(value);
    Ok(())
}

fn op_set_upvalue(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let slot = insn.byte(0) as usize;
    let closure = vm
        .frame()
        .closure
        .expect("upvalue access requires a guest frame");
    let cell = vm.heap.closure(closure).upvalues[slot];
    let value = vm.peek(0)?;
    vm.upvalue_set(cell, value);
    Ok(())
}

fn op_close_upvalue(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    // Close the upvalue over the slot being popped.
    let top = vm.stack_len() - 1;
    vm.close_upvalues(top);
    vm.pop()?;
    Ok(())
}

fn op_get_global(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    match vm.globals.get(&name).copied() {
        Some(value) => {
            vm.push(value);
            Ok(())
        }
        None => {
            let gname = vm.heap.string(name).as_str_lossy().into_owned();
            Err(vm.name_error(&format!("undefined global variable '{gname}'")))
        }
    }
}

fn op_set_global(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    if !vm.globals.contains_key(&name) {
        let gname = vm.heap.string(name).as_str_lossy().into_owned();
        return Err(vm.name_error(&format!("undefined global variable '{gname}'")));
    }
    let value = vm.peek(0)?;
    vm.globals.insert(name, value);
    Ok(())
}

fn op_define_global(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let value = vm.pop()?;
    vm.globals.insert(name, value);
    Ok(())
}

fn op_unpack_define_global(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let unpack_index = insn.byte(1) as usize;
    let rhs = vm.peek(0)?;
    let element = match rhs.as_obj() {
        Some(r) if vm.heap.kind(r) == ObjKind::Array => {
            vm.heap.array(r).get(unpack_index).unwrap_or(Value::Nil)
        }
        _ if unpack_index == 0 => rhs,
        _ => Value::Nil,
    };
    vm.globals.insert(name, element);
    Ok(())
}

/// Walks the cref chain (innermost class body outward through its
/// lexical `under` links), then the VM-wide constant table.
fn lookup_constant(vm: &Vm, name: crate::object::ObjRef) -> Option<Value> {
    let mut cref = vm.effective_cref();
    while let Some(k) = cref {
        if let Some(&v) = vm.heap.class(k).info.constants.get(&name) {
            return Some(v);
        }
        cref = vm.heap.class(k).info.under;
    }
    vm.constants.get(&name).copied()
}

fn op_get_const(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    match lookup_constant(vm, name) {
        Some(value) => {
            vm.push(value);
            Ok(())
        }
        None => {
            let cname = vm.heap.string(name).as_str_lossy().into_owned();
            Err(vm.name_error(&format!("undefined constant '{cname}'")))
        }
    }
}

fn op_set_const(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let value = vm.peek(0)?;
    match vm.effective_cref() {
        Some(owner) => {
            vm.heap.class_mut(owner).info.constants.insert(name, value);
            vm.heap.obj_write(owner, value);
        }
        None => {
            vm.constants.insert(name, value);
        }
    }
    Ok(())
}

fn op_get_const_under(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let owner = vm.pop()?;
    let Some(owner) = owner
        .as_obj()
        .filter(|r| matches!(vm.heap.kind(*r), ObjKind::Class | ObjKind::Module))
    else {
        return Err(vm.type_error("constant lookup target must be a class or module"));
    };
    // The owner's table, then up its superclass chain.
    let mut link = Some(owner);
    while let Some(k) = link {
        let holder = match vm.heap.kind(k) {
            ObjKind::IClass => vm.heap.iclass(k).module,
            _ => k,
        };
        if let Some(&v) = vm.heap.class(holder).info.constants.get(&name) {
            vm.push(v);
            return Ok(());
        }
        link = match vm.heap.kind(k) {
            ObjKind::IClass => vm.heap.iclass(k).superclass,
            _ => vm.heap.class(k).info.superclass,
        };
    }
    let cname = vm.heap.string(name).as_str_lossy().into_owned();
    let oname = vm.class_name(owner);
    Err(vm.name_error(&format!("undefined constant '{cname}' under {oname}")))
}
