//! Class and module definition instructions.

use super::JumpTable;
use crate::error::VmResult;
use crate::instruction::Instruction;
use crate::object::{ObjKind, ObjRef};
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Class, |vm, insn| define_class(vm, insn, None, false));
    table.register(OpCode::Module, |vm, insn| define_class(vm, insn, None, true));
    table.register(OpCode::Subclass, op_subclass);
    table.register(OpCode::In, op_in);
    table.register(OpCode::PopCref, op_pop_cref);
}

/// Looks up an existing class/module constant so definitions reopen
/// instead of shadowing.
fn existing_definition(vm: &Vm, name: ObjRef) -> Option<ObjRef> {
    if let Some(owner) = vm.effective_cref() {
        if let Some(v) = vm.heap.class(owner).info.constants.get(&name) {
            return v.as_obj();
        }
        return None;
    }
    vm.constants.get(&name).and_then(|v| v.as_obj())
}

fn define_class(
    vm: &mut Vm,
    insn: &Instruction,
    superclass: Option<ObjRef>,
    is_module: bool,
) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;

    if let Some(existing) = existing_definition(vm, name) {
        let kind = vm.heap.kind(existing);
        let matches = if is_module {
            kind == ObjKind::Module
        } else {
            kind == ObjKind::Class
        };
        if !matches {
            let cname = vm.heap.string(name).as_str_lossy().into_owned();
            return Err(vm.type_error(&format!("'{cname}' is already defined as a different kind")));
        }
        vm.push(Value::Obj(existing));
        return Ok(());
    }

    let superclass = if is_module {
        None
    } else {
        superclass.or(vm.core.object)
    };
    let klass = vm.new_class(Some(name), superclass, is_module);
    let under = vm.effective_cref();
    vm.heap.class_mut(klass).info.under = under;

    match under {
        Some(owner) => {
            vm.heap
                .class_mut(owner)
                .info
                .constants
                .insert(name, Value::Obj(klass));
            vm.heap.obj_write(owner, Value::Obj(klass));
        }
        None => {
            vm.constants.insert(name, Value::Obj(klass));
            vm.globals.insert(name, Value::Obj(klass));
        }
    }
    vm.push(Value::Obj(klass));
    Ok(())
}

fn op_subclass(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let superclass = vm.pop()?;
    let Some(superclass) = superclass
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Class)
    else {
        let tname = vm.type_name(&superclass);
        return Err(vm.type_error(&format!("superclass must be a class, got {tname}")));
    };
    define_class(vm, insn, Some(superclass), false)
}

fn op_in(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let target = vm.peek(0)?;
    let Some(r) = target
        .as_obj()
        .filter(|r| matches!(vm.heap.kind(*r), ObjKind::Class | ObjKind::Module))
    else {
        let tname = vm.type_name(&target);
        return Err(vm.type_error(&format!("cannot open a body on {tname}")));
    };
    vm.frame_mut().cref_stack.push(r);
    Ok(())
}

fn op_pop_cref(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    if vm.frame_mut().cref_stack.pop().is_none() {
        return Err(crate::error::VmError::invalid_operation_msg("POP_CREF without IN").into());
    }
    Ok(())
}
