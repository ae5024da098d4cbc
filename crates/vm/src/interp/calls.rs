//! Call, method-definition, and property instructions.

use super::JumpTable;
use crate::error::VmResult;
use crate::instruction::Instruction;
use crate::object::{InternalData, ObjKind};
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Call, op_call);
    table.register(OpCode::Invoke, op_invoke);
    table.register(OpCode::Closure, op_closure);
    table.register(OpCode::SplatArray, op_splat_array);
    table.register(OpCode::GetThis, op_get_this);
    table.register(OpCode::GetSuper, op_get_super);
    table.register(OpCode::Method, |vm, insn| define_method(vm, insn, MethodTable::Methods));
    table.register(OpCode::ClassMethod, op_class_method);
    table.register(OpCode::Getter, |vm, insn| define_method(vm, insn, MethodTable::Getters));
    table.register(OpCode::Setter, |vm, insn| define_method(vm, insn, MethodTable::Setters));
    table.register(OpCode::PropGet, op_prop_get);
    table.register(OpCode::PropSet, op_prop_set);
    table.register(OpCode::CheckKeyword, op_check_keyword);
    table.register(OpCode::ToBlock, op_to_block);
}

/// Reads the CallInfo constant referenced by a CALL/INVOKE immediate.
fn call_info_constant(
    vm: &Vm,
    index: usize,
) -> VmResult<crate::object::CallInfo> {
    let constant = vm.frame_constant(index)?;
    let Some(r) = constant
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Internal)
    else {
        return Err(crate::error::VmError::parse("CALL without CallInfo constant").into());
    };
    match vm.heap.internal(r).call_info() {
        Some(ci) => Ok(ci.clone()),
        None => Err(crate::error::VmError::parse("CALL constant is not a CallInfo").into()),
    }
}

fn op_call(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let argc = insn.byte(0) as usize;
    let info = call_info_constant(vm, insn.byte(1) as usize)?;
    vm.call_value(argc, Some(&info), None)
}

fn op_invoke(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let argc = insn.byte(1) as usize;
    let info = call_info_constant(vm, insn.byte(2) as usize)?;
    vm.invoke_method(name, argc, Some(&info))
}

fn op_closure(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let constant = vm.frame_constant(insn.byte(0) as usize)?;
    let Some(function) = constant
        .as_obj()
        .filter(|r| vm.heap.kind(*r) == ObjKind::Function)
    else {
        return Err(crate::error::VmError::parse("CLOSURE constant is not a function").into());
    };
    // The operand's upvalue descriptor bytes mirror the function's
    // declared upvalues; the authoritative copy lives on the function.
    let closure = vm.make_closure_over_current_frame(function)?;
    vm.push(Value::Obj(closure));
    Ok(())
}

fn op_splat_array(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let top = vm.peek(0)?;
    let ok = top
        .as_obj()
        .map(|r| vm.heap.kind(r) == ObjKind::Array)
        .unwrap_or(false);
    if !ok {
        let name = vm.type_name(&top);
        return Err(vm.type_error(&format!("splat expects an Array, got {name}")));
    }
    Ok(())
}

fn op_get_this(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let this = vm.frame().this.unwrap_or(Value::Nil);
    vm.push(this);
    Ok(())
}

fn op_get_super(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    // The walk starts above the lexically enclosing class of the
    // current method, not the receiver's class.
    let function = vm.frame_function();
    let Some(home) = vm.heap.function(function).klass else {
        return Err(vm.name_error("'super' outside of a method"));
    };
    let Some(superclass) = vm.heap.class(home).info.superclass else {
        let cname = vm.class_name(home);
        return Err(vm.name_error(&format!("{cname} has no superclass")));
    };
    let Some(method) = vm.find_method(superclass, name) else {
        let mname = vm.heap.string(name).as_str_lossy().into_owned();
        return Err(vm.name_error(&format!("undefined super method '{mname}'")));
    };
    let receiver = vm.frame().this.unwrap_or(Value::Nil);
    let callable = method.as_obj().expect("methods are callables");
    let bound = vm.new_bound_method(receiver, callable);
    vm.push(Value::Obj(bound));
    Ok(())
}

enum MethodTable {
    Methods,
    Getters,
    Setters,
}

/// METHOD/GETTER/SETTER: the closure sits on top, the open class below
/// it; the class stays for further definitions.
fn define_method(vm: &mut Vm, insn: &Instruction, which: MethodTable) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let callable = vm.pop()?;
    let owner = vm.peek(0)?;
    let Some(owner) = owner
        .as_obj()
        .filter(|r| matches!(vm.heap.kind(*r), ObjKind::Class | ObjKind::Module))
    else {
        return Err(vm.type_error("method definition outside a class body"));
    };
    let Some(callable_ref) = callable.as_obj() else {
        return Err(vm.type_error("method body must be callable"));
    };
    // Methods remember their class for super and constant lookup.
    if vm.heap.kind(callable_ref) == ObjKind::Closure {
        let function = vm.heap.closure(callable_ref).function;
        vm.heap.function_mut(function).klass = Some(owner);
    }
    let info = &mut vm.heap.class_mut(owner).info;
    let table = match which {
        MethodTable::Methods => &mut info.methods,
        MethodTable::Getters => &mut info.getters,
        MethodTable::Setters => &mut info.setters,
    };
    table.insert(name, callable);
    vm.heap.obj_write(owner, callable);
    Ok(())
}

fn op_class_method(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    // The closure stays stack-rooted while the singleton class is
    // created lazily.
    let callable = vm.peek(0)?;
    let owner = vm.peek(1)?;
    let Some(owner) = owner
        .as_obj()
        .filter(|r| matches!(vm.heap.kind(*r), ObjKind::Class | ObjKind::Module))
    else {
        return Err(vm.type_error("method definition outside a class body"));
    };
    let singleton = vm.singleton_class_of(owner)?;
    if let Some(callable_ref) = callable.as_obj() {
        if vm.heap.kind(callable_ref) == ObjKind::Closure {
            let function = vm.heap.closure(callable_ref).function;
            vm.heap.function_mut(function).klass = Some(singleton);
        }
    }
    vm.heap
        .class_mut(singleton)
        .info
        .methods
        .insert(name, callable);
    vm.heap.obj_write(singleton, callable);
    vm.pop()?;
    Ok(())
}

fn op_prop_get(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let receiver = vm.peek(0)?;
    let Some(r) = receiver.as_obj() else {
        let tname = vm.type_name(&receiver);
        let pname = vm.heap.string(name).as_str_lossy().into_owned();
        return Err(vm.type_error(&format!("cannot read property '{pname}' of {tname}")));
    };

    // A getter wins over a plain field.
    if let Some(start) = vm.dispatch_class(&receiver) {
        if let Some(getter) = vm.find_getter(start, name) {
            vm.pop()?;
            let callable = getter.as_obj().expect("getters are callables");
            let result = vm.call_callable_sync(callable, receiver, Some(receiver), &[])?;
            vm.push(result);
            return Ok(());
        }
    }

    let value = vm
        .heap
        .instance_core(r)
        .and_then(|core| core.fields.get(&name).copied())
        .unwrap_or(Value::Nil);
    vm.pop()?;
    vm.push(value);
    Ok(())
}

fn op_prop_set(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let name = vm.frame_string_constant(insn.byte(0) as usize)?;
    let value = vm.pop()?;
    let receiver = vm.pop()?;
    let Some(r) = receiver.as_obj() else {
        let tname = vm.type_name(&receiver);
        let pname = vm.heap.string(name).as_str_lossy().into_owned();
        return Err(vm.type_error(&format!("cannot set property '{pname}' of {tname}")));
    };
    if vm.heap.header(r).is_frozen() {
        return Err(vm.frozen_error(&receiver));
    }

    // A setter wins over a plain field.
    if let Some(start) = vm.dispatch_class(&receiver) {
        if let Some(setter) = vm.find_setter(start, name) {
            let callable = setter.as_obj().expect("setters are callables");
            let result =
                vm.call_callable_sync(callable, receiver, Some(receiver), &[value])?;
            vm.push(result);
            return Ok(());
        }
    }

    match vm.heap.instance_core_mut(r) {
        Some(core) => {
            core.fields.insert(name, value);
            vm.heap.obj_write(r, value);
            // Assignment evaluates to the assigned value.
            vm.push(value);
            Ok(())
        }
        None => {
            let tname = vm.type_name(&receiver);
            Err(vm.type_error(&format!("{tname} cannot hold properties")))
        }
    }
}

fn op_check_keyword(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    let kwslot = insn.byte(0) as usize;
    let mapslot = insn.byte(1) as usize;
    let base = vm.frame().base;
    let function = vm.frame_function();
    let Some(&kwname) = vm.heap.function(function).kwarg_names.get(kwslot) else {
        return Err(crate::error::VmError::parse("CHECK_KEYWORD slot out of range").into());
    };
    let map = vm.stack_at(base + mapslot);
    let supplied = match map.as_obj() {
        Some(m) if vm.heap.kind(m) == ObjKind::Map => vm
            .heap
            .map(m)
            .table
            .get(&vm.heap, &Value::Obj(kwname))
            .is_some(),
        _ => false,
    };
    vm.push(Value::Bool(supplied));
    Ok(())
}

fn op_to_block(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    // The closure stays stack-rooted until the Block wraps it.
    let callable = vm.peek(0)?;
    let Some(r) = callable.as_obj().filter(|r| {
        matches!(vm.heap.kind(*r), ObjKind::Closure | ObjKind::Native)
    }) else {
        let tname = vm.type_name(&callable);
        return Err(vm.type_error(&format!("cannot convert {tname} to a block")));
    };
    let block_class = vm.core.block.expect("Block class bootstrapped");
    let instance = vm.new_instance(block_class);
    vm.push(Value::Obj(instance));
    let internal = vm.new_internal(InternalData::Block { callable: r });
    vm.heap.instance_mut(instance).internal = Some(internal);
    vm.heap.obj_write(instance, Value::Obj(internal));
    vm.pop()?; // instance anchor
    vm.pop()?; // the closure
    vm.push(Value::Obj(instance));
    Ok(())
}
