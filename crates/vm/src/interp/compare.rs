//! Comparison instructions.
//!
//! Ordering is defined for numbers and strings only. EQUAL on
//! instance-like receivers with an `opEquals` method delegates to it.

use super::JumpTable;
use crate::error::VmResult;
use crate::object::ObjKind;
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;
use std::cmp::Ordering;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Equal, |vm, _| {
        let result = equality(vm)?;
        vm.push(Value::Bool(result));
        Ok(())
    });
    table.register(OpCode::NotEqual, |vm, _| {
        let result = equality(vm)?;
        vm.push(Value::Bool(!result));
        Ok(())
    });
    table.register(OpCode::Less, |vm, _| ordered(vm, "<", |o| o == Ordering::Less));
    table.register(OpCode::Greater, |vm, _| {
        ordered(vm, ">", |o| o == Ordering::Greater)
    });
    table.register(OpCode::LessEqual, |vm, _| {
        ordered(vm, "<=", |o| o != Ordering::Greater)
    });
    table.register(OpCode::GreaterEqual, |vm, _| {
        ordered(vm, ">=", |o| o != Ordering::Less)
    });
}

fn equality(vm: &mut Vm) -> VmResult<bool> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;

    // Strings compare by content before any delegation.
    if let (Some(a), Some(b)) = (lhs.as_obj(), rhs.as_obj()) {
        if vm.heap.kind(a) == ObjKind::String && vm.heap.kind(b) == ObjKind::String {
            return Ok(vm.heap.values_equal(&lhs, &rhs));
        }
    }

    if let Some(r) = lhs.as_obj() {
        if vm.heap.header(r).is_instance_like() {
            let name = vm.intern("opEquals");
            if let Some(start) = vm.dispatch_class(&lhs) {
                if vm.find_method(start, name).is_some() {
                    let result = vm.call_method_sync(lhs, name, &[rhs])?;
                    return Ok(result.truthy());
                }
            }
        }
    }
    Ok(vm.heap.values_equal(&lhs, &rhs))
}

fn ordered(vm: &mut Vm, symbol: &str, test: fn(Ordering) -> bool) -> VmResult<()> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;
    let ordering = match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Obj(a), Value::Obj(b))
            if vm.heap.kind(*a) == ObjKind::String && vm.heap.kind(*b) == ObjKind::String =>
        {
            Some(vm.heap.string(*a).bytes.cmp(&vm.heap.string(*b).bytes))
        }
        _ => None,
    };
    match ordering {
        Some(o) => {
            vm.push(Value::Bool(test(o)));
            Ok(())
        }
        None => {
            let (l, r) = (vm.type_name(&lhs), vm.type_name(&rhs));
            Err(vm.type_error(&format!("cannot compare {l} {symbol} {r}")))
        }
    }
}
