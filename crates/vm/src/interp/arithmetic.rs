//! Arithmetic and logic instructions.
//!
//! Binary ops are numeric; a non-numeric left operand gets one chance
//! to handle the operator through its method (`opAdd` and friends),
//! otherwise the op raises TypeError.

use super::JumpTable;
use crate::error::VmResult;
use crate::instruction::Instruction;
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Add, |vm, _| binary_op(vm, "+", Some("opAdd"), f64_add));
    table.register(OpCode::Subtract, |vm, _| {
        binary_op(vm, "-", Some("opDiff"), f64_sub)
    });
    table.register(OpCode::Multiply, |vm, _| {
        binary_op(vm, "*", Some("opMul"), f64_mul)
    });
    table.register(OpCode::Divide, |vm, _| binary_op(vm, "/", Some("opDiv"), f64_div));
    table.register(OpCode::Modulo, |vm, _| binary_op(vm, "%", None, f64_mod));
    table.register(OpCode::BitOr, |vm, _| int_op(vm, "|", |a, b| a | b));
    table.register(OpCode::BitAnd, |vm, _| int_op(vm, "&", |a, b| a & b));
    table.register(OpCode::BitXor, |vm, _| int_op(vm, "^", |a, b| a ^ b));
    table.register(OpCode::ShovelL, |vm, _| {
        shift_op(vm, "<<", Some("opShovelLeft"), |a, b| a.wrapping_shl(b))
    });
    table.register(OpCode::ShovelR, |vm, _| {
        shift_op(vm, ">>", Some("opShovelRight"), |a, b| a.wrapping_shr(b))
    });
    table.register(OpCode::Negate, op_negate);
    table.register(OpCode::Not, op_not);
}

fn f64_add(a: f64, b: f64) -> f64 {
    a + b
}
fn f64_sub(a: f64, b: f64) -> f64 {
    a - b
}
fn f64_mul(a: f64, b: f64) -> f64 {
    a * b
}
fn f64_div(a: f64, b: f64) -> f64 {
    a / b
}
fn f64_mod(a: f64, b: f64) -> f64 {
    a % b
}

/// Numeric fast path, then the receiver's operator method.
fn binary_op(
    vm: &mut Vm,
    symbol: &str,
    fallback: Option<&str>,
    op: fn(f64, f64) -> f64,
) -> VmResult<()> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;
    if let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) {
        vm.push(Value::Number(op(*a, *b)));
        return Ok(());
    }
    if let Some(method) = fallback {
        if lhs.is_obj() {
            let name = vm.intern(method);
            if vm
                .dispatch_class(&lhs)
                .and_then(|start| vm.find_method(start, name))
                .is_some()
            {
                let result = vm.call_method_sync(lhs, name, &[rhs])?;
                vm.push(result);
                return Ok(());
            }
        }
    }
    let (l, r) = (vm.type_name(&lhs), vm.type_name(&rhs));
    Err(vm.type_error(&format!("unsupported operands for '{symbol}': {l} and {r}")))
}

/// Bitwise ops truncate to 64-bit integers; numbers only.
fn int_op(vm: &mut Vm, symbol: &str, op: fn(i64, i64) -> i64) -> VmResult<()> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;
    match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => {
            vm.push(Value::Number(op(*a as i64, *b as i64) as f64));
            Ok(())
        }
        _ => {
            let (l, r) = (vm.type_name(&lhs), vm.type_name(&rhs));
            Err(vm.type_error(&format!("unsupported operands for '{symbol}': {l} and {r}")))
        }
    }
}

fn shift_op(
    vm: &mut Vm,
    symbol: &str,
    fallback: Option<&str>,
    op: fn(i64, u32) -> i64,
) -> VmResult<()> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;
    if let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) {
        vm.push(Value::Number(op(*a as i64, *b as u32) as f64));
        return Ok(());
    }
    if let Some(method) = fallback {
        if lhs.is_obj() {
            let name = vm.intern(method);
            if vm
                .dispatch_class(&lhs)
                .and_then(|start| vm.find_method(start, name))
                .is_some()
            {
                let result = vm.call_method_sync(lhs, name, &[rhs])?;
                vm.push(result);
                return Ok(());
            }
        }
    }
    let (l, r) = (vm.type_name(&lhs), vm.type_name(&rhs));
    Err(vm.type_error(&format!("unsupported operands for '{symbol}': {l} and {r}")))
}

fn op_negate(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let v = vm.pop()?;
    match v {
        Value::Number(n) => {
            vm.push(Value::Number(-n));
            Ok(())
        }
        _ => {
            let name = vm.type_name(&v);
            Err(vm.type_error(&format!("cannot negate {name}")))
        }
    }
}

fn op_not(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let v = vm.pop()?;
    vm.push(Value::Bool(!v.truthy()));
    Ok(())
}
