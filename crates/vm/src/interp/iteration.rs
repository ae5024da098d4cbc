//! Iteration instructions.

use super::JumpTable;
use crate::error::VmResult;
use crate::instruction::Instruction;
use crate::op_code::OpCode;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Iter, op_iter);
    table.register(OpCode::IterNext, op_iter_next);
}

fn op_iter(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    // The target stays stack-rooted while the iterator allocates.
    let target = vm.peek(0)?;
    let iter = vm.make_iterator(target)?;
    vm.pop()?;
    vm.push(iter);
    Ok(())
}

/// Pushes the next element above the iterator, or undef when the
/// iterator is exhausted; the iterator itself stays on the stack for
/// the enclosing loop.
fn op_iter_next(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let iter = vm.peek(0)?;
    let next = vm.iterator_next(iter)?;
    vm.push(next);
    Ok(())
}
