//! Control-flow instructions.

use super::JumpTable;
use crate::error::{Unwind, VmResult};
use crate::instruction::Instruction;
use crate::object::FunctionKind;
use crate::op_code::OpCode;
use crate::vm::Vm;

pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::Jump, op_jump);
    table.register(OpCode::JumpIfFalse, |vm, insn| jump_if(vm, insn, false, true));
    table.register(OpCode::JumpIfTrue, |vm, insn| jump_if(vm, insn, true, true));
    table.register(OpCode::JumpIfFalsePeek, |vm, insn| jump_if(vm, insn, false, false));
    table.register(OpCode::JumpIfTruePeek, |vm, insn| jump_if(vm, insn, true, false));
    table.register(OpCode::Loop, op_loop);
    table.register(OpCode::Return, op_return);
    table.register(OpCode::Leave, op_leave);
    table.register(OpCode::Print, op_print);
    table.register(OpCode::Pop, |vm, _| {
        vm.pop()?;
        Ok(())
    });
    table.register(OpCode::PopN, |vm, insn| vm.pop_n(insn.byte(0) as usize));
}

fn op_jump(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    // ip already points past the operand; offsets are relative to it.
    let offset = insn.byte(0) as usize;
    vm.frame_mut().ip += offset;
    Ok(())
}

fn jump_if(vm: &mut Vm, insn: &Instruction, when: bool, pops: bool) -> VmResult<()> {
    let condition = if pops { vm.pop()? } else { vm.peek(0)? };
    if condition.truthy() == when {
        let offset = insn.byte(0) as usize;
        vm.frame_mut().ip += offset;
    }
    Ok(())
}

fn op_loop(vm: &mut Vm, insn: &Instruction) -> VmResult<()> {
    // Backward delta counted from past the operand, so it includes the
    // operand bytes themselves.
    let offset = insn.byte(0) as usize;
    let frame = vm.frame_mut();
    frame.ip = frame
        .ip
        .checked_sub(offset)
        .ok_or_else(|| crate::error::VmError::parse("LOOP target before chunk start"))?;
    Ok(())
}

fn op_return(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let mut result = vm.pop()?;
    // Constructors return the instance regardless of the body's value.
    let function = vm.frame_function();
    if vm.heap.function(function).kind == FunctionKind::Init {
        result = vm.frame().this.unwrap_or(result);
    }
    vm.do_return(result);
    Ok(())
}

fn op_leave(_vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    Err(Unwind::Exit(0))
}

fn op_print(vm: &mut Vm, _insn: &Instruction) -> VmResult<()> {
    let value = vm.pop()?;
    let rendered = vm.display_value(&value);
    vm.print_line(&rendered);
    Ok(())
}
