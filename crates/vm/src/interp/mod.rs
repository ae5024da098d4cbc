//! Jump table: instruction dispatch for the Lox VM.
//!
//! Handlers are registered by category module; the table itself is a
//! 256-entry array of function pointers indexed by opcode byte.

pub mod arithmetic;
pub mod calls;
pub mod classes;
pub mod compare;
pub mod constants;
pub mod control;
pub mod exceptions;
pub mod iteration;
pub mod variables;

use crate::error::VmResult;
use crate::instruction::Instruction;
use crate::op_code::OpCode;
use crate::vm::Vm;
use once_cell::sync::Lazy;

/// A handler for a VM instruction.
pub type OpHandler = fn(&mut Vm, &Instruction) -> VmResult<()>;

/// Dispatch table for all opcodes.
pub struct JumpTable {
    handlers: [Option<OpHandler>; 256],
}

impl JumpTable {
    /// Creates a table with every default handler registered.
    pub fn new() -> Self {
        let mut table = Self {
            handlers: [None; 256],
        };
        constants::register_handlers(&mut table);
        arithmetic::register_handlers(&mut table);
        compare::register_handlers(&mut table);
        variables::register_handlers(&mut table);
        calls::register_handlers(&mut table);
        classes::register_handlers(&mut table);
        control::register_handlers(&mut table);
        iteration::register_handlers(&mut table);
        exceptions::register_handlers(&mut table);
        table
    }

    /// Registers a handler for an opcode.
    pub fn register(&mut self, opcode: OpCode, handler: OpHandler) {
        self.handlers[opcode as usize] = Some(handler);
    }

    /// Gets the handler for an opcode.
    pub fn get(&self, opcode: OpCode) -> Option<OpHandler> {
        self.handlers[opcode as usize]
    }
}

impl Default for JumpTable {
    fn default() -> Self {
        Self::new()
    }
}

static DEFAULT: Lazy<JumpTable> = Lazy::new(JumpTable::new);

/// The process-wide default jump table.
pub fn jump_table() -> &'static JumpTable {
    &DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_opcode_has_a_handler() {
        let table = jump_table();
        for opcode in OpCode::iter() {
            assert!(
                table.get(opcode).is_some(),
                "no handler for {:?}",
                opcode
            );
        }
    }
}
