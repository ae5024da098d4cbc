//! Decoded instruction representation and bounds-checked parsing.

use crate::chunk::Chunk;
use crate::error::{HostResult, VmError};
use crate::heap::Heap;
use crate::object::ObjKind;
use crate::op_code::{OpCode, OperandSize};

/// A decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Byte offset of the opcode in its chunk.
    pub pointer: usize,
    pub opcode: OpCode,
    pub operand: Vec<u8>,
}

impl Instruction {
    /// Parses the instruction at `position`. CLOSURE needs the heap to
    /// read the upvalue count off its function constant.
    pub fn parse(chunk: &Chunk, heap: &Heap, position: usize) -> HostResult<Self> {
        let byte = *chunk
            .code
            .get(position)
            .ok_or_else(|| VmError::parse("Position out of bounds"))?;
        let opcode = OpCode::try_from(byte).map_err(VmError::invalid_opcode)?;

        let operand_len = match opcode.operand_size() {
            OperandSize::Fixed(n) => n,
            OperandSize::Closure => {
                let const_idx = *chunk
                    .code
                    .get(position + 1)
                    .ok_or_else(|| VmError::parse("CLOSURE missing function constant byte"))?;
                let constant = chunk.constant(const_idx as usize)?;
                let func = constant
                    .as_obj()
                    .filter(|r| heap.kind(*r) == ObjKind::Function)
                    .ok_or_else(|| {
                        VmError::parse("CLOSURE constant is not a function")
                    })?;
                1 + heap.function(func).upvalue_count() * 2
            }
        };

        let operand_end = position + 1 + operand_len;
        if operand_end > chunk.code.len() {
            return Err(VmError::parse(format!(
                "Operand exceeds chunk bounds for opcode {:?}: {} + {} > {}",
                opcode,
                position + 1,
                operand_len,
                chunk.code.len()
            )));
        }

        Ok(Self {
            pointer: position,
            opcode,
            operand: chunk.code[position + 1..operand_end].to_vec(),
        })
    }

    /// Creates an instruction directly; used by tests.
    pub fn new(opcode: OpCode, operand: &[u8]) -> Self {
        Self {
            pointer: 0,
            opcode,
            operand: operand.to_vec(),
        }
    }

    /// Total encoded size in bytes, opcode included.
    pub fn size(&self) -> usize {
        1 + self.operand.len()
    }

    /// Reads operand byte `i`.
    pub fn byte(&self, i: usize) -> u8 {
        self.operand[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    #[test]
    fn test_parse_fixed_operands() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.add_constant(crate::value::Value::Number(1.0)).unwrap();
        chunk.write(OpCode::Constant as u8, 1);
        chunk.write(0, 1);
        chunk.write(OpCode::Add as u8, 1);

        let insn = Instruction::parse(&chunk, &heap, 0).unwrap();
        assert_eq!(insn.opcode, OpCode::Constant);
        assert_eq!(insn.operand, vec![0]);
        assert_eq!(insn.size(), 2);

        let insn = Instruction::parse(&chunk, &heap, 2).unwrap();
        assert_eq!(insn.opcode, OpCode::Add);
        assert_eq!(insn.size(), 1);
    }

    #[test]
    fn test_parse_rejects_truncated_operand() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Jump as u8, 1);
        assert!(Instruction::parse(&chunk, &heap, 0).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_opcode() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(0xee, 1);
        assert!(matches!(
            Instruction::parse(&chunk, &heap, 0),
            Err(VmError::InvalidOpCode { opcode: 0xee })
        ));
    }
}
