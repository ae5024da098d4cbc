//! Programmatic chunk construction.
//!
//! The compiler that normally produces chunks is a separate
//! collaborator; `ChunkBuilder` is the embedding-facing way to assemble
//! bytecode directly, and what the test suites drive the VM with.

use crate::chunk::{CatchKind, Chunk};
use crate::error::HostResult;
use crate::object::CallInfo;
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

/// An incremental bytecode assembler.
#[derive(Default)]
pub struct ChunkBuilder {
    chunk: Chunk,
    line: i32,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self {
            chunk: Chunk::new(),
            line: 1,
        }
    }

    /// Sets the source line attributed to subsequently emitted bytes.
    pub fn line(&mut self, line: i32) -> &mut Self {
        self.line = line;
        self
    }

    /// Current code offset; used as a loop or catch target.
    pub fn here(&self) -> usize {
        self.chunk.len()
    }

    /// Emits a bare opcode.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.chunk.write(op as u8, self.line);
        self
    }

    /// Emits an opcode with one immediate byte.
    pub fn op_byte(&mut self, op: OpCode, byte: u8) -> &mut Self {
        self.op(op);
        self.chunk.write(byte, self.line);
        self
    }

    /// Emits an opcode with arbitrary immediate bytes.
    pub fn op_bytes(&mut self, op: OpCode, bytes: &[u8]) -> &mut Self {
        self.op(op);
        for &b in bytes {
            self.chunk.write(b, self.line);
        }
        self
    }

    /// Adds a constant to the pool.
    pub fn constant(&mut self, value: Value) -> HostResult<u8> {
        self.chunk.add_constant(value)
    }

    /// Adds an interned-string constant, pinned old by the interner.
    pub fn string_constant(&mut self, vm: &mut Vm, s: &str) -> HostResult<u8> {
        let interned = vm.intern(s);
        self.constant(Value::Obj(interned))
    }

    /// Emits CONSTANT for a number literal.
    pub fn number(&mut self, n: f64) -> HostResult<&mut Self> {
        let idx = self.constant(Value::Number(n))?;
        Ok(self.op_byte(OpCode::Constant, idx))
    }

    /// Emits STRING for a literal; `static_lit` shares the constant's
    /// buffer copy-on-write instead of copying eagerly.
    pub fn string(&mut self, vm: &mut Vm, s: &str, static_lit: bool) -> HostResult<&mut Self> {
        let idx = self.string_constant(vm, s)?;
        Ok(self.op_bytes(OpCode::String, &[idx, static_lit as u8]))
    }

    /// Emits GET_LOCAL/SET_LOCAL-shaped ops (slot + name constant).
    pub fn local(&mut self, vm: &mut Vm, op: OpCode, slot: u8, name: &str) -> HostResult<&mut Self> {
        let name_idx = self.string_constant(vm, name)?;
        Ok(self.op_bytes(op, &[slot, name_idx]))
    }

    /// Emits a named-constant-operand op (DEFINE_GLOBAL, PROP_GET, ...).
    pub fn named(&mut self, vm: &mut Vm, op: OpCode, name: &str) -> HostResult<&mut Self> {
        let idx = self.string_constant(vm, name)?;
        Ok(self.op_byte(op, idx))
    }

    /// Emits a forward jump with a placeholder offset; returns the
    /// operand position for [`Self::patch_jump`].
    pub fn jump(&mut self, op: OpCode) -> usize {
        self.op(op);
        let pos = self.chunk.len();
        self.chunk.write(0xff, self.line);
        pos
    }

    /// Patches a forward jump to land at the current offset. Offsets
    /// are relative to the byte after the operand.
    pub fn patch_jump(&mut self, operand_pos: usize) -> HostResult<()> {
        let offset = self.chunk.len() - (operand_pos + 1);
        let byte = u8::try_from(offset).map_err(|_| {
            crate::error::VmError::parse(format!("jump too long: {offset} bytes"))
        })?;
        self.chunk.code[operand_pos] = byte;
        Ok(())
    }

    /// Emits a backward LOOP to `target`; the offset counts from the
    /// byte after the operand, so it includes the operand itself.
    pub fn loop_to(&mut self, target: usize) -> HostResult<&mut Self> {
        let offset = self.chunk.len() + 2 - target;
        let byte = u8::try_from(offset).map_err(|_| {
            crate::error::VmError::parse(format!("loop too long: {offset} bytes"))
        })?;
        Ok(self.op_byte(OpCode::Loop, byte))
    }

    /// Adds a CallInfo constant and returns its pool index.
    pub fn call_info(&mut self, vm: &mut Vm, info: CallInfo) -> HostResult<u8> {
        let r = vm.alloc_call_info(info);
        self.constant(Value::Obj(r))
    }

    /// Emits CALL with a plain positional shape.
    pub fn call(&mut self, vm: &mut Vm, argc: u8) -> HostResult<&mut Self> {
        let info = CallInfo {
            argc,
            ..CallInfo::default()
        };
        let ci = self.call_info(vm, info)?;
        Ok(self.op_bytes(OpCode::Call, &[argc, ci]))
    }

    /// Emits CALL with an explicit call shape.
    pub fn call_with(&mut self, vm: &mut Vm, info: CallInfo) -> HostResult<&mut Self> {
        let argc = info.argc;
        let ci = self.call_info(vm, info)?;
        Ok(self.op_bytes(OpCode::Call, &[argc, ci]))
    }

    /// Emits INVOKE of `name` with a plain positional shape.
    pub fn invoke(&mut self, vm: &mut Vm, name: &str, argc: u8) -> HostResult<&mut Self> {
        let info = CallInfo {
            name: Some(vm.intern(name)),
            argc,
            ..CallInfo::default()
        };
        self.invoke_with(vm, name, info)
    }

    /// Emits INVOKE of `name` with an explicit call shape.
    pub fn invoke_with(&mut self, vm: &mut Vm, name: &str, info: CallInfo) -> HostResult<&mut Self> {
        let argc = info.argc;
        let name_idx = self.string_constant(vm, name)?;
        let ci = self.call_info(vm, info)?;
        Ok(self.op_bytes(OpCode::Invoke, &[name_idx, argc, ci]))
    }

    /// Declares a catch handler for `[from, to)` jumping to `target`.
    pub fn catch_class(
        &mut self,
        vm: &mut Vm,
        from: usize,
        to: usize,
        target: usize,
        class_name: &str,
    ) {
        let name = vm.intern(class_name);
        self.chunk.add_catch_row(
            from,
            to,
            target,
            CatchKind::Class {
                name,
                resolved: None,
            },
        );
    }

    /// Declares an ensure region for `[from, to)` jumping to `target`.
    pub fn ensure(&mut self, from: usize, to: usize, target: usize) {
        self.chunk.add_catch_row(from, to, target, CatchKind::Ensure);
    }

    /// Finishes the chunk.
    pub fn finish(self) -> Chunk {
        self.chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_patch_jump() {
        let mut b = ChunkBuilder::new();
        b.op(OpCode::True);
        let jump = b.jump(OpCode::JumpIfFalse);
        b.op(OpCode::Pop).op(OpCode::Nil);
        b.patch_jump(jump).unwrap();
        b.op(OpCode::Return);

        let chunk = b.finish();
        // TRUE, JUMP_IF_FALSE off, POP, NIL, RETURN
        assert_eq!(chunk.code[0], OpCode::True as u8);
        assert_eq!(chunk.code[1], OpCode::JumpIfFalse as u8);
        // offset skips POP and NIL
        assert_eq!(chunk.code[2], 2);
    }

    #[test]
    fn test_loop_offset_includes_operand() {
        let mut b = ChunkBuilder::new();
        let top = b.here();
        b.op(OpCode::Pop);
        b.loop_to(top).unwrap();
        let chunk = b.finish();
        // POP at 0, LOOP at 1, operand at 2; next instruction would be
        // at 3, so the backward delta to offset 0 is 3.
        assert_eq!(chunk.code[2], 3);
    }
}
