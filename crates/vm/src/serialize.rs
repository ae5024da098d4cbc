//! The on-disk bytecode format.
//!
//! Stream order: `i32` code length, the code bytes, one `i32` line per
//! code byte, then the constant pool. Each constant is an `i32`
//! payload size and a tag byte: `n` nil, `t` true, `f` false, `d`
//! double (8 bytes), `s` string (payload bytes, NUL-terminated), `c`
//! function (`i32` arity, NUL-terminated name, then a nested chunk).
//! The top-level pool ends at EOF. A nested pool ends at a `-1`
//! payload-size sentinel, which the top level also accepts; without it
//! a parent's trailing constants would be swallowed into the nested
//! pool.
//!
//! All integers are little-endian. Catch tables are not part of the
//! stream.

use crate::chunk::Chunk;
use crate::error::{HostResult, VmError};
use crate::object::{FunctionKind, FunctionObj, ObjKind};
use crate::value::Value;
use crate::vm::Vm;
use lox_io::{BinaryWriter, IoError, MemoryReader};

const TAG_NIL: u8 = b'n';
const TAG_TRUE: u8 = b't';
const TAG_FALSE: u8 = b'f';
const TAG_DOUBLE: u8 = b'd';
const TAG_STRING: u8 = b's';
const TAG_FUNCTION: u8 = b'c';

/// Serializes a chunk to bytes.
pub fn serialize_chunk(vm: &Vm, chunk: &Chunk) -> HostResult<Vec<u8>> {
    let mut writer = BinaryWriter::with_capacity(chunk.len() * 5);
    write_chunk(vm, chunk, &mut writer, true)?;
    Ok(writer.into_bytes())
}

fn write_chunk(vm: &Vm, chunk: &Chunk, writer: &mut BinaryWriter, top: bool) -> HostResult<()> {
    writer.write_i32(chunk.len() as i32)?;
    writer.write_bytes(&chunk.code)?;
    for &line in &chunk.lines {
        writer.write_i32(line)?;
    }
    for constant in &chunk.constants {
        write_constant(vm, constant, writer)?;
    }
    if !top {
        writer.write_i32(-1)?;
    }
    Ok(())
}

fn write_constant(vm: &Vm, constant: &Value, writer: &mut BinaryWriter) -> HostResult<()> {
    match constant {
        Value::Nil => {
            writer.write_i32(0)?;
            writer.write_byte(TAG_NIL)?;
        }
        Value::Bool(true) => {
            writer.write_i32(0)?;
            writer.write_byte(TAG_TRUE)?;
        }
        Value::Bool(false) => {
            writer.write_i32(0)?;
            writer.write_byte(TAG_FALSE)?;
        }
        Value::Number(n) => {
            writer.write_i32(8)?;
            writer.write_byte(TAG_DOUBLE)?;
            writer.write_f64(*n)?;
        }
        Value::Obj(r) => match vm.heap.kind(*r) {
            ObjKind::String => {
                let bytes = &vm.heap.string(*r).bytes;
                writer.write_i32(bytes.len() as i32 + 1)?;
                writer.write_byte(TAG_STRING)?;
                writer.write_bytes(bytes)?;
                writer.write_byte(0)?;
            }
            ObjKind::Function => {
                let function = vm.heap.function(*r);
                let name: &[u8] = match function.name {
                    Some(n) => &vm.heap.string(n).bytes,
                    None => b"",
                };
                writer.write_i32(name.len() as i32 + 1)?;
                writer.write_byte(TAG_FUNCTION)?;
                writer.write_i32(function.arity as i32)?;
                writer.write_bytes(name)?;
                writer.write_byte(0)?;
                write_chunk(vm, &function.chunk, writer, false)?;
            }
            kind => {
                return Err(VmError::parse(format!(
                    "constant kind {} is not serializable",
                    kind.name()
                )))
            }
        },
        Value::Undef => return Err(VmError::parse("undef constant is not serializable")),
    }
    Ok(())
}

/// Loads a chunk from bytes, allocating string and function constants
/// in the VM's heap.
pub fn load_chunk(vm: &mut Vm, bytes: &[u8]) -> HostResult<Chunk> {
    let mut reader = MemoryReader::new(bytes);
    let chunk = read_chunk(vm, &mut reader, true)?;
    Ok(chunk)
}

fn read_chunk(vm: &mut Vm, reader: &mut MemoryReader, top: bool) -> HostResult<Chunk> {
    let count = reader.read_i32()?;
    if count < 0 {
        return Err(VmError::parse("negative code length"));
    }
    let count = count as usize;
    let mut chunk = Chunk::new();
    chunk.code = reader.read_bytes(count)?;
    chunk.lines = Vec::with_capacity(count);
    for _ in 0..count {
        chunk.lines.push(reader.read_i32()?);
    }

    loop {
        // The top-level pool leans on EOF at a constant boundary.
        if top && reader.at_end() {
            break;
        }
        let payload_size = match reader.read_i32() {
            Ok(n) => n,
            Err(IoError::EndOfStream { .. }) if top => break,
            Err(e) => return Err(e.into()),
        };
        if payload_size < 0 {
            break;
        }
        let tag = reader.read_byte()?;
        let constant = read_constant(vm, reader, tag, payload_size as usize)?;
        chunk.constants.push(constant);
    }
    Ok(chunk)
}

fn read_constant(
    vm: &mut Vm,
    reader: &mut MemoryReader,
    tag: u8,
    payload_size: usize,
) -> HostResult<Value> {
    match tag {
        TAG_NIL => Ok(Value::Nil),
        TAG_TRUE => Ok(Value::TRUE),
        TAG_FALSE => Ok(Value::FALSE),
        TAG_DOUBLE => Ok(Value::Number(reader.read_f64()?)),
        TAG_STRING => {
            if payload_size == 0 {
                return Err(VmError::parse("string constant missing terminator"));
            }
            let mut bytes = reader.read_bytes(payload_size)?;
            if bytes.pop() != Some(0) {
                return Err(VmError::parse("string constant not NUL-terminated"));
            }
            Ok(Value::Obj(vm.intern_bytes(&bytes)))
        }
        TAG_FUNCTION => {
            if payload_size == 0 {
                return Err(VmError::parse("function constant missing name"));
            }
            let arity = reader.read_i32()?;
            let mut name = reader.read_bytes(payload_size)?;
            if name.pop() != Some(0) {
                return Err(VmError::parse("function name not NUL-terminated"));
            }
            let nested = read_chunk(vm, reader, false)?;
            let mut function = FunctionObj::new(nested, FunctionKind::Named);
            if !name.is_empty() {
                function.name = Some(vm.intern_bytes(&name));
            }
            function.arity = u16::try_from(arity.max(0))
                .map_err(|_| VmError::parse("function arity out of range"))?;
            Ok(Value::Obj(vm.alloc_function(function)))
        }
        other => Err(VmError::parse(format!(
            "unknown constant tag {:#04x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChunkBuilder;
    use crate::op_code::OpCode;

    #[test]
    fn test_round_trip_scalars() {
        let mut vm = Vm::new();
        let mut b = ChunkBuilder::new();
        b.number(4.25).unwrap();
        let idx = b.constant(Value::Nil).unwrap();
        b.op_byte(OpCode::Constant, idx);
        let idx = b.constant(Value::TRUE).unwrap();
        b.op_byte(OpCode::Constant, idx);
        b.string(&mut vm, "greeting", true).unwrap();
        b.op(OpCode::Return);
        let chunk = b.finish();

        let bytes = serialize_chunk(&vm, &chunk).unwrap();
        let loaded = load_chunk(&mut vm, &bytes).unwrap();

        assert_eq!(loaded.code, chunk.code);
        assert_eq!(loaded.lines, chunk.lines);
        assert_eq!(loaded.constants.len(), chunk.constants.len());
        assert_eq!(loaded.constants[0], Value::Number(4.25));
        assert_eq!(loaded.constants[1], Value::Nil);
        assert_eq!(loaded.constants[2], Value::TRUE);
        // Interned strings reload to the identical object.
        assert_eq!(loaded.constants[3], chunk.constants[3]);
    }

    #[test]
    fn test_round_trip_nested_function() {
        let mut vm = Vm::new();

        let mut inner = ChunkBuilder::new();
        inner.number(42.0).unwrap();
        inner.op(OpCode::Return);
        let mut function = FunctionObj::new(inner.finish(), FunctionKind::Named);
        function.name = Some(vm.intern("answer"));
        function.arity = 2;
        let function = vm.alloc_function(function);

        let mut outer = ChunkBuilder::new();
        let fidx = outer.constant(Value::Obj(function)).unwrap();
        outer.op_byte(OpCode::Closure, fidx);
        // A trailing constant after the function exercises the nested
        // pool terminator.
        outer.number(7.0).unwrap();
        outer.op(OpCode::Return);
        let chunk = outer.finish();

        let bytes = serialize_chunk(&vm, &chunk).unwrap();
        let loaded = load_chunk(&mut vm, &bytes).unwrap();

        assert_eq!(loaded.constants.len(), 2);
        let reloaded = loaded.constants[0].as_obj().unwrap();
        let f = vm.heap.function(reloaded);
        assert_eq!(f.arity, 2);
        assert_eq!(f.chunk.code.len(), 3);
        assert_eq!(vm.heap.string(f.name.unwrap()).bytes, b"answer");
        assert_eq!(loaded.constants[1], Value::Number(7.0));
    }

    #[test]
    fn test_executes_identically_after_round_trip() {
        let mut vm = Vm::new();
        let mut b = ChunkBuilder::new();
        b.number(20.0).unwrap();
        b.number(22.0).unwrap();
        b.op(OpCode::Add);
        b.op(OpCode::Return);
        let chunk = b.finish();

        let bytes = serialize_chunk(&vm, &chunk).unwrap();
        let direct = vm.interpret_chunk(chunk).unwrap();

        let loaded = load_chunk(&mut vm, &bytes).unwrap();
        let reloaded = vm.interpret_chunk(loaded).unwrap();
        assert_eq!(direct, reloaded);
        assert_eq!(direct, Value::Number(42.0));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let mut vm = Vm::new();
        let mut b = ChunkBuilder::new();
        b.number(1.0).unwrap();
        b.op(OpCode::Return);
        let bytes = serialize_chunk(&vm, &b.finish()).unwrap();

        // Cut into the middle of the double payload.
        let cut = &bytes[..bytes.len() - 3];
        assert!(load_chunk(&mut vm, cut).is_err());
    }
}
