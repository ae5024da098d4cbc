//! Chunk disassembler.

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::instruction::Instruction;
use crate::object::{InternalData, ObjKind};
use crate::op_code::OpCode;
use crate::value::Value;
use std::fmt::Write as _;

/// Renders a one-line description of a constant for listings.
fn describe_constant(heap: &Heap, value: Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format!("{n}"),
        Value::Undef => "<undef>".to_string(),
        Value::Obj(r) => match heap.kind(r) {
            ObjKind::String => format!("\"{}\"", heap.string(r).as_str_lossy()),
            ObjKind::Function => {
                let f = heap.function(r);
                match f.name {
                    Some(n) => format!("<fun {}>", heap.string(n).as_str_lossy()),
                    None => "<fun (anon)>".to_string(),
                }
            }
            ObjKind::Array => format!("<array len={}>", heap.array(r).len()),
            ObjKind::Map => format!("<map len={}>", heap.map(r).len()),
            ObjKind::Internal => match &heap.internal(r).data {
                InternalData::CallInfo(ci) => format!(
                    "<callinfo argc={} kwargs={} splat={}>",
                    ci.argc, ci.num_kwargs, ci.uses_splat as u8
                ),
                _ => "<internal>".to_string(),
            },
            kind => format!("<{}>", kind.name()),
        },
    }
}

/// Disassembles a whole chunk, nested function constants included.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let mut pending: Vec<crate::object::ObjRef> = Vec::new();
    let _ = writeln!(out, "== {name} ==");
    disassemble_into(heap, chunk, &mut out, &mut pending);

    // Nested functions print after their parent, like the original
    // listing tool.
    let mut printed = 0;
    while printed < pending.len() {
        let fref = pending[printed];
        printed += 1;
        let f = heap.function(fref);
        let fname = match f.name {
            Some(n) => heap.string(n).as_str_lossy().into_owned(),
            None => "(anon)".to_string(),
        };
        let _ = writeln!(out, "== {fname} ==");
        disassemble_into(heap, &f.chunk, &mut out, &mut pending);
    }
    out
}

fn disassemble_into(
    heap: &Heap,
    chunk: &Chunk,
    out: &mut String,
    pending: &mut Vec<crate::object::ObjRef>,
) {
    let mut offset = 0;
    while offset < chunk.len() {
        match disassemble_instruction(heap, chunk, offset, out, pending) {
            Ok(next) => offset = next,
            Err(err) => {
                let _ = writeln!(out, "{offset:04} <error: {err}>");
                return;
            }
        }
    }
    for (i, row) in chunk.catch_tables.iter().enumerate() {
        let what = match &row.kind {
            crate::chunk::CatchKind::Class { name, .. } => {
                format!("catch {}", heap.string(*name).as_str_lossy())
            }
            crate::chunk::CatchKind::Ensure => "ensure".to_string(),
        };
        let _ = writeln!(
            out,
            "-- catch[{i}] [{:04}, {:04}) -> {:04} {what}",
            row.from, row.to, row.target
        );
    }
}

/// Disassembles one instruction, returning the next offset.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
    pending: &mut Vec<crate::object::ObjRef>,
) -> Result<usize, crate::error::VmError> {
    let insn = Instruction::parse(chunk, heap, offset)?;
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line_at(offset));
    }

    let name = insn.opcode.name();
    match insn.opcode {
        OpCode::Constant
        | OpCode::DupArray
        | OpCode::DupMap
        | OpCode::Regex
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::DefineGlobal
        | OpCode::GetConst
        | OpCode::SetConst
        | OpCode::GetConstUnder
        | OpCode::GetSuper
        | OpCode::Method
        | OpCode::ClassMethod
        | OpCode::Getter
        | OpCode::Setter
        | OpCode::PropGet
        | OpCode::PropSet
        | OpCode::Class
        | OpCode::Module
        | OpCode::Subclass
        | OpCode::GetThrown
        | OpCode::RethrowIfErr => {
            let idx = insn.byte(0) as usize;
            let value = chunk.constant(idx)?;
            let _ = writeln!(out, "{name:<20} {idx:4} '{}'", describe_constant(heap, value));
        }
        OpCode::String => {
            let idx = insn.byte(0) as usize;
            let value = chunk.constant(idx)?;
            let _ = writeln!(
                out,
                "{name:<20} {idx:4} '{}' (static={})",
                describe_constant(heap, value),
                insn.byte(1)
            );
        }
        OpCode::Array | OpCode::Map | OpCode::PopN => {
            let _ = writeln!(out, "{name:<20} n={}", insn.byte(0));
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue => {
            let slot = insn.byte(0);
            let value = chunk.constant(insn.byte(1) as usize)?;
            let _ = writeln!(
                out,
                "{name:<20} {} [slot {slot}]",
                describe_constant(heap, value)
            );
        }
        OpCode::UnpackSetLocal => {
            let value = chunk.constant(insn.byte(2) as usize)?;
            let _ = writeln!(
                out,
                "{name:<20} {} [slot {}] idx={}",
                describe_constant(heap, value),
                insn.byte(0),
                insn.byte(1)
            );
        }
        OpCode::UnpackDefineGlobal => {
            let value = chunk.constant(insn.byte(0) as usize)?;
            let _ = writeln!(
                out,
                "{name:<20} {} idx={}",
                describe_constant(heap, value),
                insn.byte(1)
            );
        }
        OpCode::Closure => {
            let idx = insn.byte(0) as usize;
            let value = chunk.constant(idx)?;
            let upvalues = (insn.operand.len() - 1) / 2;
            let _ = writeln!(
                out,
                "{name:<20} {idx:4} '{}' (upvals: {upvalues})",
                describe_constant(heap, value)
            );
            if let Some(r) = value.as_obj() {
                pending.push(r);
            }
        }
        OpCode::Jump
        | OpCode::JumpIfFalse
        | OpCode::JumpIfTrue
        | OpCode::JumpIfFalsePeek
        | OpCode::JumpIfTruePeek => {
            let delta = insn.byte(0) as usize;
            let _ = writeln!(out, "{name:<20} {delta:4} (addr={:04})", offset + 2 + delta);
        }
        OpCode::Loop => {
            let delta = insn.byte(0) as usize;
            let _ = writeln!(out, "{name:<20} {delta:4} (addr={:04})", offset + 2 - delta);
        }
        OpCode::Call => {
            let _ = writeln!(out, "{name:<20} (argc={})", insn.byte(0));
        }
        OpCode::Invoke => {
            let method = chunk.constant(insn.byte(0) as usize)?;
            let _ = writeln!(
                out,
                "{name:<20} ({}, argc={})",
                describe_constant(heap, method),
                insn.byte(1)
            );
        }
        OpCode::CheckKeyword => {
            let _ = writeln!(out, "{name:<20} kwslot={} mapslot={}", insn.byte(0), insn.byte(1));
        }
        _ => {
            let _ = writeln!(out, "{name}");
        }
    }
    Ok(offset + insn.size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChunkBuilder;

    #[test]
    fn test_disassemble_simple_chunk() {
        let heap = Heap::new();
        let mut b = ChunkBuilder::new();
        b.number(1.0).unwrap();
        b.number(2.0).unwrap();
        b.op(OpCode::Add).op(OpCode::Print).op(OpCode::Leave);
        let chunk = b.finish();

        let listing = disassemble_chunk(&heap, &chunk, "main");
        assert!(listing.contains("== main =="));
        assert!(listing.contains("CONSTANT"));
        assert!(listing.contains("ADD"));
        assert!(listing.contains("PRINT"));
        assert!(listing.contains("'2'"));
    }
}
