//! Bytecode chunks: code bytes, a parallel line table, a constant pool,
//! and the catch table that maps instruction ranges to handlers.

use crate::error::{HostResult, VmError};
use crate::object::ObjRef;
use crate::value::Value;

/// What a catch-table row matches.
#[derive(Debug, Clone)]
pub enum CatchKind {
    /// Matches throwables that are instances of the named class. The
    /// name is an interned string so serialized chunks stay portable;
    /// the resolved class is cached after the first successful match.
    Class {
        name: ObjRef,
        resolved: Option<ObjRef>,
    },
    /// An ensure region: matches any unwind.
    Ensure,
}

/// One catch-table row: `[from, to)` in code bytes, a handler target,
/// and a stash slot for the throwable while the handler runs.
#[derive(Debug, Clone)]
pub struct CatchRow {
    pub from: usize,
    pub to: usize,
    pub target: usize,
    pub kind: CatchKind,
    pub thrown: Option<Value>,
}

/// An immutable unit of bytecode.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// One source line per code byte.
    pub lines: Vec<i32>,
    pub constants: Vec<Value>,
    pub catch_tables: Vec<CatchRow>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one byte of code with its source line.
    pub fn write(&mut self, byte: u8, line: i32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Adds a constant and returns its pool index.
    pub fn add_constant(&mut self, value: Value) -> HostResult<u8> {
        if self.constants.len() > u8::MAX as usize {
            return Err(VmError::ConstantOverflow {
                count: self.constants.len(),
            });
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    /// Retrieves a constant.
    pub fn constant(&self, index: usize) -> HostResult<Value> {
        self.constants
            .get(index)
            .copied()
            .ok_or(VmError::InvalidConstant {
                index,
                size: self.constants.len(),
            })
    }

    /// The source line of the code byte at `offset`.
    pub fn line_at(&self, offset: usize) -> i32 {
        self.lines.get(offset).copied().unwrap_or(-1)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Adds a catch-table row.
    pub fn add_catch_row(&mut self, from: usize, to: usize, target: usize, kind: CatchKind) {
        self.catch_tables.push(CatchRow {
            from,
            to,
            target,
            kind,
            thrown: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_keeps_lines_parallel() {
        let mut chunk = Chunk::new();
        chunk.write(1, 10);
        chunk.write(2, 10);
        chunk.write(3, 11);
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.lines.len(), 3);
        assert_eq!(chunk.line_at(2), 11);
        assert_eq!(chunk.line_at(9), -1);
    }

    #[test]
    fn test_constants() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(4.0)).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(chunk.constant(0).unwrap(), Value::Number(4.0));
        assert!(chunk.constant(1).is_err());
    }

    #[test]
    fn test_constant_pool_overflow() {
        let mut chunk = Chunk::new();
        for i in 0..=255 {
            chunk.add_constant(Value::Number(i as f64)).unwrap();
        }
        assert!(chunk.add_constant(Value::Nil).is_err());
    }
}
