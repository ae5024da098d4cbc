//! # Lox I/O
//!
//! Binary stream primitives shared by the Lox bytecode serializer and the
//! command-line tools: a bounds-checked [`MemoryReader`], an appending
//! [`BinaryWriter`], and the [`IoError`] type they report with.
//!
//! All multi-byte integers in the Lox bytecode format are little-endian.

mod binary_writer;
mod error;
mod memory_reader;

pub use binary_writer::BinaryWriter;
pub use error::{IoError, IoResult};
pub use memory_reader::MemoryReader;
