//! # Lox Virtual Machine
//!
//! A bytecode virtual machine and managed object system for a small
//! dynamic, object-oriented language: classes, modules, closures,
//! blocks with non-local control flow, exceptions, OS threads behind a
//! global VM lock, and a generational mark-and-sweep collector.
//!
//! ## Architecture
//!
//! - **Value / object model** — [`value::Value`] is a tagged scalar or
//!   a reference into the arena heap ([`heap::Heap`]); every object
//!   kind lives in [`object`].
//! - **Bytecode** — immutable [`chunk::Chunk`]s of [`op_code::OpCode`]s
//!   with line tables, constant pools, and catch tables, assembled by
//!   [`builder::ChunkBuilder`] and listed by [`debug`].
//! - **Interpreter** — [`vm::Vm`] drives frames and stacks through the
//!   jump table in [`interp`].
//! - **Concurrency** — [`gvl::Runtime`] wraps the VM in the global
//!   lock; guest threads are OS threads that hand the lock off
//!   cooperatively, and [`signal`] queues deliverable signals.
//! - **Persistence** — [`serialize`] reads and writes the on-disk
//!   chunk format.
//!
//! ## Example
//!
//! ```
//! use lox_vm::builder::ChunkBuilder;
//! use lox_vm::op_code::OpCode;
//! use lox_vm::value::Value;
//! use lox_vm::vm::Vm;
//!
//! let mut vm = Vm::new();
//! let mut b = ChunkBuilder::new();
//! b.number(40.0).unwrap();
//! b.number(2.0).unwrap();
//! b.op(OpCode::Add);
//! b.op(OpCode::Return);
//! let result = vm.interpret_chunk(b.finish()).unwrap();
//! assert_eq!(result, Value::Number(42.0));
//! ```

pub mod blocks;
pub mod builder;
pub mod chunk;
pub mod debug;
pub mod error;
pub mod gvl;
pub mod heap;
pub mod instruction;
pub mod interp;
pub mod natives;
pub mod object;
pub mod op_code;
pub mod runtime;
pub mod serialize;
pub mod signal;
pub mod table;
pub mod thread;
pub mod value;
pub mod vm;

pub use builder::ChunkBuilder;
pub use chunk::Chunk;
pub use error::{Unwind, VmError, VmResult};
pub use gvl::{RunOutcome, Runtime};
pub use heap::Heap;
pub use object::ObjRef;
pub use op_code::OpCode;
pub use value::Value;
pub use vm::Vm;
