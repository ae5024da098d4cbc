//! End-to-end CLI tests: serialize a chunk to disk, run and
//! disassemble it through the built binary.

use lox_vm::builder::ChunkBuilder;
use lox_vm::op_code::OpCode;
use lox_vm::vm::Vm;
use std::process::Command;

fn write_chunk(build: impl FnOnce(&mut Vm, &mut ChunkBuilder)) -> tempfile::NamedTempFile {
    let mut vm = Vm::new();
    let mut b = ChunkBuilder::new();
    build(&mut vm, &mut b);
    let chunk = b.finish();
    let bytes = lox_vm::serialize::serialize_chunk(&vm, &chunk).expect("serializable chunk");
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), bytes).expect("write chunk");
    file
}

#[test]
fn run_prints_and_exits_zero() {
    let file = write_chunk(|vm, b| {
        b.string(vm, "hello from disk", true).unwrap();
        b.op(OpCode::Print);
        b.op(OpCode::Nil).op(OpCode::Return);
    });

    let output = Command::new(env!("CARGO_BIN_EXE_lox"))
        .arg("run")
        .arg(file.path())
        .output()
        .expect("binary runs");
    assert!(output.status.success(), "status: {:?}", output.status);
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello from disk\n");
}

#[test]
fn uncaught_error_exits_seventy() {
    let file = write_chunk(|vm, b| {
        b.string(vm, "boom", false).unwrap();
        b.op(OpCode::Throw);
        b.op(OpCode::Nil).op(OpCode::Return);
    });

    let output = Command::new(env!("CARGO_BIN_EXE_lox"))
        .arg("run")
        .arg(file.path())
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("boom"), "stderr: {stderr}");
}

#[test]
fn disasm_lists_the_chunk() {
    let file = write_chunk(|vm, b| {
        b.number(6.0).unwrap();
        b.number(7.0).unwrap();
        b.op(OpCode::Multiply);
        b.op(OpCode::Print);
        b.op(OpCode::Nil).op(OpCode::Return);
    });

    let output = Command::new(env!("CARGO_BIN_EXE_lox"))
        .arg("disasm")
        .arg(file.path())
        .output()
        .expect("binary runs");
    assert!(output.status.success());
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.contains("CONSTANT"), "listing: {listing}");
    assert!(listing.contains("MULTIPLY"));
    assert!(listing.contains("PRINT"));
}
