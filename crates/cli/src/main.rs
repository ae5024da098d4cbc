//! Lox CLI: execute and inspect serialized bytecode chunks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lox_vm::{serialize, RunOutcome, Runtime};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "lox", version, about = "Lox bytecode runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a serialized chunk file.
    Run {
        /// Path to the compiled chunk (.lxc).
        file: PathBuf,
    },
    /// Disassemble a serialized chunk file.
    Disasm {
        /// Path to the compiled chunk (.lxc).
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("lox: {err:#}");
            ExitCode::from(74) // EX_IOERR
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let runtime = Runtime::new();
            let chunk = runtime
                .with_vm(|vm| serialize::load_chunk(vm, &bytes))
                .with_context(|| format!("loading chunk from {}", file.display()))?;
            let outcome = runtime.interpret(chunk);
            match &outcome {
                RunOutcome::Value(_) => log::debug!("clean shutdown"),
                RunOutcome::Exit(code) => log::debug!("explicit exit: {code}"),
                // The VM already printed the trace to stderr.
                RunOutcome::Uncaught(value) => log::debug!("uncaught: {value}"),
                RunOutcome::Fault(err) => eprintln!("lox: vm fault: {err}"),
            }
            let code = outcome.exit_code();
            Ok(ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(70)))
        }
        Command::Disasm { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let runtime = Runtime::new();
            let listing = runtime.with_vm(|vm| -> Result<String> {
                let chunk = serialize::load_chunk(vm, &bytes)
                    .with_context(|| format!("loading chunk from {}", file.display()))?;
                Ok(lox_vm::debug::disassemble_chunk(
                    &vm.heap,
                    &chunk,
                    &file.display().to_string(),
                ))
            })?;
            print!("{listing}");
            Ok(ExitCode::SUCCESS)
        }
    }
}
