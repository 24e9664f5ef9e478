//! Ember command-line interpreter: run a script file, or start an
//! interactive REPL when none is given.

use clap::Parser;
use ember_vm::{Vm, VmError};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
const EXIT_NO_FILE: u8 = 1;
const EXIT_COMPILE_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

/// A small dynamically-typed, bytecode-interpreted scripting language.
#[derive(Parser)]
#[command(name = "ember", version, about)]
struct Cli {
    /// Script to run. Omit to start the REPL.
    script: Option<PathBuf>,

    /// Print the compiled bytecode (and nested functions) before running.
    #[arg(long = "dump", alias = "disassemble")]
    dump: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("EMBER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut vm = Vm::new();
    vm.set_dump(cli.dump);

    let code = match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => run_repl(&mut vm),
    };
    ExitCode::from(code)
}

fn run_file(vm: &mut Vm, path: &Path) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file '{}': {e}", path.display());
            return EXIT_NO_FILE;
        }
    };
    match vm.interpret(&source) {
        Ok(()) => EXIT_OK,
        Err(VmError::Compile(_)) => EXIT_COMPILE_ERROR,
        Err(VmError::Runtime(_)) => EXIT_RUNTIME_ERROR,
    }
}

fn run_repl(vm: &mut Vm) -> u8 {
    println!("Ember {} -- Ctrl-D to exit", env!("CARGO_PKG_VERSION"));
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Could not start the line editor: {e}");
            return EXIT_NO_FILE;
        }
    };
    loop {
        match editor.readline("ember> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                // Errors are already reported to stderr by the VM; the REPL
                // keeps going so one bad line doesn't end the session.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }
    EXIT_OK
}
