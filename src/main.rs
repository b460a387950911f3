use std::env;
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use rlox::prelude::*;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    match args.as_slice() {
        [_] => repl(),
        [_, path] => run_file(path),
        [program, ..] => {
            eprintln!("Usage: {program} [path]");
            ExitCode::from(64)
        }
    }
}

/// Runs an interactive prompt, one line at a time, sharing a single [VM] (and thus a single set of
/// global variables) across lines.
fn repl() -> ExitCode {
    let mut vm = VM::new();
    let stdin = io::stdin();

    loop {
        print!("> ");
        io::stdout().flush().expect("could not flush stdout");

        let mut line = String::new();
        let bytes_read = stdin.read_line(&mut line).expect("could not read stdin");
        if bytes_read == 0 {
            // EOF (Ctrl-D)
            println!();
            return ExitCode::SUCCESS;
        }

        // Errors are already reported to stderr by the VM; a REPL just keeps going.
        let _ = vm.interpret(&line);
    }
}

/// Reads an entire file as Lox source and interprets it.
///
/// Exit codes follow the conventions from Crafting Interpreters: 65 for a compile-time error, 70
/// for a runtime error.
fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read file \"{path}\": {error}");
            return ExitCode::from(74);
        }
    };

    let mut vm = VM::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretationError::CompileError) => ExitCode::from(65),
        Err(InterpretationError::RuntimeError) => ExitCode::from(70),
    }
}
