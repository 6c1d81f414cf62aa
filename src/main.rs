use std::process;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use iii::{InterpretResult, Vm};

fn main() {
    // RUST_LOG=iii=trace surfaces GC and dispatch events
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut vm = Vm::new();

    let mut args = std::env::args_os().skip(1);
    match (args.next(), args.next()) {
        (None, _) => repl(&mut vm),
        (Some(path), None) => run_file(&mut vm, path.as_ref()),
        _ => {
            eprintln!("Usage: iii [path]");
            process::exit(1);
        },
    }
}

fn repl(vm: &mut Vm) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Could not open a line editor: {}", error);
            process::exit(1);
        },
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(&line);
                vm.interpret(&line);
            },
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("{}", error);
                break;
            },
        }
    }
}

fn run_file(vm: &mut Vm, path: &std::path::Path) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Can't read file");
            process::exit(1);
        },
    };

    match vm.interpret(&source) {
        InterpretResult::Ok => (),
        InterpretResult::CompileError | InterpretResult::RuntimeError => process::exit(1),
    }
}
