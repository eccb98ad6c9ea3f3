use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use quill::value::{FileHandle, Value};
use quill::vm::{ExecutionEngine, ExecutionResult};
use quill::{compiler, debug};

// BSD-style exit codes for batch use.
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;

#[derive(Parser)]
#[command(name = "quill", version, about = "A small bytecode-compiled scripting language")]
struct Cli {
    /// Script file to run; omit to start a REPL
    script: Option<PathBuf>,

    /// Print the compiled bytecode as JSON instead of running it
    #[arg(long, requires = "script")]
    dump_bytecode: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut engine = ExecutionEngine::new();
    register_natives(&mut engine);

    match cli.script {
        Some(path) => run_file(&mut engine, &path, cli.dump_bytecode),
        None => repl(&mut engine),
    }
}

fn run_file(engine: &mut ExecutionEngine, path: &PathBuf, dump: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Cannot read '{}': {error}", path.display());
            return ExitCode::from(EX_DATAERR);
        }
    };

    if dump {
        return dump_bytecode(&source);
    }

    match engine.interpret(&source) {
        ExecutionResult::Ok => ExitCode::SUCCESS,
        ExecutionResult::CompileError => ExitCode::from(EX_DATAERR),
        ExecutionResult::RuntimeError => ExitCode::from(EX_SOFTWARE),
    }
}

fn dump_bytecode(source: &str) -> ExitCode {
    let Some(function) = compiler::compile(source) else {
        return ExitCode::from(EX_DATAERR);
    };

    match serde_json::to_string_pretty(&debug::dump(&function)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("Cannot serialize bytecode: {error}");
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

/// Line-at-a-time REPL. Globals accumulate in the engine, so definitions
/// from earlier lines stay visible; errors are reported and the loop
/// keeps going.
fn repl(engine: &mut ExecutionEngine) -> ExitCode {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        if stdout.flush().is_err() {
            return ExitCode::SUCCESS;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return ExitCode::SUCCESS,
            Ok(_) => {}
        }

        if line.trim().is_empty() {
            continue;
        }

        engine.interpret(&line);
    }
}

/// Host functions available to every program.
fn register_natives(engine: &mut ExecutionEngine) {
    engine.define_native("clock", |_args| {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| e.to_string())?;
        Ok(Value::Number(elapsed.as_secs_f64()))
    });

    engine.define_native("rand", |_args| Ok(Value::Number(fastrand::f64())));

    engine.define_native("open", |args| match args {
        [Value::Str(path), Value::Str(mode)] => {
            let handle = FileHandle::open(path, mode)?;
            Ok(Value::File(Rc::new(handle)))
        }
        _ => Err("open expects a path string and a mode string.".to_string()),
    });

    engine.define_native("read_file", |args| match args {
        [Value::File(handle)] => Ok(Value::from(handle.read_all()?)),
        _ => Err("read_file expects an open file.".to_string()),
    });

    engine.define_native("write_file", |args| match args {
        [Value::File(handle), Value::Str(data)] => {
            handle.write_all(data)?;
            Ok(Value::Null)
        }
        _ => Err("write_file expects an open file and a string.".to_string()),
    });

    engine.define_native("close_file", |args| match args {
        [Value::File(handle)] => {
            handle.close();
            Ok(Value::Null)
        }
        _ => Err("close_file expects an open file.".to_string()),
    });
}
