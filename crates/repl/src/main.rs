//! Skiff CLI
//!
//! Run a script file, evaluate an inline expression, or start an
//! interactive shell. `RUST_LOG=skiff_engine=debug` enables compiler and
//! VM tracing.

use clap::Parser;
use skiff_engine::{EngineError, Runtime, Value};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Skiff - an embeddable ECMAScript interpreter", long_about = None)]
struct Cli {
    /// Script file to run; starts an interactive shell when omitted.
    input: Option<PathBuf>,

    /// Evaluate an expression and print its result.
    #[arg(short = 'e', long = "eval", value_name = "SOURCE")]
    eval: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut runtime = Runtime::new();

    if let Some(src) = cli.eval {
        match runtime.eval("<cmdline>", &src) {
            Ok(v) => println!("{}", display_value(&mut runtime, &v)),
            Err(e) => fail(e),
        }
        return;
    }

    if let Some(path) = cli.input {
        let src = match std::fs::read_to_string(&path) {
            Ok(src) => src,
            Err(e) => {
                eprintln!("skiff: cannot read {}: {}", path.display(), e);
                process::exit(1);
            }
        };
        let name = path.display().to_string();
        if let Err(e) = runtime.eval(&name, &src) {
            fail(e);
        }
        return;
    }

    interactive(runtime);
}

fn interactive(mut runtime: Runtime) {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(ed) => ed,
        Err(e) => {
            eprintln!("skiff: cannot start line editor: {}", e);
            process::exit(1);
        }
    };
    println!("skiff {} (interactive; ctrl-d to exit)", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                match runtime.eval("<repl>", &line) {
                    Ok(Value::Undefined) => {}
                    Ok(v) => println!("{}", display_value(&mut runtime, &v)),
                    Err(e) => eprintln!("{}", e),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("skiff: {}", e);
                break;
            }
        }
    }
}

/// Render a result the way the shell shows it: strings quoted, objects
/// through JSON where possible.
fn display_value(runtime: &mut Runtime, v: &Value) -> String {
    match v {
        Value::Str(s) => format!("{:?}", s.to_std_string()),
        Value::Object(_) => match runtime.to_json(v) {
            Ok(j) => j.to_string(),
            Err(_) => "[object]".to_string(),
        },
        other => other
            .primitive_to_string()
            .map(|s| s.to_std_string())
            .unwrap_or_else(|| "undefined".to_string()),
    }
}

fn fail(e: EngineError) -> ! {
    eprintln!("{}", e);
    process::exit(1);
}
