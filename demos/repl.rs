use cellscheme::ast::Value;
use cellscheme::evaluator::{Frame, evaluate_file_in};
use cellscheme::shell::{Session, ShellConfig};
use cellscheme::{Error, ParseError, ParseErrorKind, parse_scheme};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = panic::catch_unwind(|| {
        run_repl(std::env::args().skip(1).collect());
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

/// Whether `text` is an expression still waiting for closing parentheses
fn is_incomplete(text: &str) -> bool {
    matches!(
        parse_scheme(text),
        Err(Error::ParseError(ParseError {
            kind: ParseErrorKind::Unclosed,
            ..
        }))
    )
}

fn run_repl(files: Vec<String>) {
    println!("CellScheme interpreter");
    println!("Enter expressions like: (define (square x) (* x x))");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let mut session = Session::new(ShellConfig::default());

    for file in &files {
        match evaluate_file_in(file, session.frame()) {
            Ok(value) => println!("loaded {file}: {value}"),
            Err(e) => println!("{}: {e}", e.kind()),
        }
    }

    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { "in> " } else { "..> " };
        match rl.readline(prompt) {
            Ok(line) => {
                let line = line.trim();
                if pending.is_empty() && line.is_empty() {
                    continue;
                }

                if pending.is_empty() {
                    match line {
                        ":help" => {
                            print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(session.frame());
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("{}", session.config().farewell.trim_end());
                            break;
                        }
                        _ => {}
                    }
                }

                if !pending.is_empty() {
                    pending.push('\n');
                }
                pending.push_str(line);
                if is_incomplete(&pending) {
                    continue;
                }

                let _ = rl.add_history_entry(pending.as_str());
                let input = std::mem::take(&mut pending);
                let response = session.respond(&input);
                print!("{}", response.output);
                if input.trim().eq_ignore_ascii_case(&session.config().exit_command) {
                    break;
                }
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("{}", session.config().farewell.trim_end());
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("CellScheme REPL commands:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show current frame bindings");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  exit       - Exit the interpreter");
    println!("  Ctrl+C     - Exit the interpreter");
    println!();
    println!("Files given on the command line are loaded before the first prompt.");
    println!("An expression with unbalanced parentheses continues on the next line.");
    println!();
    println!("Special forms:");
    println!("  define lambda if and or not let set! del begin quote");
    println!();
    println!("Examples:");
    println!("  (+ 1 2 3)");
    println!("  (define (fact n) (if (<= n 1) 1 (* n (fact (- n 1)))))");
    println!("  (map (lambda (x) (* x x)) (list 1 2 3))");
    println!("  (let ((a 1) (b 2)) (+ a b))");
    println!();
}

fn print_environment(frame: &Frame) {
    let bindings = frame.get_all_bindings();

    // Separate built-in procedures from user-defined values
    let mut builtins = Vec::new();
    let mut user_defined = Vec::new();

    for (name, value) in bindings {
        match value {
            Value::BuiltinFunction(op) if op.scheme_id == name => builtins.push(name),
            _ => user_defined.push((name, value)),
        }
    }

    if !builtins.is_empty() {
        println!("Built-in procedures ({}):", builtins.len());
        // Print in columns for readability
        let mut col = 0;
        for name in builtins {
            print!("  {name:<15}");
            col += 1;
            if col % 4 == 0 {
                println!();
            }
        }
        if col % 4 != 0 {
            println!();
        }
        println!();
    }

    if user_defined.is_empty() {
        println!("No user-defined bindings.");
    } else {
        println!("User-defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {value}");
        }
    }
}
