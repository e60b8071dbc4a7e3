//! CellScheme - a small Scheme-like interpreter built on cons cells
//!
//! This crate implements a tree-walking interpreter for a compact Scheme dialect.
//! Programs are made of numbers, booleans, symbols and lists built from mutable
//! pairs, evaluated against a chain of lexical frames rooted at a shared,
//! read-only table of built-in procedures.
//!
//! ```scheme
//! (define (fact n) (if (<= n 1) 1 (* n (fact (- n 1)))))
//! (fact 10)                          ; 3628800
//! (define lst (list 1 2 3))
//! (map (lambda (x) (* x x)) lst)     ; (1 4 9)
//! (let ((a 1) (b 2)) (+ a b))        ; 3
//! ```
//!
//! ## Evaluation Model
//!
//! - Closures capture the frame they were created in, by reference: later
//!   mutation of a captured binding is visible to the closure. Frames kept
//!   alive only by cycles through their own closures are reclaimed by
//!   [`collect_cycles`], which also runs on its own as frames are created.
//! - Calls in tail position (the last body expression of a closure, the
//!   selected branch of `if`, the last operand of `and`/`or`/`begin`, the
//!   last body expression of `let`) reuse the current evaluation step, so
//!   tail-recursive programs run in constant native stack.
//! - Only `#f` is false; every other value, including `()` and `0`, is true.
//!
//! ## Error Taxonomy
//!
//! Every failure is an [`Error`]. Callers that only care about the broad
//! class use [`Error::kind`], which distinguishes syntax errors (raised while
//! tokenizing/parsing) from name errors and general evaluation errors.
//!
//! ## Modules
//!
//! - `scheme`: tokenizer and recursive-descent parser
//! - `ast`: the value model (atoms, pairs, closures)
//! - `evaluator`: frames, special forms, procedure application, file loading
//! - `builtinops`: the registry of built-in procedures and special-form keywords
//! - `shell`: per-session request/response plumbing (feature `shell`)
//! - `harness`: line-by-line fixture evaluation records (feature `shell`)

use thiserror::Error as ThisError;

/// Maximum nesting of non-tail evaluations before evaluation is aborted.
///
/// Tail calls do not count towards this limit; only evaluations that must
/// return into a pending computation (argument evaluation, non-final body
/// expressions, conditions) nest.
pub const MAX_EVAL_DEPTH: usize = 20_000;

/// Remaining native stack below which recursive evaluation grows the stack.
pub(crate) const STACK_RED_ZONE: usize = 128 * 1024;

/// Size of each additional stack segment allocated on demand.
pub(crate) const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseErrorKind {
    /// No tokens at all
    Empty,
    /// Input ended while a list was still open
    Unclosed,
    /// A `)` with no matching `(`
    UnexpectedClose,
    /// Extra tokens found after a complete expression
    TrailingContent,
    /// A numeric lexeme that does not fit the number types
    InvalidNumber,
}

/// A structured error describing a parsing failure.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// The offending token, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, found: Option<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            found,
        }
    }

    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None)
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(found) = &self.found {
            write!(f, " (found '{found}')")?;
        }
        Ok(())
    }
}

/// Broad classification shared by every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed program text, detected while tokenizing or parsing
    Syntax,
    /// Reference to a name with no reachable binding
    Name,
    /// Any other failure during evaluation
    Evaluation,
}

impl ErrorKind {
    /// The user-visible name of this error class.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SchemeSyntaxError",
            ErrorKind::Name => "SchemeNameError",
            ErrorKind::Evaluation => "SchemeEvaluationError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPhase {
    Parse,
    Eval,
}

impl ErrorPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorPhase::Parse => "parse",
            ErrorPhase::Eval => "eval",
        }
    }
}

/// Error types for the interpreter
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum Error {
    #[error("ParseError: {0}")]
    ParseError(ParseError),
    #[error("Unbound variable: {0}")]
    UnboundVariable(String),
    #[error("EvaluationError: {0}")]
    EvalError(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("ArityError: {}", arity_message(.name, .expected, .got))]
    ArityError {
        /// Human-readable expected count, e.g. `2` or `at least 1`
        expected: String,
        got: usize,
        /// Name of the procedure or form, when known
        name: Option<String>,
    },
    #[error("Division by zero")]
    DivisionByZero,
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
}

fn arity_message(name: &Option<String>, expected: &str, got: &usize) -> String {
    match name {
        Some(name) => format!("{name}: expected {expected} arguments, got {got}"),
        None => format!("function expected {expected} arguments but got {got}"),
    }
}

impl Error {
    /// Create an ArityError without a procedure name
    pub fn arity_error(expected: impl ToString, got: usize) -> Self {
        Error::ArityError {
            expected: expected.to_string(),
            got,
            name: None,
        }
    }

    /// Create an ArityError naming the procedure or form that was called
    pub fn arity_error_for(name: &str, expected: impl ToString, got: usize) -> Self {
        Error::ArityError {
            expected: expected.to_string(),
            got,
            name: Some(name.to_owned()),
        }
    }

    pub(crate) fn parse(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Error::ParseError(ParseError::from_message(kind, message))
    }

    /// The broad class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ParseError(_) => ErrorKind::Syntax,
            Error::UnboundVariable(_) => ErrorKind::Name,
            Error::EvalError(_)
            | Error::TypeError(_)
            | Error::ArityError { .. }
            | Error::DivisionByZero
            | Error::Io { .. } => ErrorKind::Evaluation,
        }
    }

    /// Whether the error was raised while parsing or while evaluating.
    pub fn phase(&self) -> ErrorPhase {
        match self.kind() {
            ErrorKind::Syntax => ErrorPhase::Parse,
            ErrorKind::Name | ErrorKind::Evaluation => ErrorPhase::Eval,
        }
    }
}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod scheme;

#[cfg(feature = "shell")]
pub mod harness;

#[cfg(feature = "shell")]
pub mod shell;

pub use ast::Value;
pub use evaluator::{
    BuiltinFrame, Frame, builtin_frame, collect_cycles, evaluate, evaluate_file,
    evaluate_file_in, evaluate_with_frame,
};
pub use scheme::{Token, parse, parse_program, parse_scheme, tokenize};
