use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::ast::{Closure, Value};
use crate::builtinops::{Arity, OpKind, find_procedure, find_special_form, get_builtin_ops};
use crate::scheme::{parse_program, tokenize};
use crate::{Error, MAX_EVAL_DEPTH, STACK_GROW_SIZE, STACK_RED_ZONE};

mod collector;

pub use collector::collect_cycles;

/// The root frame: every built-in procedure plus `nil`.
///
/// It is backed directly by the static operation registry, so it is created
/// once per process, shared by every session and can never be mutated.
#[derive(Debug)]
pub struct BuiltinFrame {
    _private: (),
}

static BUILTIN_FRAME: BuiltinFrame = BuiltinFrame { _private: () };

/// The process-wide root frame
pub fn builtin_frame() -> &'static BuiltinFrame {
    &BUILTIN_FRAME
}

impl BuiltinFrame {
    pub fn get(&self, name: &str) -> Option<Value> {
        if name == "nil" {
            return Some(Value::Nil);
        }
        find_procedure(name).map(Value::BuiltinFunction)
    }

    /// Names bound in the root frame
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        get_builtin_ops()
            .iter()
            .filter(|op| !op.is_special_form())
            .map(|op| op.scheme_id)
            .chain(std::iter::once("nil"))
    }
}

#[derive(Debug)]
enum Enclosing {
    Builtins(&'static BuiltinFrame),
    Frame(Rc<Frame>),
}

/// A mutable set of bindings linked to exactly one enclosing frame.
///
/// Frames are shared: closures keep their defining frame alive, and sibling
/// calls of the same closure get sibling frames under one parent. A frame that
/// only stays alive through a cycle with its own closures is reclaimed by
/// [`collect_cycles`].
#[derive(Debug)]
pub struct Frame {
    bindings: RefCell<HashMap<Rc<str>, Value>>,
    parent: Enclosing,
}

impl Frame {
    /// A fresh top-level frame whose parent is the built-in frame
    pub fn session() -> Rc<Frame> {
        let frame = Rc::new(Frame {
            bindings: RefCell::new(HashMap::new()),
            parent: Enclosing::Builtins(builtin_frame()),
        });
        collector::register(&frame);
        frame
    }

    pub fn child(parent: &Rc<Frame>) -> Rc<Frame> {
        collector::maybe_collect();
        let frame = Rc::new(Frame {
            bindings: RefCell::new(HashMap::new()),
            parent: Enclosing::Frame(Rc::clone(parent)),
        });
        collector::register(&frame);
        frame
    }

    /// Find the innermost binding of `name`.
    pub fn lookup(&self, name: &str) -> Result<Value, Error> {
        let mut frame = self;
        loop {
            if let Some(value) = frame.bindings.borrow().get(name) {
                return Ok(value.clone());
            }
            match &frame.parent {
                Enclosing::Frame(parent) => frame = parent.as_ref(),
                Enclosing::Builtins(root) => {
                    return root
                        .get(name)
                        .ok_or_else(|| Error::UnboundVariable(name.to_owned()));
                }
            }
        }
    }

    /// Create or overwrite a binding in this frame.
    pub fn define(&self, name: Rc<str>, value: Value) {
        self.bindings.borrow_mut().insert(name, value);
    }

    /// Replace the innermost existing binding of `name`.
    pub fn set(&self, name: &str, value: Value) -> Result<(), Error> {
        let mut frame = self;
        loop {
            if let Some(slot) = frame.bindings.borrow_mut().get_mut(name) {
                *slot = value;
                return Ok(());
            }
            match &frame.parent {
                Enclosing::Frame(parent) => frame = parent.as_ref(),
                Enclosing::Builtins(root) => {
                    return Err(if root.get(name).is_some() {
                        Error::EvalError(format!("cannot set! built-in binding '{name}'"))
                    } else {
                        Error::UnboundVariable(name.to_owned())
                    });
                }
            }
        }
    }

    /// Remove a binding from this frame only, returning its value.
    pub fn delete(&self, name: &str) -> Result<Value, Error> {
        self.bindings
            .borrow_mut()
            .remove(name)
            .ok_or_else(|| Error::UnboundVariable(name.to_owned()))
    }

    pub fn is_bound_locally(&self, name: &str) -> bool {
        self.bindings.borrow().contains_key(name)
    }

    /// Get all bindings visible from this frame, sorted by name.
    /// Inner bindings override outer ones.
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut chain = vec![self];
        let mut root = None;
        while let Some(&frame) = chain.last() {
            match &frame.parent {
                Enclosing::Frame(parent) => chain.push(parent.as_ref()),
                Enclosing::Builtins(builtins) => {
                    root = Some(*builtins);
                    break;
                }
            }
        }

        let mut bindings: HashMap<String, Value> = HashMap::new();
        if let Some(root) = root {
            for name in root.names() {
                if let Some(value) = root.get(name) {
                    bindings.insert(name.to_owned(), value);
                }
            }
        }
        for frame in chain.into_iter().rev() {
            for (name, value) in frame.bindings.borrow().iter() {
                bindings.insert(name.to_string(), value.clone());
            }
        }

        let mut result: Vec<_> = bindings.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

/// Outcome of one evaluation step: either a finished value, or an expression
/// left in tail position that the caller's loop evaluates next.
pub(crate) enum Trampoline {
    Value(Value),
    Eval(Value, Rc<Frame>),
}

/// Evaluate an expression in a frame, tracking non-tail nesting depth.
pub(crate) fn eval_with_depth(
    expr: &Value,
    frame: &Rc<Frame>,
    depth: usize,
) -> Result<Value, Error> {
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::EvalError(format!(
            "Evaluation depth limit exceeded (max: {MAX_EVAL_DEPTH})"
        )));
    }
    stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
        run(expr.clone(), Rc::clone(frame), depth)
    })
}

fn run(mut expr: Value, mut frame: Rc<Frame>, depth: usize) -> Result<Value, Error> {
    loop {
        let step = match &expr {
            Value::Symbol(name) => return frame.lookup(name),
            Value::Pair(_) => eval_combination(&expr, &frame, depth)?,
            // Numbers, booleans, the empty list and procedures
            _ => return Ok(expr.clone()),
        };
        match step {
            Trampoline::Value(value) => return Ok(value),
            Trampoline::Eval(next_expr, next_frame) => {
                expr = next_expr;
                frame = next_frame;
            }
        }
    }
}

fn eval_combination(expr: &Value, frame: &Rc<Frame>, depth: usize) -> Result<Trampoline, Error> {
    let Some(elements) = expr.list_items() else {
        return Err(Error::EvalError(format!("malformed combination: {expr}")));
    };
    let Some((head, operands)) = elements.split_first() else {
        return Ok(Trampoline::Value(Value::Nil));
    };

    // Keywords are resolved before any variable lookup.
    if let Value::Symbol(name) = head
        && let Some(op) = find_special_form(name)
        && let OpKind::SpecialForm(form) = op.op_kind
    {
        op.validate_arity(operands.len())?;
        return form(operands, frame, depth);
    }

    let func = eval_with_depth(head, frame, depth + 1)?;
    let args = eval_args(operands, frame, depth)?;
    apply(&func, args, depth)
}

fn eval_args(exprs: &[Value], frame: &Rc<Frame>, depth: usize) -> Result<Vec<Value>, Error> {
    exprs
        .iter()
        .map(|expr| eval_with_depth(expr, frame, depth + 1))
        .collect()
}

/// Evaluate every expression but the last, handing the last back as a tail call.
fn eval_body(body: &[Value], frame: Rc<Frame>, depth: usize) -> Result<Trampoline, Error> {
    let Some((last, init)) = body.split_last() else {
        return Ok(Trampoline::Value(Value::Nil));
    };
    for expr in init {
        eval_with_depth(expr, &frame, depth + 1)?;
    }
    Ok(Trampoline::Eval(last.clone(), frame))
}

fn apply(func: &Value, args: Vec<Value>, depth: usize) -> Result<Trampoline, Error> {
    match func {
        Value::BuiltinFunction(op) => op.call(args, depth).map(Trampoline::Value),
        Value::Function(closure) => {
            Arity::Exact(closure.params.len()).validate(args.len())?;
            let call_frame = Frame::child(&closure.frame);
            for (param, arg) in closure.params.iter().zip(args) {
                call_frame.define(Rc::clone(param), arg);
            }
            eval_body(&closure.body, call_frame, depth)
        }
        other => Err(Error::EvalError(format!(
            "cannot apply non-procedure {} {other}",
            other.type_name()
        ))),
    }
}

/// Apply a procedure value to evaluated arguments and run it to completion.
pub(crate) fn apply_procedure(func: &Value, args: Vec<Value>, depth: usize) -> Result<Value, Error> {
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::EvalError(format!(
            "Evaluation depth limit exceeded (max: {MAX_EVAL_DEPTH})"
        )));
    }
    match apply(func, args, depth)? {
        Trampoline::Value(value) => Ok(value),
        Trampoline::Eval(expr, frame) => eval_with_depth(&expr, &frame, depth),
    }
}

//
// Special forms
//

fn expect_symbol<'a>(value: &'a Value, form: &str) -> Result<&'a Rc<str>, Error> {
    value.as_symbol().ok_or_else(|| {
        Error::EvalError(format!(
            "'{form}' expects a symbol, got {} {value}",
            value.type_name()
        ))
    })
}

fn param_list(value: &Value, form: &str) -> Result<Vec<Value>, Error> {
    value
        .list_items()
        .ok_or_else(|| Error::EvalError(format!("'{form}' parameters must be a list")))
}

fn parse_params(items: &[Value], form: &str) -> Result<Vec<Rc<str>>, Error> {
    let mut params: Vec<Rc<str>> = Vec::with_capacity(items.len());
    for item in items {
        let name = expect_symbol(item, form)?;
        if params.contains(name) {
            return Err(Error::EvalError(format!(
                "Duplicate parameter name: {name}"
            )));
        }
        params.push(Rc::clone(name));
    }
    Ok(params)
}

fn make_closure(params: Vec<Rc<str>>, body: &[Value], frame: &Rc<Frame>) -> Value {
    Value::Function(Rc::new(Closure::new(
        params,
        Rc::from(body),
        Rc::clone(frame),
    )))
}

/// Evaluate quote special form
pub(crate) fn eval_quote(
    args: &[Value],
    _frame: &Rc<Frame>,
    _depth: usize,
) -> Result<Trampoline, Error> {
    match args {
        [datum] => Ok(Trampoline::Value(datum.clone())),
        _ => Err(Error::arity_error_for("quote", 1, args.len())),
    }
}

/// Evaluate define special form, in either the variable or procedure shape
pub(crate) fn eval_define(
    args: &[Value],
    frame: &Rc<Frame>,
    depth: usize,
) -> Result<Trampoline, Error> {
    match args {
        [Value::Symbol(name), expr] => {
            let value = eval_with_depth(expr, frame, depth + 1)?;
            frame.define(Rc::clone(name), value.clone());
            Ok(Trampoline::Value(value))
        }
        [Value::Symbol(_), ..] => Err(Error::EvalError(
            "'define' of a variable takes exactly one value expression".to_owned(),
        )),
        [signature @ Value::Pair(_), body @ ..] => {
            let items = param_list(signature, "define")?;
            let Some((name, params)) = items.split_first() else {
                return Err(Error::EvalError("'define' requires a procedure name".to_owned()));
            };
            let name = expect_symbol(name, "define")?;
            let closure = make_closure(parse_params(params, "define")?, body, frame);
            frame.define(Rc::clone(name), closure.clone());
            Ok(Trampoline::Value(closure))
        }
        _ => Err(Error::EvalError(
            "'define' expects a symbol or a (name param...) list".to_owned(),
        )),
    }
}

/// Evaluate lambda special form
pub(crate) fn eval_lambda(
    args: &[Value],
    frame: &Rc<Frame>,
    _depth: usize,
) -> Result<Trampoline, Error> {
    match args {
        [params, body @ ..] if !body.is_empty() => Ok(Trampoline::Value(make_closure(
            parse_params(&param_list(params, "lambda")?, "lambda")?,
            body,
            frame,
        ))),
        _ => Err(Error::arity_error_for("lambda", Arity::AtLeast(2), args.len())),
    }
}

/// Evaluate if special form
pub(crate) fn eval_if(args: &[Value], frame: &Rc<Frame>, depth: usize) -> Result<Trampoline, Error> {
    match args {
        [condition, consequent, alternative] => {
            let branch = if eval_with_depth(condition, frame, depth + 1)?.is_truthy() {
                consequent
            } else {
                alternative
            };
            Ok(Trampoline::Eval(branch.clone(), Rc::clone(frame)))
        }
        _ => Err(Error::arity_error_for("if", 3, args.len())),
    }
}

macro_rules! short_circuit_op {
    ($name:ident, $stop_when_truthy:literal, $default:literal) => {
        pub(crate) fn $name(
            args: &[Value],
            frame: &Rc<Frame>,
            depth: usize,
        ) -> Result<Trampoline, Error> {
            let Some((last, init)) = args.split_last() else {
                return Ok(Trampoline::Value(Value::Bool($default)));
            };
            for arg in init {
                let value = eval_with_depth(arg, frame, depth + 1)?;
                if value.is_truthy() == $stop_when_truthy {
                    return Ok(Trampoline::Value(value));
                }
            }
            Ok(Trampoline::Eval(last.clone(), Rc::clone(frame)))
        }
    };
}

short_circuit_op!(eval_and, false, true);
short_circuit_op!(eval_or, true, false);

/// Evaluate not special form
pub(crate) fn eval_not(args: &[Value], frame: &Rc<Frame>, depth: usize) -> Result<Trampoline, Error> {
    match args {
        [operand] => {
            let value = eval_with_depth(operand, frame, depth + 1)?;
            Ok(Trampoline::Value(Value::Bool(!value.is_truthy())))
        }
        _ => Err(Error::arity_error_for("not", 1, args.len())),
    }
}

/// Evaluate let special form: bindings are evaluated in the enclosing frame,
/// the body in a new child frame.
pub(crate) fn eval_let(args: &[Value], frame: &Rc<Frame>, depth: usize) -> Result<Trampoline, Error> {
    let [bindings, body @ ..] = args else {
        return Err(Error::arity_error_for("let", Arity::AtLeast(2), args.len()));
    };
    let bindings = bindings
        .list_items()
        .ok_or_else(|| Error::EvalError("'let' bindings must be a list".to_owned()))?;

    let let_frame = Frame::child(frame);
    for binding in &bindings {
        let items = binding.list_items().unwrap_or_default();
        let [name, expr] = items.as_slice() else {
            return Err(Error::EvalError(format!(
                "'let' binding must be (name expr), got {binding}"
            )));
        };
        let name = expect_symbol(name, "let")?;
        if let_frame.is_bound_locally(name) {
            return Err(Error::EvalError(format!("Duplicate let binding: {name}")));
        }
        let value = eval_with_depth(expr, frame, depth + 1)?;
        let_frame.define(Rc::clone(name), value);
    }

    eval_body(body, let_frame, depth)
}

/// Evaluate set! special form
pub(crate) fn eval_set(args: &[Value], frame: &Rc<Frame>, depth: usize) -> Result<Trampoline, Error> {
    match args {
        [target, expr] => {
            let name = expect_symbol(target, "set!")?;
            let value = eval_with_depth(expr, frame, depth + 1)?;
            frame.set(name, value.clone())?;
            Ok(Trampoline::Value(value))
        }
        _ => Err(Error::arity_error_for("set!", 2, args.len())),
    }
}

/// Evaluate del special form
pub(crate) fn eval_del(args: &[Value], frame: &Rc<Frame>, _depth: usize) -> Result<Trampoline, Error> {
    match args {
        [target] => {
            let name = expect_symbol(target, "del")?;
            frame.delete(name).map(Trampoline::Value)
        }
        _ => Err(Error::arity_error_for("del", 1, args.len())),
    }
}

/// Evaluate begin special form
pub(crate) fn eval_begin(
    args: &[Value],
    frame: &Rc<Frame>,
    depth: usize,
) -> Result<Trampoline, Error> {
    eval_body(args, Rc::clone(frame), depth)
}

/// Evaluate an expression, in a fresh session frame when none is given.
pub fn evaluate(expr: &Value, frame: Option<&Rc<Frame>>) -> Result<Value, Error> {
    evaluate_with_frame(expr, frame.cloned()).map(|(value, _)| value)
}

/// Evaluate an expression and hand back the frame it was evaluated in, so that
/// successive top-level expressions can share one environment.
pub fn evaluate_with_frame(
    expr: &Value,
    frame: Option<Rc<Frame>>,
) -> Result<(Value, Rc<Frame>), Error> {
    let frame = frame.unwrap_or_else(Frame::session);
    trace!(%expr, "evaluating top-level expression");
    let value = eval_with_depth(expr, &frame, 0)?;
    Ok((value, frame))
}

/// Evaluate every expression of a program file in a fresh session frame and
/// return the value of the last one.
pub fn evaluate_file(path: impl AsRef<Path>) -> Result<Value, Error> {
    evaluate_file_in(path, &Frame::session())
}

/// Like [`evaluate_file`], but evaluates in the given frame.
pub fn evaluate_file_in(path: impl AsRef<Path>, frame: &Rc<Frame>) -> Result<Value, Error> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|err| Error::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    let program = parse_program(&tokenize(&text))?;
    debug!(path = %path.display(), expressions = program.len(), "loading program");

    let mut last = Value::Nil;
    for expr in &program {
        last = eval_with_depth(expr, frame, 0)?;
    }
    Ok(last)
}
