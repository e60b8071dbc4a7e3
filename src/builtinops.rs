//! Built-in operations registry.
//!
//! This module provides the single registry of everything the interpreter knows
//! natively: the primitive procedures installed in the root frame and the
//! special-form keywords the evaluator dispatches on before variable lookup.
//!
//! ```scheme
//! (+ 1 2.5)            ; arithmetic, promotes to float when needed
//! (< 1 2 3)            ; chained comparison
//! (car (cons 1 2))     ; pair access
//! (map f (list 1 2))   ; higher-order procedures call back into the evaluator
//! ```
//!
//! ## Procedures vs Special Forms
//!
//! - **Procedures**: Evaluate all arguments before application (e.g., `+`, `car`, `map`).
//!   They are ordinary values bound in the root frame and can be shadowed or passed
//!   around like any other value.
//! - **Special Forms**: Control evaluation of their operands (e.g., `if`, `and`, `define`).
//!   They are keywords, never bound in a frame, and cannot be shadowed.
//!
//! ## Error Handling
//!
//! - **Type Safety**: arithmetic and comparisons reject non-numbers, `car`/`cdr`
//!   reject anything but a pair, list procedures reject improper or cyclic lists.
//! - **Overflow Detection**: integer arithmetic reports overflow instead of wrapping.
//! - **Arity Checking**: argument counts are validated before the implementation runs.
//!
//! ## Adding New Operations
//!
//! 1. **Implement the function** with the signature `fn(Vec<Value>) -> Result<Value, Error>`
//!    (or `fn(Vec<Value>, usize)` if it needs to call procedures)
//! 2. **Add to BUILTIN_OPS** with its Scheme identifier and arity
//! 3. **Add tests** covering edge cases and error conditions

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

use crate::Error;
use crate::ast::{NumberType, Value, cons, structurally_equal};
use crate::evaluator::{
    Frame, Trampoline, apply_procedure, eval_and, eval_begin, eval_define, eval_del, eval_if,
    eval_lambda, eval_let, eval_not, eval_or, eval_quote, eval_set,
};

/// Accepted argument counts of a procedure or special form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Any => true,
        }
    }

    /// Check the number of supplied arguments
    pub fn validate(&self, count: usize) -> Result<(), Error> {
        if self.accepts(count) {
            Ok(())
        } else {
            Err(Error::arity_error(self, count))
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

/// Signature of special-form handlers: unevaluated operands, the current frame
/// and the current evaluation depth.
pub(crate) type SpecialFormFn = fn(&[Value], &Rc<Frame>, usize) -> Result<Trampoline, Error>;

/// Represents the implementation of a built-in expression (procedure or special form)
#[derive(Clone, Copy)]
pub(crate) enum OpKind {
    /// Procedure that takes evaluated arguments and returns a value
    Function(fn(Vec<Value>) -> Result<Value, Error>),
    /// Procedure that applies other procedures and therefore needs the
    /// current evaluation depth
    HigherOrder(fn(Vec<Value>, usize) -> Result<Value, Error>),
    /// Special form that receives its operands unevaluated
    SpecialForm(SpecialFormFn),
}

impl std::fmt::Debug for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Function(_) => write!(f, "Function(<fn>)"),
            OpKind::HigherOrder(_) => write!(f, "HigherOrder(<fn>)"),
            OpKind::SpecialForm(_) => write!(f, "SpecialForm(<fn>)"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug)]
pub struct BuiltinOp {
    /// The Scheme identifier for this operation
    pub scheme_id: &'static str,
    /// The implementation of this operation
    pub(crate) op_kind: OpKind,
    /// Expected number of arguments
    pub arity: Arity,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.scheme_id == other.scheme_id
    }
}

impl BuiltinOp {
    /// Check if this operation is a special form
    pub fn is_special_form(&self) -> bool {
        matches!(self.op_kind, OpKind::SpecialForm(_))
    }

    /// Check the argument count, naming this operation in the error
    pub(crate) fn validate_arity(&self, arg_count: usize) -> Result<(), Error> {
        if self.arity.accepts(arg_count) {
            Ok(())
        } else {
            Err(Error::arity_error_for(self.scheme_id, self.arity, arg_count))
        }
    }

    /// Apply a procedure to already evaluated arguments
    pub(crate) fn call(&self, args: Vec<Value>, depth: usize) -> Result<Value, Error> {
        self.validate_arity(args.len())?;
        match self.op_kind {
            OpKind::Function(f) => f(args),
            OpKind::HigherOrder(f) => f(args, depth),
            OpKind::SpecialForm(_) => Err(Error::EvalError(format!(
                "special form '{}' cannot be applied as a procedure",
                self.scheme_id
            ))),
        }
    }
}

//
// Numeric helpers
//

/// A numeric operand, either integer or float
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(NumberType),
    Float(f64),
}

impl Num {
    fn from_value(value: &Value, op: &str) -> Result<Num, Error> {
        match value {
            Value::Number(n) => Ok(Num::Int(*n)),
            Value::Float(x) => Ok(Num::Float(*x)),
            other => Err(Error::TypeError(format!(
                "'{op}' expects numbers, got {} {other}",
                other.type_name()
            ))),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(x) => x,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(n) => Value::Number(n),
            Num::Float(x) => Value::Float(x),
        }
    }

    /// Combine two operands, staying in integers while both are integers
    fn combine(
        self,
        other: Num,
        int_op: fn(NumberType, NumberType) -> Option<NumberType>,
        float_op: fn(f64, f64) -> f64,
        what: &str,
    ) -> Result<Num, Error> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => int_op(a, b)
                .map(Num::Int)
                .ok_or_else(|| Error::EvalError(format!("Integer overflow in {what}"))),
            (a, b) => Ok(Num::Float(float_op(a.as_f64(), b.as_f64()))),
        }
    }

    fn compare(self, other: Num) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

fn numbers(args: &[Value], op: &str) -> Result<Vec<Num>, Error> {
    args.iter().map(|arg| Num::from_value(arg, op)).collect()
}

//
// Builtin Function Implementations
//

fn builtin_add(args: Vec<Value>) -> Result<Value, Error> {
    let mut sum = Num::Int(0);
    for n in numbers(&args, "+")? {
        sum = sum.combine(n, NumberType::checked_add, |a, b| a + b, "addition")?;
    }
    Ok(sum.into_value())
}

fn builtin_sub(args: Vec<Value>) -> Result<Value, Error> {
    let nums = numbers(&args, "-")?;
    let Some((&first, rest)) = nums.split_first() else {
        return Err(Error::arity_error_for("-", Arity::AtLeast(1), 0));
    };

    if rest.is_empty() {
        return match first {
            Num::Int(n) => n
                .checked_neg()
                .map(Value::Number)
                .ok_or_else(|| Error::EvalError("Integer overflow in negation".into())),
            Num::Float(x) => Ok(Value::Float(-x)),
        };
    }

    let mut result = first;
    for &n in rest {
        result = result.combine(n, NumberType::checked_sub, |a, b| a - b, "subtraction")?;
    }
    Ok(result.into_value())
}

fn builtin_mul(args: Vec<Value>) -> Result<Value, Error> {
    let mut product = Num::Int(1);
    for n in numbers(&args, "*")? {
        product = product.combine(n, NumberType::checked_mul, |a, b| a * b, "multiplication")?;
    }
    Ok(product.into_value())
}

// Division is always true division and yields a float.
fn builtin_div(args: Vec<Value>) -> Result<Value, Error> {
    let nums = numbers(&args, "/")?;
    let Some((&first, rest)) = nums.split_first() else {
        return Err(Error::arity_error_for("/", Arity::AtLeast(1), 0));
    };

    if rest.is_empty() {
        if first.as_f64() == 0.0 {
            return Err(Error::DivisionByZero);
        }
        return Ok(Value::Float(1.0 / first.as_f64()));
    }

    let mut result = first.as_f64();
    for n in rest {
        let divisor = n.as_f64();
        if divisor == 0.0 {
            return Err(Error::DivisionByZero);
        }
        result /= divisor;
    }
    Ok(Value::Float(result))
}

// Macro to generate chained numeric comparison functions
macro_rules! numeric_comparison {
    ($name:ident, $op_str:expr, $($accepted:pat_param)|+) => {
        fn $name(args: Vec<Value>) -> Result<Value, Error> {
            let nums = numbers(&args, $op_str)?;
            // All adjacent pairs must satisfy the comparison.
            let holds = nums
                .windows(2)
                .all(|pair| matches!(pair[0].compare(pair[1]), $(Some($accepted))|+));
            Ok(Value::Bool(holds))
        }
    };
}

use std::cmp::Ordering::{Equal, Greater, Less};

numeric_comparison!(builtin_eq, "=", Equal);
numeric_comparison!(builtin_lt, "<", Less);
numeric_comparison!(builtin_gt, ">", Greater);
numeric_comparison!(builtin_le, "<=", Less | Equal);
numeric_comparison!(builtin_ge, ">=", Greater | Equal);

/// Structural equality where numbers compare by numeric value.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    structurally_equal(a, b, atoms_equal)
}

fn atoms_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_) | Value::Float(_), Value::Number(_) | Value::Float(_)) => {
            match (Num::from_value(a, "equal?"), Num::from_value(b, "equal?")) {
                (Ok(x), Ok(y)) => x.compare(y) == Some(Equal),
                _ => false,
            }
        }
        _ => a == b,
    }
}

fn builtin_equal(args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::Bool(
        args.windows(2).all(|pair| values_equal(&pair[0], &pair[1])),
    ))
}

fn builtin_eq_identity(args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::Bool(
        args.windows(2).all(|pair| pair[0].is_same_object(&pair[1])),
    ))
}

fn expect_pair<'a>(value: &'a Value, op: &str) -> Result<&'a Rc<crate::ast::Pair>, Error> {
    value.as_pair().ok_or_else(|| {
        Error::TypeError(format!(
            "'{op}' requires a pair, got {} {value}",
            value.type_name()
        ))
    })
}

fn builtin_cons(args: Vec<Value>) -> Result<Value, Error> {
    let [car, cdr]: [Value; 2] = args
        .try_into()
        .map_err(|args: Vec<Value>| Error::arity_error_for("cons", 2, args.len()))?;
    Ok(cons(car, cdr))
}

fn builtin_car(args: Vec<Value>) -> Result<Value, Error> {
    Ok(expect_pair(&args[0], "car")?.car())
}

fn builtin_cdr(args: Vec<Value>) -> Result<Value, Error> {
    Ok(expect_pair(&args[0], "cdr")?.cdr())
}

fn builtin_set_car(args: Vec<Value>) -> Result<Value, Error> {
    let pair = expect_pair(&args[0], "set-car!")?;
    pair.set_car(args[1].clone());
    Ok(args[1].clone())
}

fn builtin_set_cdr(args: Vec<Value>) -> Result<Value, Error> {
    let pair = expect_pair(&args[0], "set-cdr!")?;
    pair.set_cdr(args[1].clone());
    Ok(args[1].clone())
}

fn builtin_list(args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::from_vec(args))
}

fn builtin_is_list(args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::Bool(args[0].is_list()))
}

fn builtin_null(args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::Bool(args[0].is_nil()))
}

fn builtin_length(args: Vec<Value>) -> Result<Value, Error> {
    let items = args[0].expect_list("length")?;
    NumberType::try_from(items.len())
        .map(Value::Number)
        .map_err(|_| Error::EvalError("list too long".into()))
}

fn builtin_list_ref(args: Vec<Value>) -> Result<Value, Error> {
    let items = args[0].expect_list("list-ref")?;
    let index = match &args[1] {
        Value::Number(n) => *n,
        other => {
            return Err(Error::TypeError(format!(
                "list-ref index must be an integer, got {} {other}",
                other.type_name()
            )));
        }
    };
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .ok_or_else(|| {
            Error::EvalError(format!(
                "list-ref index {index} out of range for list of length {}",
                items.len()
            ))
        })
}

fn builtin_append(args: Vec<Value>) -> Result<Value, Error> {
    let mut combined = Vec::new();
    for arg in &args {
        combined.extend(arg.expect_list("append")?);
    }
    Ok(Value::from_vec(combined))
}

fn expect_procedure(value: &Value, op: &str) -> Result<(), Error> {
    if value.is_procedure() {
        Ok(())
    } else {
        Err(Error::TypeError(format!(
            "'{op}' requires a procedure, got {} {value}",
            value.type_name()
        )))
    }
}

fn builtin_map(args: Vec<Value>, depth: usize) -> Result<Value, Error> {
    expect_procedure(&args[0], "map")?;
    let items = args[1].expect_list("map")?;
    let mapped = items
        .into_iter()
        .map(|item| apply_procedure(&args[0], vec![item], depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::from_vec(mapped))
}

fn builtin_filter(args: Vec<Value>, depth: usize) -> Result<Value, Error> {
    expect_procedure(&args[0], "filter")?;
    let mut kept = Vec::new();
    for item in args[1].expect_list("filter")? {
        if apply_procedure(&args[0], vec![item.clone()], depth + 1)?.is_truthy() {
            kept.push(item);
        }
    }
    Ok(Value::from_vec(kept))
}

fn builtin_reduce(args: Vec<Value>, depth: usize) -> Result<Value, Error> {
    expect_procedure(&args[0], "reduce")?;
    let mut accumulator = args[2].clone();
    for item in args[1].expect_list("reduce")? {
        accumulator = apply_procedure(&args[0], vec![accumulator, item], depth + 1)?;
    }
    Ok(accumulator)
}

/// Global registry of all built-in operations, initialized once.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    fn function(
        scheme_id: &'static str,
        arity: Arity,
        f: fn(Vec<Value>) -> Result<Value, Error>,
    ) -> BuiltinOp {
        BuiltinOp {
            scheme_id,
            op_kind: OpKind::Function(f),
            arity,
        }
    }

    fn higher_order(
        scheme_id: &'static str,
        arity: Arity,
        f: fn(Vec<Value>, usize) -> Result<Value, Error>,
    ) -> BuiltinOp {
        BuiltinOp {
            scheme_id,
            op_kind: OpKind::HigherOrder(f),
            arity,
        }
    }

    fn special_form(scheme_id: &'static str, arity: Arity, f: SpecialFormFn) -> BuiltinOp {
        BuiltinOp {
            scheme_id,
            op_kind: OpKind::SpecialForm(f),
            arity,
        }
    }

    vec![
        // Arithmetic operations
        function("+", Arity::Any, builtin_add),
        function("-", Arity::AtLeast(1), builtin_sub),
        function("*", Arity::Any, builtin_mul),
        function("/", Arity::AtLeast(1), builtin_div),
        // Comparison operations
        function("=", Arity::AtLeast(1), builtin_eq),
        function("<", Arity::AtLeast(1), builtin_lt),
        function(">", Arity::AtLeast(1), builtin_gt),
        function("<=", Arity::AtLeast(1), builtin_le),
        function(">=", Arity::AtLeast(1), builtin_ge),
        function("equal?", Arity::AtLeast(1), builtin_equal),
        function("eq?", Arity::AtLeast(1), builtin_eq_identity),
        // Pair and list operations
        function("cons", Arity::Exact(2), builtin_cons),
        function("car", Arity::Exact(1), builtin_car),
        function("cdr", Arity::Exact(1), builtin_cdr),
        function("set-car!", Arity::Exact(2), builtin_set_car),
        function("set-cdr!", Arity::Exact(2), builtin_set_cdr),
        function("list", Arity::Any, builtin_list),
        function("list?", Arity::Exact(1), builtin_is_list),
        function("null?", Arity::Exact(1), builtin_null),
        function("length", Arity::Exact(1), builtin_length),
        function("list-ref", Arity::Exact(2), builtin_list_ref),
        function("append", Arity::Any, builtin_append),
        // Higher-order procedures
        higher_order("map", Arity::Exact(2), builtin_map),
        higher_order("filter", Arity::Exact(2), builtin_filter),
        higher_order("reduce", Arity::Exact(3), builtin_reduce),
        // Special forms
        special_form("define", Arity::AtLeast(2), eval_define),
        special_form("lambda", Arity::AtLeast(2), eval_lambda),
        special_form("if", Arity::Exact(3), eval_if),
        special_form("and", Arity::Any, eval_and),
        special_form("or", Arity::Any, eval_or),
        special_form("not", Arity::Exact(1), eval_not),
        special_form("let", Arity::AtLeast(2), eval_let),
        special_form("set!", Arity::Exact(2), eval_set),
        special_form("del", Arity::Exact(1), eval_del),
        special_form("begin", Arity::AtLeast(1), eval_begin),
        special_form("quote", Arity::Exact(1), eval_quote),
    ]
});

/// Lazy static map from scheme_id to BuiltinOp (private - use find_scheme_op)
static BUILTIN_SCHEME: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter().map(|op| (op.scheme_id, op)).collect()
});

/// Get all builtin operations, procedures and special forms alike
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by its Scheme identifier
pub fn find_scheme_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_SCHEME.get(id).copied()
}

/// Find a special-form keyword
pub(crate) fn find_special_form(id: &str) -> Option<&'static BuiltinOp> {
    find_scheme_op(id).filter(|op| op.is_special_form())
}

/// Find a procedure that belongs in the root frame
pub(crate) fn find_procedure(id: &str) -> Option<&'static BuiltinOp> {
    find_scheme_op(id).filter(|op| !op.is_special_form())
}
