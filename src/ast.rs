//! This module defines the value model of the interpreter. The main enum, [`Value`],
//! covers every runtime datum: integers, floats, booleans, symbols, the empty-list
//! sentinel, mutable cons cells ([`Pair`]), built-in procedures and user closures.
//! Parsed programs are represented with the same type, so an expression is just a
//! value that happens to be evaluated.
//!
//! Ergonomic helper functions such as [`val`], [`sym`], [`cons`] and [`nil`] are
//! provided for building values in code and tests. Equality is structural for pairs
//! (two distinct pairs with equal contents compare equal) while closures compare by
//! identity; [`Value::is_same_object`] exposes pair identity when it matters.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::{Error, STACK_GROW_SIZE, STACK_RED_ZONE};
use crate::builtinops::BuiltinOp;
use crate::evaluator::Frame;

/// Type alias for integer values in interpreter
pub(crate) type NumberType = i64;

/// Core value type in interpreter
#[derive(Clone)]
pub enum Value {
    /// Integers
    Number(NumberType),
    /// Floating-point numbers
    Float(f64),
    /// Boolean values
    Bool(bool),
    /// Symbols (identifiers), shared so that cloning expressions is cheap
    Symbol(Rc<str>),
    /// The empty list; proper lists terminate here
    Nil,
    /// A mutable cons cell
    Pair(Rc<Pair>),
    /// Built-in procedures from the static registry
    BuiltinFunction(&'static BuiltinOp),
    /// User-defined procedures (params, body, defining frame)
    Function(Rc<Closure>),
}

/// A cons cell. Both slots can be replaced in place, so a pair's identity is
/// distinct from its contents.
pub struct Pair {
    car: RefCell<Value>,
    cdr: RefCell<Value>,
}

impl Pair {
    pub fn new(car: Value, cdr: Value) -> Self {
        Pair {
            car: RefCell::new(car),
            cdr: RefCell::new(cdr),
        }
    }

    pub fn car(&self) -> Value {
        self.car.borrow().clone()
    }

    pub fn cdr(&self) -> Value {
        self.cdr.borrow().clone()
    }

    pub fn set_car(&self, value: Value) {
        *self.car.borrow_mut() = value;
    }

    pub fn set_cdr(&self, value: Value) {
        *self.cdr.borrow_mut() = value;
    }

    /// Both slots, or `None` while either is borrowed for update.
    pub(crate) fn try_contents(&self) -> Option<(Value, Value)> {
        let car = self.car.try_borrow().ok()?.clone();
        let cdr = self.cdr.try_borrow().ok()?.clone();
        Some((car, cdr))
    }

    /// Empty both slots, handing back what they held.
    pub(crate) fn take_contents(&self) -> Option<(Value, Value)> {
        let mut car = self.car.try_borrow_mut().ok()?;
        let mut cdr = self.cdr.try_borrow_mut().ok()?;
        Some((
            std::mem::replace(&mut *car, Value::Nil),
            std::mem::replace(&mut *cdr, Value::Nil),
        ))
    }
}

// Long or deeply nested lists would otherwise be dropped recursively, one
// native frame per cell.
impl Drop for Pair {
    fn drop(&mut self) {
        let car = std::mem::replace(self.car.get_mut(), Value::Nil);
        let cdr = std::mem::replace(self.cdr.get_mut(), Value::Nil);
        if !matches!(car, Value::Pair(_)) && !matches!(cdr, Value::Pair(_)) {
            return;
        }
        let mut pending = vec![car, cdr];
        while let Some(value) = pending.pop() {
            if let Value::Pair(rc) = value
                && let Ok(mut pair) = Rc::try_unwrap(rc)
            {
                pending.push(std::mem::replace(pair.car.get_mut(), Value::Nil));
                pending.push(std::mem::replace(pair.cdr.get_mut(), Value::Nil));
            }
        }
    }
}

/// A user-defined procedure: formal parameters, a non-empty body and the frame
/// that was current when the `lambda` (or `define` shorthand) was evaluated.
pub struct Closure {
    pub(crate) params: Vec<Rc<str>>,
    pub(crate) body: Rc<[Value]>,
    pub(crate) frame: Rc<Frame>,
}

impl Closure {
    pub(crate) fn new(params: Vec<Rc<str>>, body: Rc<[Value]>, frame: Rc<Frame>) -> Self {
        Closure {
            params,
            body,
            frame,
        }
    }

    pub fn params(&self) -> &[Rc<str>] {
        &self.params
    }

    pub fn body(&self) -> &[Value] {
        &self.body
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Float(x) => write!(f, "Float({x:?})"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Nil => write!(f, "Nil"),
            Value::Pair(_) => write!(f, "Pair({self})"),
            Value::BuiltinFunction(op) => write!(f, "BuiltinFunction({})", op.scheme_id),
            Value::Function(closure) => {
                write!(f, "Function(params={:?})", closure.params)
            }
        }
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Number(n as NumberType)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(NumberType);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::from_vec(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::from_vec(arr.into_iter().map(Into::into).collect())
    }
}

/// Helper function for creating symbols
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Symbol(Rc::from(name.as_ref()))
}

/// Helper function for creating Values from anything convertible
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// The empty list
pub fn nil() -> Value {
    Value::Nil
}

/// Build a fresh pair
pub fn cons(car: Value, cdr: Value) -> Value {
    Value::Pair(Rc::new(Pair::new(car, cdr)))
}

impl Value {
    /// Build a proper list from its elements, right to left.
    pub fn from_vec(items: Vec<Value>) -> Value {
        items
            .into_iter()
            .rev()
            .fold(Value::Nil, |rest, item| cons(item, rest))
    }

    /// Only `#f` is false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_procedure(&self) -> bool {
        matches!(self, Value::BuiltinFunction(_) | Value::Function(_))
    }

    /// Short type description used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "boolean",
            Value::Symbol(_) => "symbol",
            Value::Nil => "empty list",
            Value::Pair(_) => "pair",
            Value::BuiltinFunction(_) | Value::Function(_) => "procedure",
        }
    }

    /// Identity comparison: pairs and closures are the same object only if they
    /// share an allocation; atoms compare by value.
    pub fn is_same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Pair(_) | Value::Function(_), _) | (_, Value::Pair(_) | Value::Function(_)) => {
                false
            }
            _ => self == other,
        }
    }

    pub fn as_pair(&self) -> Option<&Rc<Pair>> {
        match self {
            Value::Pair(pair) => Some(pair),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Rc<str>> {
        match self {
            Value::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Collect the elements of a proper list.
    ///
    /// Returns `None` for anything that is not a `Nil`-terminated, acyclic pair
    /// chain. Cycles are detected by a second cursor advancing at half speed.
    pub fn list_items(&self) -> Option<Vec<Value>> {
        let mut items = Vec::new();
        let mut fast = self.clone();
        let mut slow = self.clone();
        loop {
            let pair = match &fast {
                Value::Nil => return Some(items),
                Value::Pair(pair) => Rc::clone(pair),
                _ => return None,
            };
            items.push(pair.car());
            fast = pair.cdr();

            if items.len() % 2 == 0 {
                if let Value::Pair(behind) = &slow {
                    slow = behind.cdr();
                }
                if let (Value::Pair(a), Value::Pair(b)) = (&slow, &fast)
                    && Rc::ptr_eq(a, b)
                {
                    return None;
                }
            }
        }
    }

    /// Like [`Value::list_items`] but reports a type error naming `context`.
    pub(crate) fn expect_list(&self, context: &str) -> Result<Vec<Value>, Error> {
        self.list_items().ok_or_else(|| {
            Error::TypeError(format!(
                "{context} requires a proper list, got {}",
                self.type_name()
            ))
        })
    }

    pub fn is_list(&self) -> bool {
        self.list_items().is_some()
    }

    fn fmt_guarded(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        active: &mut HashSet<*const Pair>,
    ) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Bool(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Nil => write!(f, "()"),
            Value::BuiltinFunction(op) => write!(f, "#<builtin {}>", op.scheme_id),
            Value::Function(closure) => {
                write!(f, "#<procedure (")?;
                for (i, param) in closure.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ")>")
            }
            Value::Pair(_) => {
                let mut entered = Vec::new();
                let mut cursor = self.clone();
                write!(f, "(")?;
                let result = loop {
                    let Value::Pair(pair) = &cursor else {
                        break Ok(());
                    };
                    let ptr = Rc::as_ptr(pair);
                    if !active.insert(ptr) {
                        let gap = if entered.is_empty() { "" } else { " " };
                        break write!(f, "{gap}...");
                    }
                    entered.push(ptr);
                    if entered.len() > 1 {
                        write!(f, " ")?;
                    }
                    let car = pair.car();
                    stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
                        car.fmt_guarded(f, active)
                    })?;
                    let next = pair.cdr();
                    match next {
                        Value::Pair(_) => cursor = next,
                        Value::Nil => break Ok(()),
                        tail => {
                            write!(f, " . ")?;
                            break tail.fmt_guarded(f, active);
                        }
                    }
                };
                for ptr in entered {
                    active.remove(&ptr);
                }
                result?;
                write!(f, ")")
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_guarded(f, &mut HashSet::new())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Pair(_), Value::Pair(_)) => structurally_equal(self, other, |l, r| l == r),
            (Value::BuiltinFunction(a), Value::BuiltinFunction(b)) => {
                // Compare BuiltinFunctions by id string, not function pointer
                a.scheme_id == b.scheme_id
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false, // Different variants are never equal
        }
    }
}

/// Structural comparison of two values; `atoms_equal` decides every non-pair leaf.
///
/// Pairs are walked with an explicit work list, so nesting depth costs no native
/// stack. A pair of cells that is already being compared is taken as equal, which
/// makes the walk terminate on cyclic structure.
pub(crate) fn structurally_equal(
    a: &Value,
    b: &Value,
    atoms_equal: fn(&Value, &Value) -> bool,
) -> bool {
    let mut pending = vec![(a.clone(), b.clone())];
    let mut seen: HashSet<(*const Pair, *const Pair)> = HashSet::new();
    while let Some((left, right)) = pending.pop() {
        match (&left, &right) {
            (Value::Pair(l), Value::Pair(r)) => {
                if Rc::ptr_eq(l, r) || !seen.insert((Rc::as_ptr(l), Rc::as_ptr(r))) {
                    continue;
                }
                pending.push((l.cdr(), r.cdr()));
                pending.push((l.car(), r.car()));
            }
            (Value::Pair(_), _) | (_, Value::Pair(_)) => return false,
            (l, r) => {
                if !atoms_equal(l, r) {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod helper_function_tests {
    use super::*;

    #[test]
    fn test_helper_functions() {
        assert_eq!(val(42), Value::Number(42));
        assert_eq!(val(2.5), Value::Float(2.5));
        assert_eq!(val(true), Value::Bool(true));
        assert_eq!(sym("foo"), Value::Symbol(Rc::from("foo")));
        assert_eq!(nil(), Value::Nil);

        let list = val([1, 2, 3]);
        assert_eq!(list, cons(val(1), cons(val(2), cons(val(3), nil()))));
        assert_eq!(val(Vec::<Value>::new()), nil());
    }

    #[test]
    fn test_display() {
        let cases = vec![
            (val(42), "42"),
            (val(-7), "-7"),
            (val(3.0), "3.0"),
            (val(0.5), "0.5"),
            (val(true), "#t"),
            (val(false), "#f"),
            (sym("x"), "x"),
            (nil(), "()"),
            (val([1, 2, 3]), "(1 2 3)"),
            (cons(val(1), val(2)), "(1 . 2)"),
            (cons(val(1), cons(val(2), val(3))), "(1 2 . 3)"),
            (val(vec![val([1]), nil(), val([2, 3])]), "((1) () (2 3))"),
        ];
        for (value, expected) in cases {
            assert_eq!(format!("{value}"), expected);
        }
    }

    #[test]
    fn test_display_cyclic_list_terminates() {
        let list = val([1, 2]);
        let Value::Pair(head) = &list else {
            panic!("expected pair");
        };
        let Value::Pair(second) = head.cdr() else {
            panic!("expected pair");
        };
        second.set_cdr(list.clone());
        assert_eq!(format!("{list}"), "(1 2 ...)");
        // Break the cycle so the test does not leak.
        second.set_cdr(nil());
    }

    #[test]
    fn test_structural_equality_and_identity() {
        let a = val([1, 2, 3]);
        let b = val([1, 2, 3]);
        assert_eq!(a, b);
        assert!(!a.is_same_object(&b));
        assert!(a.is_same_object(&a.clone()));
        assert_ne!(val([1, 2]), val([1, 2, 3]));
        assert_ne!(val(1), val(1.0));
        assert!(val(7).is_same_object(&val(7)));
    }

    #[test]
    fn test_deeply_nested_values_display_and_compare() {
        let depth = 100_000;
        let deep = || (0..depth).fold(nil(), |inner, _| cons(inner, nil()));
        let (a, b) = (deep(), deep());

        let text = a.to_string();
        assert_eq!(text.len(), 2 * depth + 2);
        assert!(text.starts_with("(((") && text.ends_with(")))"));
        assert_eq!(a, b);
        assert_ne!(a, cons(val(1), nil()));
    }

    #[test]
    fn test_equality_on_cyclic_lists_terminates() {
        let ring = |items: [i32; 2]| {
            let list = val(items);
            let Value::Pair(head) = &list else {
                panic!("expected pair");
            };
            let Value::Pair(second) = head.cdr() else {
                panic!("expected pair");
            };
            second.set_cdr(list.clone());
            (list, second)
        };
        let (a, a_tail) = ring([1, 2]);
        let (b, b_tail) = ring([1, 2]);
        let (c, c_tail) = ring([1, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, val([1, 2]));

        for tail in [a_tail, b_tail, c_tail] {
            tail.set_cdr(nil());
        }
    }

    #[test]
    fn test_list_items() {
        assert_eq!(nil().list_items(), Some(vec![]));
        assert_eq!(val([1, 2]).list_items(), Some(vec![val(1), val(2)]));
        assert_eq!(cons(val(1), val(2)).list_items(), None);
        assert_eq!(val(5).list_items(), None);

        let list = val([1, 2, 3]);
        let Value::Pair(head) = &list else {
            panic!("expected pair");
        };
        let Value::Pair(second) = head.cdr() else {
            panic!("expected pair");
        };
        let Value::Pair(third) = second.cdr() else {
            panic!("expected pair");
        };
        third.set_cdr(list.clone());
        assert_eq!(list.list_items(), None);
        third.set_cdr(nil());
        assert_eq!(list.list_items().map(|items| items.len()), Some(3));
    }

    #[test]
    fn test_truthiness() {
        assert!(!val(false).is_truthy());
        assert!(val(true).is_truthy());
        assert!(val(0).is_truthy());
        assert!(nil().is_truthy());
    }

    #[test]
    fn test_long_list_drops_without_recursion() {
        let items: Vec<Value> = (0..200_000).map(val).collect();
        let list = Value::from_vec(items);
        drop(list);

        let nested = (0..200_000).fold(nil(), |inner, _| cons(inner, nil()));
        drop(nested);
    }
}
