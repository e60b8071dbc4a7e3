//! Line-by-line fixture evaluation.
//!
//! Fixtures are plain program text paired with JSON records of the expected
//! outcome of each line. [`evaluate_lines`] produces the same records from the
//! interpreter, and [`compare_records`] checks one against the other, allowing
//! a small tolerance for floating-point results.

use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ast::Value;
use crate::evaluator::{Frame, evaluate_file, evaluate_with_frame};
use crate::scheme::{parse, tokenize};
use crate::{Error, ErrorPhase};

/// Placeholder projection for values that have no JSON counterpart
pub const OPAQUE_OUTPUT: &str = "SOMETHING";

/// Absolute tolerance when comparing numeric outputs
pub const FLOAT_TOLERANCE: f64 = 1e-6;

/// The recorded outcome of evaluating one line (or one file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

impl LineRecord {
    pub fn success(output: serde_json::Value) -> Self {
        LineRecord {
            expression: None,
            ok: true,
            output: Some(output),
            error_type: None,
            when: None,
        }
    }

    pub fn failure(error: &Error) -> Self {
        LineRecord {
            expression: None,
            ok: false,
            output: None,
            error_type: Some(error.kind().as_str().to_owned()),
            when: Some(error.phase().as_str().to_owned()),
        }
    }

    fn with_expression(mut self, expression: &str) -> Self {
        self.expression = Some(expression.to_owned());
        self
    }

    /// The phase the failure was raised in; records without one mean evaluation.
    pub fn phase(&self) -> &str {
        self.when.as_deref().unwrap_or(ErrorPhase::Eval.as_str())
    }
}

/// JSON projection of a value: numbers and booleans keep their JSON type,
/// proper lists become arrays, anything else becomes [`OPAQUE_OUTPUT`].
pub fn project(value: &Value) -> serde_json::Value {
    match value {
        Value::Number(n) => json!(n),
        Value::Bool(b) => json!(b),
        Value::Float(x) => serde_json::Number::from_f64(*x)
            .map_or_else(|| json!(OPAQUE_OUTPUT), serde_json::Value::Number),
        Value::Nil | Value::Pair(_) => match value.list_items() {
            Some(items) => serde_json::Value::Array(items.iter().map(project).collect()),
            None => json!(OPAQUE_OUTPUT),
        },
        _ => json!(OPAQUE_OUTPUT),
    }
}

/// Evaluate each line of `text` in one shared frame.
///
/// Every line is trimmed and parsed on its own. A line that fails to parse is
/// recorded as a parse-time failure and skipped; the frame is created lazily
/// by the first evaluation.
pub fn evaluate_lines(text: &str) -> Vec<LineRecord> {
    let mut frame: Option<Rc<Frame>> = None;
    text.lines()
        .map(|line| {
            let line = line.trim();
            let record = match parse(&tokenize(line)) {
                Err(err) => LineRecord::failure(&err),
                Ok(expr) => match evaluate_with_frame(&expr, frame.clone()) {
                    Ok((value, next_frame)) => {
                        frame = Some(next_frame);
                        LineRecord::success(project(&value))
                    }
                    Err(err) => LineRecord::failure(&err),
                },
            };
            record.with_expression(line)
        })
        .collect()
}

/// Evaluate a whole program file and record its final value.
pub fn evaluate_file_record(path: impl AsRef<Path>) -> LineRecord {
    match evaluate_file(path) {
        Ok(value) => LineRecord::success(project(&value)),
        Err(err) => LineRecord::failure(&err),
    }
}

fn numbers_match(actual: &serde_json::Number, expected: &serde_json::Number) -> bool {
    match (actual.as_i64(), expected.as_i64()) {
        (Some(a), Some(b)) => a == b,
        (None, None) => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= FLOAT_TOLERANCE,
            _ => false,
        },
        // int vs float is a type mismatch
        _ => false,
    }
}

/// Compare an actual record with an expected one, describing any mismatch.
pub fn compare_records(actual: &LineRecord, expected: &LineRecord) -> Result<(), String> {
    match (actual.ok, expected.ok) {
        (true, false) => Err(format!(
            "expected {} to be raised, but got {:?}",
            expected.error_type.as_deref().unwrap_or("an error"),
            actual.output
        )),
        (false, true) => Err(format!(
            "did not expect an error (got {}), expected {:?}",
            actual.error_type.as_deref().unwrap_or("an error"),
            expected.output
        )),
        (true, true) => {
            let matches = match (&actual.output, &expected.output) {
                (Some(serde_json::Value::Number(a)), Some(serde_json::Value::Number(b))) => {
                    numbers_match(a, b)
                }
                (a, b) => a == b,
            };
            if matches {
                Ok(())
            } else {
                Err(format!(
                    "output has incorrect value (expected {:?} but got {:?})",
                    expected.output, actual.output
                ))
            }
        }
        (false, false) => {
            if actual.error_type != expected.error_type {
                Err(format!(
                    "expected {:?} to be raised, not {:?}",
                    expected.error_type, actual.error_type
                ))
            } else if actual.phase() != expected.phase() {
                Err(format!(
                    "expected error to be raised at {} time, not at {} time",
                    expected.phase(),
                    actual.phase()
                ))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{cons, sym, val};

    #[test]
    fn test_projection() {
        let cases = vec![
            (val(3), json!(3)),
            (val(2.5), json!(2.5)),
            (Value::Nil, json!([])),
            (val([1, 2]), json!([1, 2])),
            (val(vec![val([1]), val(2.0)]), json!([[1], 2.0])),
            (val(true), json!(true)),
            (val(vec![val(false), val(0)]), json!([false, 0])),
            (sym("x"), json!("SOMETHING")),
            (cons(val(1), val(2)), json!("SOMETHING")),
            (val(vec![sym("a"), val(1)]), json!(["SOMETHING", 1])),
            (val(f64::NAN), json!("SOMETHING")),
        ];
        for (value, expected) in cases {
            assert_eq!(project(&value), expected, "projection of {value}");
        }
    }

    #[test]
    fn test_evaluate_lines_shares_one_frame() {
        let records = evaluate_lines("(define x 2)\n(+ x 1)\n(car ())\n(+ x\nundefined\n(list x x)");
        let rendered: Vec<serde_json::Value> = records
            .iter()
            .map(|record| serde_json::to_value(record).unwrap())
            .collect();
        assert_eq!(
            rendered,
            vec![
                json!({"expression": "(define x 2)", "ok": true, "output": 2}),
                json!({"expression": "(+ x 1)", "ok": true, "output": 3}),
                json!({"expression": "(car ())", "ok": false, "type": "SchemeEvaluationError", "when": "eval"}),
                json!({"expression": "(+ x", "ok": false, "type": "SchemeSyntaxError", "when": "parse"}),
                json!({"expression": "undefined", "ok": false, "type": "SchemeNameError", "when": "eval"}),
                json!({"expression": "(list x x)", "ok": true, "output": [2, 2]}),
            ]
        );
    }

    #[test]
    fn test_booleans_keep_their_json_type() {
        let outputs: Vec<_> = evaluate_lines("(< 1 2)\n(not 1)\n(list (null? ()) 3)")
            .into_iter()
            .map(|record| record.output)
            .collect();
        assert_eq!(
            outputs,
            vec![Some(json!(true)), Some(json!(false)), Some(json!([true, 3]))]
        );
    }

    #[test]
    fn test_failed_first_line_still_gets_a_frame_later() {
        let records = evaluate_lines("nope\n(define y 1)\ny");
        assert!(!records[0].ok);
        assert_eq!(records[2].output, Some(json!(1)));
    }

    #[test]
    fn test_compare_records() {
        let parse = |text: &str| -> LineRecord { serde_json::from_str(text).unwrap() };

        assert!(compare_records(&parse(r#"{"ok": true, "output": 1.0000001}"#), &parse(r#"{"ok": true, "output": 1.0}"#)).is_ok());
        assert!(compare_records(&parse(r#"{"ok": true, "output": 1}"#), &parse(r#"{"ok": true, "output": 1.0}"#)).is_err());
        assert!(compare_records(&parse(r#"{"ok": true, "output": true}"#), &parse(r#"{"ok": true, "output": true}"#)).is_ok());
        assert!(compare_records(&parse(r#"{"ok": true, "output": true}"#), &parse(r#"{"ok": true, "output": 1}"#)).is_err());
        assert!(compare_records(&parse(r#"{"ok": true, "output": [false]}"#), &parse(r#"{"ok": true, "output": [0]}"#)).is_err());
        assert!(compare_records(&parse(r#"{"ok": true, "output": [1, 2]}"#), &parse(r#"{"ok": true, "output": [1, 2]}"#)).is_ok());
        assert!(compare_records(&parse(r#"{"ok": true, "output": 1}"#), &parse(r#"{"ok": false, "type": "SchemeNameError"}"#)).is_err());
        assert!(
            compare_records(
                &parse(r#"{"ok": false, "type": "SchemeNameError", "when": "eval"}"#),
                &parse(r#"{"ok": false, "type": "SchemeNameError"}"#)
            )
            .is_ok()
        );
        assert!(
            compare_records(
                &parse(r#"{"ok": false, "type": "SchemeSyntaxError", "when": "eval"}"#),
                &parse(r#"{"ok": false, "type": "SchemeSyntaxError", "when": "parse"}"#)
            )
            .is_err()
        );
    }
}
