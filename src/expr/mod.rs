//! Expression evaluator for skip-logic, validation and eligibility scripts.
//!
//! `evaluate` is a pure function over a variable context: the same
//! script/context pair always yields the same result and has no side
//! effects, so it is safe to re-run on every navigation step (visibility is
//! re-evaluated, never cached) and from live debugging tools.
//!
//! Strict mode: an undefined variable, an undefined function, or a parse
//! failure produce a typed [`EvalError`] rather than a silent default.
//! Fallback policy belongs to the call site — the session engine treats a
//! failing precondition as "skip", a failing validation as "reject", and a
//! failing eligibility script as "not qualifying".

mod parse;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use parse::{BinOp, Expr};

/// Values a script can produce or read from the answer context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
    /// Multi-select answers, as stable option indices in string form.
    List(Vec<String>),
}

/// Variable context a script is evaluated against, keyed by question short
/// name (overlaid by rapid-test ids at the eligibility site).
pub type Context = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("undefined variable: {0}")]
    Variable(String),

    #[error("undefined function: {0}")]
    Method(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("evaluation error: {0}")]
    Other(String),
}

/// Evaluate a script against a context.
pub fn evaluate(script: &str, ctx: &Context) -> Result<Value, EvalError> {
    let expr = parse::parse(script)?;
    eval(&expr, ctx)
}

/// Truthiness coercion used at eligibility call sites: booleans as-is,
/// numbers truthy when non-zero, strings and lists truthy when non-empty.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::List(items) => !items.is_empty(),
    }
}

/// Canonical string form, used when `==`/`!=` compare differing kinds
/// (option indices are numbers on one side, quoted literals on the other).
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Str(s) => s.clone(),
        Value::List(items) => items.join(","),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn as_number(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Str(s) => s
            .parse()
            .map_err(|_| EvalError::Other(format!("not a number: {s:?}"))),
        other => Err(EvalError::Other(format!("expected a number, got {other:?}"))),
    }
}

fn eval(expr: &Expr, ctx: &Context) -> Result<Value, EvalError> {
    match expr {
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Var(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::Variable(name.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, ctx)?))),
        Expr::Neg(inner) => Ok(Value::Number(-as_number(&eval(inner, ctx)?)?)),
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, ctx),
        Expr::Call(name, args) => eval_call(name, args, ctx),
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, ctx: &Context) -> Result<Value, EvalError> {
    // Short-circuit the boolean operators before evaluating the right side.
    match op {
        BinOp::And => {
            if !truthy(&eval(left, ctx)?) {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(truthy(&eval(right, ctx)?)));
        }
        BinOp::Or => {
            if truthy(&eval(left, ctx)?) {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(truthy(&eval(right, ctx)?)));
        }
        _ => {}
    }

    let lhs = eval(left, ctx)?;
    let rhs = eval(right, ctx)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinOp::Lt => Ok(Value::Bool(as_number(&lhs)? < as_number(&rhs)?)),
        BinOp::Le => Ok(Value::Bool(as_number(&lhs)? <= as_number(&rhs)?)),
        BinOp::Gt => Ok(Value::Bool(as_number(&lhs)? > as_number(&rhs)?)),
        BinOp::Ge => Ok(Value::Bool(as_number(&lhs)? >= as_number(&rhs)?)),
        BinOp::Add => Ok(Value::Number(as_number(&lhs)? + as_number(&rhs)?)),
        BinOp::Sub => Ok(Value::Number(as_number(&lhs)? - as_number(&rhs)?)),
        BinOp::Mul => Ok(Value::Number(as_number(&lhs)? * as_number(&rhs)?)),
        BinOp::Div => {
            let divisor = as_number(&rhs)?;
            if divisor == 0.0 {
                return Err(EvalError::Other("division by zero".into()));
            }
            Ok(Value::Number(as_number(&lhs)? / divisor))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => a == b,
        // Differing kinds compare by canonical string form.
        (a, b) => canonical_string(a) == canonical_string(b),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &Context) -> Result<Value, EvalError> {
    let arity = |expected: usize| -> Result<(), EvalError> {
        if args.len() != expected {
            Err(EvalError::Other(format!(
                "{name}() takes {expected} argument(s), got {}",
                args.len()
            )))
        } else {
            Ok(())
        }
    };

    match name {
        "contains" => {
            arity(2)?;
            let haystack = eval(&args[0], ctx)?;
            let needle = canonical_string(&eval(&args[1], ctx)?);
            match haystack {
                Value::List(items) => Ok(Value::Bool(items.iter().any(|i| *i == needle))),
                Value::Str(s) => Ok(Value::Bool(s.contains(&needle))),
                other => Err(EvalError::Other(format!(
                    "contains() expects a list or string, got {other:?}"
                ))),
            }
        }
        "answered" => {
            arity(1)?;
            match eval(&args[0], ctx)? {
                Value::Str(key) => Ok(Value::Bool(ctx.contains_key(&key))),
                other => Err(EvalError::Other(format!(
                    "answered() expects a question name, got {other:?}"
                ))),
            }
        }
        "number" => {
            arity(1)?;
            Ok(Value::Number(as_number(&eval(&args[0], ctx)?)?))
        }
        "length" => {
            arity(1)?;
            match eval(&args[0], ctx)? {
                Value::Str(s) => Ok(Value::Number(s.chars().count() as f64)),
                Value::List(items) => Ok(Value::Number(items.len() as f64)),
                other => Err(EvalError::Other(format!(
                    "length() expects a list or string, got {other:?}"
                ))),
            }
        }
        _ => Err(EvalError::Method(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, Value)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_literal_and_variable() {
        let c = ctx(&[("age", Value::Number(34.0))]);
        assert_eq!(evaluate("age", &c).unwrap(), Value::Number(34.0));
        assert_eq!(evaluate("true", &c).unwrap(), Value::Bool(true));
        assert_eq!(evaluate("'yes'", &c).unwrap(), Value::Str("yes".into()));
    }

    #[test]
    fn test_undefined_variable_is_typed_error() {
        let c = Context::new();
        assert_eq!(
            evaluate("missing == 1", &c),
            Err(EvalError::Variable("missing".into()))
        );
    }

    #[test]
    fn test_undefined_function_is_typed_error() {
        let c = Context::new();
        assert_eq!(
            evaluate("frobnicate(1)", &c),
            Err(EvalError::Method("frobnicate".into()))
        );
    }

    #[test]
    fn test_comparisons_and_logic() {
        let c = ctx(&[
            ("age", Value::Number(20.0)),
            ("consent", Value::Str("yes".into())),
        ]);
        assert_eq!(
            evaluate("age >= 18 && consent == 'yes'", &c).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("age < 18 || consent == 'no'", &c).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(evaluate("!(age < 18)", &c).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_cross_kind_equality_uses_canonical_strings() {
        // A single-choice answer is an option index; scripts compare against
        // quoted literals.
        let c = ctx(&[("hiv_status", Value::Number(2.0))]);
        assert_eq!(
            evaluate("hiv_status == '2'", &c).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("hiv_status == '3'", &c).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_relational_requires_numbers() {
        let c = ctx(&[("consent", Value::Bool(true))]);
        assert!(matches!(
            evaluate("consent > 1", &c),
            Err(EvalError::Other(_))
        ));
    }

    #[test]
    fn test_multi_select_membership() {
        let c = ctx(&[(
            "risk_factors",
            Value::List(vec!["1".into(), "4".into()]),
        )]);
        assert_eq!(
            evaluate("contains(risk_factors, '4')", &c).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("contains(risk_factors, 2)", &c).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_answered_builtin() {
        let c = ctx(&[("q1", Value::Str("x".into()))]);
        assert_eq!(evaluate("answered('q1')", &c).unwrap(), Value::Bool(true));
        assert_eq!(evaluate("answered('q2')", &c).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_arithmetic() {
        let c = ctx(&[("n", Value::Number(6.0))]);
        assert_eq!(evaluate("n * 2 + 1", &c).unwrap(), Value::Number(13.0));
        assert!(matches!(
            evaluate("n / 0", &c),
            Err(EvalError::Other(_))
        ));
    }

    #[test]
    fn test_deterministic_re_evaluation() {
        let c = ctx(&[("a", Value::Number(1.0)), ("b", Value::Str("x".into()))]);
        let script = "a == 1 && contains(b, 'x')";
        let first = evaluate(script, &c).unwrap();
        for _ in 0..10 {
            assert_eq!(evaluate(script, &c).unwrap(), first);
        }
    }

    #[test]
    fn test_truthiness_coercion() {
        assert!(truthy(&Value::Bool(true)));
        assert!(!truthy(&Value::Bool(false)));
        assert!(truthy(&Value::Number(2.0)));
        assert!(!truthy(&Value::Number(0.0)));
        assert!(truthy(&Value::Str("x".into())));
        assert!(!truthy(&Value::Str("".into())));
        assert!(truthy(&Value::List(vec!["1".into()])));
        assert!(!truthy(&Value::List(vec![])));
    }

    #[test]
    fn test_short_circuit_skips_undefined_right_side() {
        let c = Context::new();
        // Right side references an undefined variable but is never reached.
        assert_eq!(
            evaluate("false && missing == 1", &c).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            evaluate("true || missing == 1", &c).unwrap(),
            Value::Bool(true)
        );
    }
}
