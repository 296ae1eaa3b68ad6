//! Scalar evaluation over [`Value`]s.
//!
//! Used by the partial evaluator for local sub-trees and by the executor for
//! projector expressions computed on the client.

use std::cmp::Ordering;

use querykit_proto::Value;

use super::node::{BinaryOp, Bindings, Expr, ScalarFunction, UnaryOp};
use crate::error::{Error, Result};

/// Evaluate an expression made only of constants, bound variables and
/// scalar operators.
pub fn evaluate(expr: &Expr, bindings: &Bindings) -> Result<Value> {
    match expr {
        Expr::Constant(v) => Ok(v.clone()),
        Expr::Variable(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| Error::evaluation(format!("unbound variable '{}'", name))),
        Expr::Binary(op, left, right) => {
            let l = evaluate(left, bindings)?;
            // Short-circuit like the host language would.
            match (op, l.as_bool()) {
                (BinaryOp::And, Some(false)) => return Ok(Value::Bool(false)),
                (BinaryOp::Or, Some(true)) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let r = evaluate(right, bindings)?;
            binary(*op, &l, &r)
        }
        Expr::Unary(op, operand) => unary(*op, &evaluate(operand, bindings)?),
        Expr::Conditional(test, if_true, if_false) => {
            if truthy(&evaluate(test, bindings)?)? {
                evaluate(if_true, bindings)
            } else {
                evaluate(if_false, bindings)
            }
        }
        Expr::Call(function, args) => {
            let values = args
                .iter()
                .map(|a| evaluate(a, bindings))
                .collect::<Result<Vec<_>>>()?;
            call(*function, &values)
        }
        other => Err(Error::evaluation(format!(
            "expression cannot be evaluated locally: {:?}",
            other
        ))),
    }
}

/// Interpret a value as a condition.
pub fn truthy(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Int32(i) => Ok(*i != 0),
        Value::Int64(i) => Ok(*i != 0),
        other => Err(Error::evaluation(format!("'{}' is not a boolean", other))),
    }
}

/// Compare two values, widening numerics. Null sorts first.
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (a, b) if a.is_numeric() && b.is_numeric() => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        _ => None,
    }
}

/// Equality with numeric widening.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    compare(left, right) == Some(Ordering::Equal)
}

enum Numeric {
    Int32(i32, i32),
    Int64(i64, i64),
    Float(f64, f64),
}

fn promote(left: &Value, right: &Value) -> Option<Numeric> {
    match (left, right) {
        (Value::Int32(a), Value::Int32(b)) => Some(Numeric::Int32(*a, *b)),
        (Value::Float64(_), _) | (_, Value::Float64(_)) => {
            Some(Numeric::Float(left.as_f64()?, right.as_f64()?))
        }
        _ => Some(Numeric::Int64(left.as_i64()?, right.as_i64()?)),
    }
}

/// Apply a binary operator.
pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    if op.is_comparison() {
        let ordering = compare(left, right);
        let result = match op {
            BinaryOp::Equal => ordering == Some(Ordering::Equal),
            BinaryOp::NotEqual => ordering != Some(Ordering::Equal),
            // Ordered comparisons against null are false, as in SQL.
            _ if left.is_null() || right.is_null() => false,
            BinaryOp::LessThan => ordering == Some(Ordering::Less),
            BinaryOp::LessThanOrEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            BinaryOp::GreaterThan => ordering == Some(Ordering::Greater),
            _ => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        };
        return Ok(Value::Bool(result));
    }
    if op.is_logical() {
        let (l, r) = (truthy(left)?, truthy(right)?);
        return Ok(Value::Bool(if op == BinaryOp::And { l && r } else { l || r }));
    }
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if op == BinaryOp::Add {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Ok(Value::String(format!("{}{}", a, b)));
        }
    }
    let overflow = || Error::evaluation(format!("arithmetic overflow in {:?}", op));
    let divide_by_zero = || Error::evaluation("division by zero");
    let numeric = promote(left, right).ok_or_else(|| {
        Error::evaluation(format!(
            "operator {:?} not defined for '{}' and '{}'",
            op, left, right
        ))
    })?;
    let value = match numeric {
        Numeric::Int32(a, b) => Value::Int32(match op {
            BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinaryOp::Subtract => a.checked_sub(b).ok_or_else(overflow)?,
            BinaryOp::Multiply => a.checked_mul(b).ok_or_else(overflow)?,
            BinaryOp::Divide => a.checked_div(b).ok_or_else(divide_by_zero)?,
            _ => a.checked_rem(b).ok_or_else(divide_by_zero)?,
        }),
        Numeric::Int64(a, b) => Value::Int64(match op {
            BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinaryOp::Subtract => a.checked_sub(b).ok_or_else(overflow)?,
            BinaryOp::Multiply => a.checked_mul(b).ok_or_else(overflow)?,
            BinaryOp::Divide => a.checked_div(b).ok_or_else(divide_by_zero)?,
            _ => a.checked_rem(b).ok_or_else(divide_by_zero)?,
        }),
        Numeric::Float(a, b) => Value::Float64(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
            _ => a % b,
        }),
    };
    Ok(value)
}

/// Apply a unary operator.
pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value> {
    let overflow = || Error::evaluation(format!("arithmetic overflow negating '{}'", operand));
    match (op, operand) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, v) => Ok(Value::Bool(!truthy(v)?)),
        (UnaryOp::Negate, Value::Int32(i)) => i.checked_neg().map(Value::Int32).ok_or_else(overflow),
        (UnaryOp::Negate, Value::Int64(i)) => i.checked_neg().map(Value::Int64).ok_or_else(overflow),
        (UnaryOp::Negate, Value::Float64(f)) => Ok(Value::Float64(-f)),
        (UnaryOp::Negate, v) => Err(Error::evaluation(format!("cannot negate '{}'", v))),
    }
}

fn string_arg(function: ScalarFunction, args: &[Value], index: usize) -> Result<Option<String>> {
    match args.get(index) {
        Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Ok(Some(other.to_string())),
        None => Err(Error::evaluation(format!(
            "{:?} expects at least {} arguments",
            function,
            index + 1
        ))),
    }
}

/// Evaluate a scalar function.
pub fn call(function: ScalarFunction, args: &[Value]) -> Result<Value> {
    use ScalarFunction::*;

    if function == Coalesce {
        return Ok(args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null));
    }
    if function == Concat {
        let mut out = String::new();
        for v in args.iter().filter(|v| !v.is_null()) {
            out.push_str(&v.to_string());
        }
        return Ok(Value::String(out));
    }
    if matches!(function, Abs | Round) {
        let overflow = || Error::evaluation(format!("arithmetic overflow in {:?}", function));
        return match args.first() {
            Some(Value::Null) | None => Ok(Value::Null),
            Some(Value::Int32(i)) => i.checked_abs().map(Value::Int32).ok_or_else(overflow),
            Some(Value::Int64(i)) => i.checked_abs().map(Value::Int64).ok_or_else(overflow),
            Some(Value::Float64(f)) if function == Abs => Ok(Value::Float64(f.abs())),
            Some(Value::Float64(f)) => {
                let digits = args.get(1).and_then(Value::as_i64).unwrap_or(0) as i32;
                let scale = 10f64.powi(digits);
                Ok(Value::Float64((f * scale).round() / scale))
            }
            Some(other) => Err(Error::evaluation(format!("{:?} of '{}'", function, other))),
        };
    }

    let Some(s) = string_arg(function, args, 0)? else {
        return Ok(Value::Null);
    };
    let value = match function {
        Upper => Value::String(s.to_uppercase()),
        Lower => Value::String(s.to_lowercase()),
        Trim => Value::String(s.trim().to_string()),
        Length => Value::Int32(s.chars().count() as i32),
        Substring => {
            // One-based start, as in SQL.
            let start = args.get(1).and_then(Value::as_i64).unwrap_or(1).max(1) as usize - 1;
            let chars = s.chars().skip(start);
            match args.get(2).and_then(Value::as_i64) {
                Some(len) => Value::String(chars.take(len.max(0) as usize).collect()),
                None => Value::String(chars.collect()),
            }
        }
        StartsWith | EndsWith | Contains => {
            let Some(needle) = string_arg(function, args, 1)? else {
                return Ok(Value::Null);
            };
            Value::Bool(match function {
                StartsWith => s.starts_with(&needle),
                EndsWith => s.ends_with(&needle),
                _ => s.contains(&needle),
            })
        }
        Coalesce | Concat | Abs | Round => Value::Null,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_promotion() {
        assert_eq!(
            binary(BinaryOp::Add, &Value::Int32(2), &Value::Int32(3)).unwrap(),
            Value::Int32(5)
        );
        assert_eq!(
            binary(BinaryOp::Add, &Value::Int32(2), &Value::Int64(3)).unwrap(),
            Value::Int64(5)
        );
        assert_eq!(
            binary(BinaryOp::Multiply, &Value::Int32(2), &Value::Float64(1.5)).unwrap(),
            Value::Float64(3.0)
        );
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let err = binary(BinaryOp::Divide, &Value::Int32(1), &Value::Int32(0)).unwrap_err();
        assert!(matches!(err, Error::Evaluation(_)));
    }

    #[test]
    fn test_integer_minimum_overflows() {
        for value in [Value::Int32(i32::MIN), Value::Int64(i64::MIN)] {
            let err = unary(UnaryOp::Negate, &value).unwrap_err();
            assert!(matches!(err, Error::Evaluation(_)));
            let err = call(ScalarFunction::Abs, &[value]).unwrap_err();
            assert!(matches!(err, Error::Evaluation(_)));
        }
        assert_eq!(unary(UnaryOp::Negate, &Value::Int32(7)).unwrap(), Value::Int32(-7));
        assert_eq!(call(ScalarFunction::Abs, &[Value::Int64(-7)]).unwrap(), Value::Int64(7));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            binary(BinaryOp::Equal, &Value::Int32(1), &Value::Int64(1)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            binary(BinaryOp::LessThan, &Value::from("a"), &Value::from("b")).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            binary(BinaryOp::GreaterThan, &Value::Null, &Value::Int32(1)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            binary(BinaryOp::Equal, &Value::Null, &Value::Null).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_string_functions() {
        let london = Value::from("London");
        assert_eq!(call(ScalarFunction::Upper, &[london.clone()]).unwrap(), Value::from("LONDON"));
        assert_eq!(call(ScalarFunction::Length, &[london.clone()]).unwrap(), Value::Int32(6));
        assert_eq!(
            call(ScalarFunction::StartsWith, &[london.clone(), Value::from("Lon")]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(ScalarFunction::Substring, &[london, Value::Int32(2), Value::Int32(3)]).unwrap(),
            Value::from("ond")
        );
        assert_eq!(call(ScalarFunction::Upper, &[Value::Null]).unwrap(), Value::Null);
    }

    #[test]
    fn test_evaluate_with_bindings() {
        let expr = Expr::var("x").add(1).mul(Expr::constant(2));
        let bindings = Bindings::new().with("x", 4);
        assert_eq!(evaluate(&expr, &bindings).unwrap(), Value::Int32(10));

        let err = evaluate(&Expr::var("missing"), &bindings).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_short_circuit() {
        // The right side would fail if evaluated.
        let expr = Expr::constant(false).and(Expr::constant(1).div(0));
        assert_eq!(evaluate(&expr, &Bindings::new()).unwrap(), Value::Bool(false));
    }
}
