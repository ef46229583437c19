//! Comparison functions

use std::cmp::Ordering;

use serde_json::Value;

use super::{Args, Dispatch, Registry};
use crate::error::{ExprResult, ExpressionError};
use crate::host::ExpressionHost;
use crate::value::{type_name, values_equal};

pub(super) fn register(r: &mut Registry) {
    r.insert("equals", Dispatch::Eager(equals));
    r.insert("greater", Dispatch::Eager(greater));
    r.insert("greaterorequals", Dispatch::Eager(greater_or_equals));
    r.insert("less", Dispatch::Eager(less));
    r.insert("lessorequals", Dispatch::Eager(less_or_equals));
}

fn equals(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    Ok(Value::Bool(values_equal(args.value(0)?, args.value(1)?)))
}

/// Ordering of two ints or two strings (ordinal)
fn compare(args: &Args<'_>) -> ExprResult<Ordering> {
    args.exactly(2)?;
    let (a, b) = (args.value(0)?, args.value(1)?);
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Ok(x.cmp(&y)),
            _ => x
                .as_f64()
                .zip(y.as_f64())
                .and_then(|(x, y)| x.partial_cmp(&y))
                .ok_or_else(|| {
                    ExpressionError::invalid_argument(args.function(), "values are not comparable")
                }),
        },
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(ExpressionError::TypeMismatch {
            context: format!("arguments of '{}'", args.function()),
            expected: "two ints or two strings".into(),
            found: format!("{} and {}", type_name(a), type_name(b)),
        }),
    }
}

fn greater(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    Ok(Value::Bool(compare(args)? == Ordering::Greater))
}

fn greater_or_equals(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    Ok(Value::Bool(compare(args)? != Ordering::Less))
}

fn less(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    Ok(Value::Bool(compare(args)? == Ordering::Less))
}

fn less_or_equals(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    Ok(Value::Bool(compare(args)? != Ordering::Greater))
}
