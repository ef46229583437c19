//! Logical functions
//!
//! `if`, `and` and `or` short-circuit, so they live in the evaluator.

use serde_json::Value;

use super::{Args, Dispatch, Registry};
use crate::error::{ExprResult, ExpressionError};
use crate::host::ExpressionHost;

pub(super) fn register(r: &mut Registry) {
    r.insert("bool", Dispatch::Eager(bool));
    r.insert("not", Dispatch::Eager(not));
    r.insert("true", Dispatch::Eager(true_));
    r.insert("false", Dispatch::Eager(false_));
    r.insert("null", Dispatch::Eager(null));
}

fn bool(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    let b = match args.value(0)? {
        Value::Bool(b) => *b,
        Value::String(s) if s.eq_ignore_ascii_case("true") => true,
        Value::String(s) if s.eq_ignore_ascii_case("false") => false,
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        other => {
            return Err(ExpressionError::type_mismatch(
                "argument 1 of 'bool'",
                "bool, 'true'/'false' or int",
                other,
            ))
        }
    };
    Ok(Value::Bool(b))
}

fn not(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::Bool(!args.bool(0)?))
}

fn true_(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(Value::Bool(true))
}

fn false_(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(Value::Bool(false))
}

fn null(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(Value::Null)
}
