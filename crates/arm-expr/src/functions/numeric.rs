//! Numeric functions
//!
//! Integers are 64-bit and every operation is checked.

use serde_json::{Number, Value};

use super::{Args, Dispatch, Registry};
use crate::error::{ExprResult, ExpressionError};
use crate::host::ExpressionHost;

pub(super) fn register(r: &mut Registry) {
    r.insert("add", Dispatch::Eager(add));
    r.insert("copyindex", Dispatch::Eager(copy_index));
    r.insert("div", Dispatch::Eager(div));
    r.insert("float", Dispatch::Eager(float));
    r.insert("int", Dispatch::Eager(int));
    r.insert("mod", Dispatch::Eager(modulo));
    r.insert("mul", Dispatch::Eager(mul));
    r.insert("sub", Dispatch::Eager(sub));
}

fn binary(
    args: &Args<'_>,
    op: impl Fn(i64, i64) -> Option<i64>,
) -> ExprResult<Value> {
    args.exactly(2)?;
    let (a, b) = (args.int(0)?, args.int(1)?);
    op(a, b)
        .map(Value::from)
        .ok_or_else(|| ExpressionError::overflow(format!("{}({}, {})", args.function(), a, b)))
}

fn add(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    binary(args, i64::checked_add)
}

fn sub(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    binary(args, i64::checked_sub)
}

fn mul(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    binary(args, i64::checked_mul)
}

fn div(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    if args.int(1)? == 0 {
        return Err(ExpressionError::invalid_argument("div", "division by zero"));
    }
    binary(args, i64::checked_div)
}

fn modulo(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    if args.int(1)? == 0 {
        return Err(ExpressionError::invalid_argument("mod", "division by zero"));
    }
    binary(args, i64::checked_rem)
}

/// `copyIndex()`, `copyIndex(offset)`, `copyIndex('loop')`, `copyIndex('loop', offset)`
fn copy_index(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(0, Some(2))?;
    let (loop_name, offset) = match args.values() {
        [] => (None, 0),
        [Value::String(name)] => (Some(name.as_str()), 0),
        [_] => (None, args.int(0)?),
        [_, _] => (Some(args.string(0)?), args.int(1)?),
        _ => (None, 0),
    };
    let index = host.copy_index(loop_name)?;
    index
        .checked_add(offset)
        .map(Value::from)
        .ok_or_else(|| ExpressionError::overflow("copyIndex"))
}

fn int(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    match args.value(0)? {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::from(i)),
            None => {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Ok(Value::from(f.trunc() as i64))
                } else {
                    Err(ExpressionError::overflow("int"))
                }
            }
        },
        Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|e| {
            match e.kind() {
                std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow => {
                    ExpressionError::overflow(format!("int('{}')", s))
                }
                _ => ExpressionError::invalid_argument("int", format!("'{}' is not an integer", s)),
            }
        }),
        other => Err(ExpressionError::type_mismatch(
            "argument 1 of 'int'",
            "int or string",
            other,
        )),
    }
}

fn float(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    let f = match args.value(0)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => {
            return Err(ExpressionError::type_mismatch(
                "argument 1 of 'float'",
                "int or string",
                other,
            ))
        }
    };
    f.and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::invalid_argument("float", "not a finite number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticHost;
    use serde_json::json;

    fn run(f: super::super::FunctionImpl, name: &str, values: Vec<Value>) -> ExprResult<Value> {
        f(&mut StaticHost::new(), &Args::new(name, values))
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(run(add, "add", vec![json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(run(sub, "sub", vec![json!(2), json!(3)]).unwrap(), json!(-1));
        assert_eq!(run(mul, "mul", vec![json!(4), json!(3)]).unwrap(), json!(12));
        assert_eq!(run(div, "div", vec![json!(7), json!(2)]).unwrap(), json!(3));
        assert_eq!(run(modulo, "mod", vec![json!(7), json!(2)]).unwrap(), json!(1));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let err = run(add, "add", vec![json!(i64::MAX), json!(1)]).unwrap_err();
        assert!(matches!(err, ExpressionError::NumericOverflow { .. }));
        let err = run(mul, "mul", vec![json!(i64::MIN), json!(-1)]).unwrap_err();
        assert!(matches!(err, ExpressionError::NumericOverflow { .. }));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(
            run(div, "div", vec![json!(1), json!(0)]),
            Err(ExpressionError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_int_parsing() {
        assert_eq!(run(int, "int", vec![json!(" 42 ")]).unwrap(), json!(42));
        assert!(matches!(
            run(int, "int", vec![json!("99999999999999999999")]),
            Err(ExpressionError::NumericOverflow { .. })
        ));
    }

    #[test]
    fn test_copy_index_with_offset_and_name() {
        let mut host = StaticHost::new()
            .with_copy_index(Some("outer"), 2)
            .with_copy_index(Some("inner"), 5);
        let v = copy_index(&mut host, &Args::new("copyIndex", vec![json!(1)])).unwrap();
        assert_eq!(v, json!(6));
        let v = copy_index(&mut host, &Args::new("copyIndex", vec![json!("outer")])).unwrap();
        assert_eq!(v, json!(2));
        let v = copy_index(&mut host, &Args::new("copyIndex", vec![json!("OUTER"), json!(10)]))
            .unwrap();
        assert_eq!(v, json!(12));
    }

    #[test]
    fn test_copy_index_outside_loop() {
        assert!(matches!(
            run(copy_index, "copyIndex", vec![]),
            Err(ExpressionError::CopyIndexUnavailable { .. })
        ));
    }
}
