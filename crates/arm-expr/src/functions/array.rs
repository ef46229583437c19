//! Array and object functions

use serde_json::{Map, Value};

use super::{Args, Dispatch, Registry};
use crate::error::{ExprResult, ExpressionError};
use crate::host::ExpressionHost;
use crate::value::{find_key, get_property, is_empty, to_display_string, type_name, values_equal};

/// `range()` refuses to build more elements than this
const MAX_RANGE: i64 = 10_000;

pub(super) fn register(r: &mut Registry) {
    r.insert("array", Dispatch::Eager(array));
    r.insert("coalesce", Dispatch::Eager(coalesce));
    r.insert("concat", Dispatch::Eager(concat));
    r.insert("contains", Dispatch::Eager(contains));
    r.insert("createarray", Dispatch::Eager(create_array));
    r.insert("createobject", Dispatch::Eager(create_object));
    r.insert("empty", Dispatch::Eager(empty));
    r.insert("first", Dispatch::Eager(first));
    r.insert("flatten", Dispatch::Eager(flatten));
    r.insert("indexof", Dispatch::Eager(index_of));
    r.insert("intersection", Dispatch::Eager(intersection));
    r.insert("items", Dispatch::Eager(items));
    r.insert("json", Dispatch::Eager(json));
    r.insert("last", Dispatch::Eager(last));
    r.insert("lastindexof", Dispatch::Eager(last_index_of));
    r.insert("length", Dispatch::Eager(length));
    r.insert("max", Dispatch::Eager(max));
    r.insert("min", Dispatch::Eager(min));
    r.insert("objectkeys", Dispatch::Eager(object_keys));
    r.insert("range", Dispatch::Eager(range));
    r.insert("skip", Dispatch::Eager(skip));
    r.insert("take", Dispatch::Eager(take));
    r.insert("union", Dispatch::Eager(union));
}

fn array(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(match args.value(0)? {
        Value::Array(a) => Value::Array(a.clone()),
        other => Value::Array(vec![other.clone()]),
    })
}

fn coalesce(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(1, None)?;
    Ok(args
        .values()
        .iter()
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null))
}

fn concat(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(1, None)?;
    let arrays = args
        .values()
        .iter()
        .find(|v| !v.is_null())
        .is_some_and(Value::is_array);

    if arrays {
        let mut out = Vec::new();
        for (i, v) in args.values().iter().enumerate() {
            match v {
                Value::Array(a) => out.extend(a.iter().cloned()),
                Value::Null => {}
                other => {
                    return Err(ExpressionError::TypeMismatch {
                        context: format!("argument {} of 'concat'", i + 1),
                        expected: "array".into(),
                        found: type_name(other).into(),
                    })
                }
            }
        }
        return Ok(Value::Array(out));
    }

    let mut out = String::new();
    for (i, v) in args.values().iter().enumerate() {
        match v {
            Value::Array(_) | Value::Object(_) => {
                return Err(ExpressionError::TypeMismatch {
                    context: format!("argument {} of 'concat'", i + 1),
                    expected: "string".into(),
                    found: type_name(v).into(),
                })
            }
            other => out.push_str(&to_display_string(other)),
        }
    }
    Ok(Value::String(out))
}

fn contains(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let item = args.value(1)?;
    let found = match args.value(0)? {
        Value::String(s) => s.contains(to_display_string(item).as_str()),
        Value::Array(a) => a.iter().any(|v| values_equal(v, item)),
        Value::Object(o) => find_key(o, &to_display_string(item)).is_some(),
        other => {
            return Err(ExpressionError::type_mismatch(
                "argument 1 of 'contains'",
                "string, array or object",
                other,
            ))
        }
    };
    Ok(Value::Bool(found))
}

fn create_array(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    Ok(Value::Array(args.values().to_vec()))
}

fn create_object(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    if args.len() % 2 != 0 {
        return Err(ExpressionError::invalid_argument(
            "createObject",
            "expects key and value pairs",
        ));
    }
    let mut out = Map::new();
    for i in (0..args.len()).step_by(2) {
        out.insert(args.string(i)?.to_string(), args.value(i + 1)?.clone());
    }
    Ok(Value::Object(out))
}

fn empty(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::Bool(is_empty(args.value(0)?)))
}

fn first(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    match args.value(0)? {
        Value::Array(a) => Ok(a.first().cloned().unwrap_or(Value::Null)),
        Value::String(s) => Ok(Value::String(s.chars().take(1).collect())),
        other => Err(ExpressionError::type_mismatch(
            "argument 1 of 'first'",
            "array or string",
            other,
        )),
    }
}

fn last(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    match args.value(0)? {
        Value::Array(a) => Ok(a.last().cloned().unwrap_or(Value::Null)),
        Value::String(s) => Ok(Value::String(
            s.chars().last().map(String::from).unwrap_or_default(),
        )),
        other => Err(ExpressionError::type_mismatch(
            "argument 1 of 'last'",
            "array or string",
            other,
        )),
    }
}

fn flatten(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    let mut out = Vec::new();
    for item in args.array(0)? {
        match item {
            Value::Array(inner) => out.extend(inner.iter().cloned()),
            other => {
                return Err(ExpressionError::type_mismatch(
                    "element of 'flatten'",
                    "array",
                    other,
                ))
            }
        }
    }
    Ok(Value::Array(out))
}

fn position_of(args: &Args<'_>, from_end: bool) -> ExprResult<Value> {
    args.exactly(2)?;
    let found = match args.value(0)? {
        Value::String(s) => {
            let haystack = s.to_lowercase();
            let needle = args.string(1)?.to_lowercase();
            let byte_pos = if from_end {
                haystack.rfind(&needle)
            } else {
                haystack.find(&needle)
            };
            byte_pos.map(|p| haystack[..p].chars().count())
        }
        Value::Array(a) => {
            let item = args.value(1)?;
            if from_end {
                a.iter().rposition(|v| values_equal(v, item))
            } else {
                a.iter().position(|v| values_equal(v, item))
            }
        }
        other => {
            return Err(ExpressionError::type_mismatch(
                format!("argument 1 of '{}'", args.function()),
                "array or string",
                other,
            ))
        }
    };
    Ok(Value::from(found.map(|p| p as i64).unwrap_or(-1)))
}

fn index_of(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    position_of(args, false)
}

fn last_index_of(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    position_of(args, true)
}

fn intersection(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, None)?;
    match args.value(0)? {
        Value::Array(first) => {
            let mut out: Vec<Value> = Vec::new();
            for item in first {
                let everywhere = (1..args.len()).try_fold(true, |acc, i| {
                    Ok::<_, ExpressionError>(
                        acc && args.array(i)?.iter().any(|v| values_equal(v, item)),
                    )
                })?;
                if everywhere && !out.iter().any(|v| values_equal(v, item)) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }
        Value::Object(first) => {
            let mut out = Map::new();
            for (key, value) in first {
                let everywhere = (1..args.len()).try_fold(true, |acc, i| {
                    Ok::<_, ExpressionError>(
                        acc && get_property(args.object(i)?, key)
                            .is_some_and(|v| values_equal(v, value)),
                    )
                })?;
                if everywhere {
                    out.insert(key.clone(), value.clone());
                }
            }
            Ok(Value::Object(out))
        }
        other => Err(ExpressionError::type_mismatch(
            "argument 1 of 'intersection'",
            "array or object",
            other,
        )),
    }
}

fn union(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, None)?;
    match args.value(0)? {
        Value::Array(_) => {
            let mut out: Vec<Value> = Vec::new();
            for i in 0..args.len() {
                for item in args.array(i)? {
                    if !out.iter().any(|v| values_equal(v, item)) {
                        out.push(item.clone());
                    }
                }
            }
            Ok(Value::Array(out))
        }
        Value::Object(_) => {
            let mut out = Map::new();
            for i in 0..args.len() {
                for (key, value) in args.object(i)? {
                    merge_into(&mut out, key, value);
                }
            }
            Ok(Value::Object(out))
        }
        other => Err(ExpressionError::type_mismatch(
            "argument 1 of 'union'",
            "array or object",
            other,
        )),
    }
}

// Nested objects are merged, anything else is replaced by the later value
fn merge_into(target: &mut Map<String, Value>, key: &str, value: &Value) {
    let Some(existing) = find_key(target, key).map(str::to_string) else {
        target.insert(key.to_string(), value.clone());
        return;
    };
    let Some(slot) = target.get_mut(&existing) else {
        return;
    };
    match (slot, value) {
        (Value::Object(current), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_into(current, k, v);
            }
        }
        (slot, _) => *slot = value.clone(),
    }
}

fn items(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    let mut entries: Vec<(&String, &Value)> = args.object(0)?.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    Ok(Value::Array(
        entries
            .into_iter()
            .map(|(k, v)| serde_json::json!({ "key": k, "value": v }))
            .collect(),
    ))
}

fn json(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    serde_json::from_str(args.string(0)?)
        .map_err(|e| ExpressionError::invalid_argument("json", e.to_string()))
}

fn length(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    let len = match args.value(0)? {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        other => {
            return Err(ExpressionError::type_mismatch(
                "argument 1 of 'length'",
                "string, array or object",
                other,
            ))
        }
    };
    Ok(Value::from(len as i64))
}

fn numbers(args: &Args<'_>) -> ExprResult<Vec<i64>> {
    args.expect(1, None)?;
    let items: &[Value] = match args.values() {
        [Value::Array(a)] => a,
        all => all,
    };
    items
        .iter()
        .map(|v| match v {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| ExpressionError::overflow(args.function().to_string())),
            other => Err(ExpressionError::type_mismatch(
                format!("argument of '{}'", args.function()),
                "int",
                other,
            )),
        })
        .collect()
}

fn max(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    numbers(args)?
        .into_iter()
        .max()
        .map(Value::from)
        .ok_or_else(|| ExpressionError::invalid_argument("max", "no values"))
}

fn min(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    numbers(args)?
        .into_iter()
        .min()
        .map(Value::from)
        .ok_or_else(|| ExpressionError::invalid_argument("min", "no values"))
}

fn object_keys(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::Array(
        args.object(0)?.keys().cloned().map(Value::String).collect(),
    ))
}

fn range(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let start = args.int(0)?;
    let count = args.int(1)?;
    if !(0..=MAX_RANGE).contains(&count) {
        return Err(ExpressionError::invalid_argument(
            "range",
            format!("count must be between 0 and {}", MAX_RANGE),
        ));
    }
    start
        .checked_add(count)
        .ok_or_else(|| ExpressionError::overflow("range"))?;
    Ok(Value::Array((start..start + count).map(Value::from).collect()))
}

fn skip(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let n = args.int(1)?.max(0) as usize;
    match args.value(0)? {
        Value::Array(a) => Ok(Value::Array(a.iter().skip(n).cloned().collect())),
        Value::String(s) => Ok(Value::String(s.chars().skip(n).collect())),
        other => Err(ExpressionError::type_mismatch(
            "argument 1 of 'skip'",
            "array or string",
            other,
        )),
    }
}

fn take(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let n = args.int(1)?.max(0) as usize;
    match args.value(0)? {
        Value::Array(a) => Ok(Value::Array(a.iter().take(n).cloned().collect())),
        Value::String(s) => Ok(Value::String(s.chars().take(n).collect())),
        other => Err(ExpressionError::type_mismatch(
            "argument 1 of 'take'",
            "array or string",
            other,
        )),
    }
}
