//! Helpers over `serde_json::Value` shared by the evaluator and the catalog

use serde_json::{Map, Value};

/// Short type label used in error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// String form used by `string()`, `concat()` and `format()`
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Property lookup: exact key first, then case-insensitive
pub fn get_property<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// Key under which `name` is stored, if present in any casing
pub fn find_key<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    if object.contains_key(name) {
        return object.get_key_value(name).map(|(k, _)| k.as_str());
    }
    object
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .map(|k| k.as_str())
}

/// Deep equality with numeric comparison across int/float representations
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| get_property(y, k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// True for null, empty string, empty array and empty object
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

// ============================================================================
// Placeholder values
// ============================================================================

/// Root of the placeholder returned by `reference()` for resources outside the template
pub const MOCK_RESOURCE: &str = "Resource";

/// Root of the placeholder returned by `list*()` calls
pub const MOCK_SECRET_LIST: &str = "SecretList";

const MOCK_ROOTS: [&str; 2] = [MOCK_RESOURCE, MOCK_SECRET_LIST];

/// Placeholder string `{{<root>}}` standing in for a runtime-only value
pub fn mock(root: &str) -> Value {
    Value::String(format!("{{{{{}}}}}", root))
}

/// Path inside a placeholder produced by [`mock`], e.g. `Resource.sku.name`
pub fn mock_path(value: &Value) -> Option<&str> {
    let inner = value.as_str()?.strip_prefix("{{")?.strip_suffix("}}")?;
    MOCK_ROOTS
        .iter()
        .any(|root| {
            inner
                .strip_prefix(root)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
        })
        .then_some(inner)
}

/// Member access on a placeholder: any property or index yields a deeper placeholder
pub fn mock_member(target: &Value, member: &str) -> Option<Value> {
    mock_path(target).map(|path| Value::String(format!("{{{{{}.{}}}}}", path, member)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_string() {
        assert_eq!(to_display_string(&json!("a")), "a");
        assert_eq!(to_display_string(&json!(12)), "12");
        assert_eq!(to_display_string(&json!(true)), "True");
        assert_eq!(to_display_string(&json!(null)), "");
        assert_eq!(to_display_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_property_lookup_is_case_insensitive() {
        let obj = json!({"Name": 1});
        let map = obj.as_object().unwrap();
        assert_eq!(get_property(map, "name"), Some(&json!(1)));
        assert_eq!(find_key(map, "NAME"), Some("Name"));
        assert_eq!(get_property(map, "missing"), None);
    }

    #[test]
    fn test_values_equal() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"a": [1, 2]}), &json!({"A": [1, 2]})));
        assert!(!values_equal(&json!("a"), &json!("A")));
    }

    #[test]
    fn test_mock_members_extend_the_path() {
        let resource = mock(MOCK_RESOURCE);
        assert_eq!(resource, json!("{{Resource}}"));
        let blob = mock_member(&resource, "primaryEndpoints")
            .and_then(|v| mock_member(&v, "blob"))
            .unwrap();
        assert_eq!(blob, json!("{{Resource.primaryEndpoints.blob}}"));
        assert_eq!(
            mock_member(&mock(MOCK_SECRET_LIST), "keys"),
            Some(json!("{{SecretList.keys}}"))
        );
        assert_eq!(mock_member(&json!("{{Secret}}"), "value"), None);
        assert_eq!(mock_member(&json!("{{Resources}}"), "value"), None);
        assert_eq!(mock_member(&json!("plain"), "value"), None);
    }
}
