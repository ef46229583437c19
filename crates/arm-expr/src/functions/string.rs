//! String functions
//!
//! `uniqueString()` and `guid()` hash their arguments with SHA-256 seeded by
//! the URL namespace GUID, so the same inputs always give the same result.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use serde_json::Value;
use uuid::Uuid;

use super::{Args, Dispatch, Registry};
use crate::error::{ExprResult, ExpressionError};
use crate::host::ExpressionHost;
use crate::value::to_display_string;

const DATA_URI_PREFIX: &str = "data:text/plain;charset=utf8;base64,";

/// Upper bound for padded output: `padLeft` length, `format` widths and precision
const MAX_PADDED_LENGTH: usize = 16_384;

pub(super) fn register(r: &mut Registry) {
    r.insert("base64", Dispatch::Eager(base64));
    r.insert("base64tojson", Dispatch::Eager(base64_to_json));
    r.insert("base64tostring", Dispatch::Eager(base64_to_string));
    r.insert("datauri", Dispatch::Eager(data_uri));
    r.insert("datauritostring", Dispatch::Eager(data_uri_to_string));
    r.insert("endswith", Dispatch::Eager(ends_with));
    r.insert("format", Dispatch::Eager(format));
    r.insert("guid", Dispatch::Eager(guid));
    r.insert("newguid", Dispatch::Eager(new_guid));
    r.insert("padleft", Dispatch::Eager(pad_left));
    r.insert("replace", Dispatch::Eager(replace));
    r.insert("split", Dispatch::Eager(split));
    r.insert("startswith", Dispatch::Eager(starts_with));
    r.insert("string", Dispatch::Eager(string));
    r.insert("substring", Dispatch::Eager(substring));
    r.insert("tolower", Dispatch::Eager(to_lower));
    r.insert("toupper", Dispatch::Eager(to_upper));
    r.insert("trim", Dispatch::Eager(trim));
    r.insert("uniquestring", Dispatch::Eager(unique_string_fn));
    r.insert("uri", Dispatch::Eager(uri));
    r.insert("uricomponent", Dispatch::Eager(uri_component));
    r.insert("uricomponenttostring", Dispatch::Eager(uri_component_to_string));
    r.insert("utcnow", Dispatch::Eager(utc_now));
}

// ============================================================================
// Hashing
// ============================================================================

fn unique_hash<S: AsRef<str>>(parts: &[S]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::NAMESPACE_URL.to_bytes_le());
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    hasher.finalize().into()
}

/// 13 character deterministic hash of the inputs
pub fn unique_string<S: AsRef<str>>(parts: &[S]) -> String {
    let hash = unique_hash(parts);
    let mut out = hex::encode(&hash[..7]);
    out.truncate(13);
    out
}

/// Deterministic GUID built from the first 16 bytes of the hash
pub fn guid_from_args<S: AsRef<str>>(parts: &[S]) -> Uuid {
    let hash = unique_hash(parts);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    Uuid::from_bytes_le(bytes)
}

fn string_args<'a>(args: &'a Args<'_>) -> ExprResult<Vec<&'a str>> {
    (0..args.len()).map(|i| args.string(i)).collect()
}

fn unique_string_fn(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(1, None)?;
    Ok(Value::String(unique_string(&string_args(args)?)))
}

fn guid(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(1, None)?;
    Ok(Value::String(guid_from_args(&string_args(args)?).to_string()))
}

fn new_guid(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(Value::String(host.new_guid().to_string()))
}

// ============================================================================
// Encoding
// ============================================================================

fn decode_base64(function: &str, input: &str) -> ExprResult<String> {
    let bytes = STANDARD
        .decode(input)
        .map_err(|e| ExpressionError::invalid_argument(function, e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ExpressionError::invalid_argument(function, e.to_string()))
}

fn base64(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::String(STANDARD.encode(args.string(0)?)))
}

fn base64_to_string(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    decode_base64("base64ToString", args.string(0)?).map(Value::String)
}

fn base64_to_json(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    let text = decode_base64("base64ToJson", args.string(0)?)?;
    serde_json::from_str(&text)
        .map_err(|e| ExpressionError::invalid_argument("base64ToJson", e.to_string()))
}

fn data_uri(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::String(format!(
        "{}{}",
        DATA_URI_PREFIX,
        STANDARD.encode(to_display_string(args.value(0)?))
    )))
}

fn data_uri_to_string(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    let input = args.string(0)?;
    let (_, payload) = input
        .split_once(";base64,")
        .filter(|(head, _)| head.starts_with("data:"))
        .ok_or_else(|| {
            ExpressionError::invalid_argument("dataUriToString", "expected a base64 data URI")
        })?;
    decode_base64("dataUriToString", payload).map(Value::String)
}

fn uri(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let base = url::Url::parse(args.string(0)?)
        .map_err(|e| ExpressionError::invalid_argument("uri", e.to_string()))?;
    let joined = base
        .join(args.string(1)?)
        .map_err(|e| ExpressionError::invalid_argument("uri", e.to_string()))?;
    Ok(Value::String(joined.to_string()))
}

fn uri_component(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::String(urlencoding::encode(args.string(0)?).into_owned()))
}

fn uri_component_to_string(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    urlencoding::decode(args.string(0)?)
        .map(|s| Value::String(s.into_owned()))
        .map_err(|e| ExpressionError::invalid_argument("uriComponentToString", e.to_string()))
}

// ============================================================================
// Text
// ============================================================================

fn ends_with(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let s = args.string(0)?.to_lowercase();
    Ok(Value::Bool(s.ends_with(&args.string(1)?.to_lowercase())))
}

fn starts_with(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let s = args.string(0)?.to_lowercase();
    Ok(Value::Bool(s.starts_with(&args.string(1)?.to_lowercase())))
}

fn pad_left(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, Some(3))?;
    let value = match args.value(0)? {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_i64() => n.to_string(),
        other => {
            return Err(ExpressionError::type_mismatch(
                "argument 1 of 'padLeft'",
                "string or int",
                other,
            ))
        }
    };
    let total = usize::try_from(args.int(1)?)
        .map_err(|_| ExpressionError::invalid_argument("padLeft", "totalLength must not be negative"))?;
    check_padded_length("padLeft", "totalLength", total)?;
    let pad = match args.get(2) {
        None => ' ',
        Some(_) => {
            let p = args.string(2)?;
            let mut chars = p.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => {
                    return Err(ExpressionError::invalid_argument(
                        "padLeft",
                        "paddingCharacter must be a single character",
                    ))
                }
            }
        }
    };
    let len = value.chars().count();
    if len >= total {
        return Ok(Value::String(value));
    }
    let mut out: String = std::iter::repeat(pad).take(total - len).collect();
    out.push_str(&value);
    Ok(Value::String(out))
}

fn replace(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(3)?;
    let (s, old, new) = (args.string(0)?, args.string(1)?, args.string(2)?);
    if old.is_empty() {
        return Ok(Value::String(s.to_string()));
    }
    Ok(Value::String(s.replace(old, new)))
}

fn split(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(2)?;
    let input = args.string(0)?;
    let delimiters: Vec<String> = match args.value(1)? {
        Value::String(d) => vec![d.clone()],
        Value::Array(items) => items.iter().map(to_display_string).collect(),
        other => {
            return Err(ExpressionError::type_mismatch(
                "argument 2 of 'split'",
                "string or array",
                other,
            ))
        }
    };

    let mut parts = vec![input.to_string()];
    for delimiter in delimiters.iter().filter(|d| !d.is_empty()) {
        parts = parts
            .iter()
            .flat_map(|p| p.split(delimiter.as_str()).map(str::to_string).collect::<Vec<_>>())
            .collect();
    }
    Ok(Value::Array(parts.into_iter().map(Value::String).collect()))
}

fn string(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::String(to_display_string(args.value(0)?)))
}

fn substring(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, Some(3))?;
    let s = args.string(0)?;
    let len = s.chars().count() as i64;
    let start = args.int(1)?;
    let count = match args.get(2) {
        Some(_) => args.int(2)?,
        None => len - start,
    };
    let end = start
        .checked_add(count)
        .ok_or_else(|| ExpressionError::overflow("substring"))?;
    if start < 0 || count < 0 || end > len {
        return Err(ExpressionError::invalid_argument(
            "substring",
            format!(
                "start {} and length {} fall outside a string of length {}",
                start, count, len
            ),
        ));
    }
    Ok(Value::String(
        s.chars().skip(start as usize).take(count as usize).collect(),
    ))
}

fn to_lower(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::String(args.string(0)?.to_lowercase()))
}

fn to_upper(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::String(args.string(0)?.to_uppercase()))
}

fn trim(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    Ok(Value::String(args.string(0)?.trim().to_string()))
}

// ============================================================================
// format()
// ============================================================================

static FORMAT_ITEM: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\{\{|\}\}|\{(\d+)(?:,(-?\d+))?(?::([^}]*))?\}").ok());

/// Composite formatting: `{0}`, `{0,-8}`, `{0:D3}`, `{{` and `}}`
fn format(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(1, None)?;
    let template = args.string(0)?;
    let values = &args.values()[1..];
    let pattern = FORMAT_ITEM
        .as_ref()
        .ok_or_else(|| ExpressionError::invalid_argument("format", "format item pattern is invalid"))?;

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in pattern.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        match whole.as_str() {
            "{{" => out.push('{'),
            "}}" => out.push('}'),
            _ => {
                let index: usize = caps[1].parse().map_err(|_| {
                    ExpressionError::invalid_argument("format", "format item index is too large")
                })?;
                let value = values.get(index).ok_or_else(|| {
                    ExpressionError::invalid_argument(
                        "format",
                        format!("format item {{{}}} has no matching argument", index),
                    )
                })?;
                let text = apply_format_spec(value, caps.get(3).map(|m| m.as_str()))?;
                let width = match caps.get(2) {
                    Some(m) => m.as_str().parse::<i64>().map_err(|_| {
                        ExpressionError::invalid_argument("format", "alignment is too large")
                    })?,
                    None => 0,
                };
                out.push_str(&align(&text, width)?);
            }
        }
    }
    out.push_str(&template[last..]);
    Ok(Value::String(out))
}

fn apply_format_spec(value: &Value, spec: Option<&str>) -> ExprResult<String> {
    let Some(spec) = spec.filter(|s| !s.is_empty()) else {
        return Ok(to_display_string(value));
    };
    let Some(n) = value.as_i64() else {
        return Ok(to_display_string(value));
    };
    let split = spec.chars().next().map_or(0, char::len_utf8);
    let (kind, digits) = spec.split_at(split);
    let digits: usize = if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().unwrap_or(usize::MAX)
    } else {
        0
    };
    if matches!(kind, "D" | "d" | "X" | "x" | "N" | "n") {
        check_padded_length("format", "precision", digits)?;
    }
    Ok(match kind {
        "D" | "d" => {
            let s = format!("{:0width$}", n.unsigned_abs(), width = digits);
            if n < 0 {
                format!("-{}", s)
            } else {
                s
            }
        }
        "X" => format!("{:0width$X}", n, width = digits),
        "x" => format!("{:0width$x}", n, width = digits),
        "N" | "n" => {
            let grouped = group_thousands(n);
            if digits > 0 {
                format!("{}.{}", grouped, "0".repeat(digits))
            } else {
                grouped
            }
        }
        _ => to_display_string(value),
    })
}

fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if n < 0 {
        format!("-{}", out)
    } else {
        out
    }
}

fn align(text: &str, width: i64) -> ExprResult<String> {
    let pad = usize::try_from(width.unsigned_abs()).unwrap_or(usize::MAX);
    check_padded_length("format", "alignment", pad)?;
    let len = text.chars().count();
    if pad <= len {
        return Ok(text.to_string());
    }
    let fill = " ".repeat(pad - len);
    Ok(if width > 0 {
        format!("{}{}", fill, text)
    } else {
        format!("{}{}", text, fill)
    })
}

fn check_padded_length(function: &str, what: &str, length: usize) -> ExprResult<()> {
    if length > MAX_PADDED_LENGTH {
        return Err(ExpressionError::invalid_argument(
            function,
            format!("{} must not exceed {}", what, MAX_PADDED_LENGTH),
        ));
    }
    Ok(())
}

// ============================================================================
// utcNow()
// ============================================================================

const DEFAULT_UTC_FORMAT: &str = "yyyyMMddTHHmmssZ";

fn utc_now(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(0, Some(1))?;
    let format = match args.get(0) {
        Some(Value::String(s)) => s.as_str(),
        Some(other) => {
            return Err(ExpressionError::type_mismatch(
                "argument 1 of 'utcNow'",
                "string",
                other,
            ))
        }
        None => DEFAULT_UTC_FORMAT,
    };
    Ok(Value::String(format_datetime(host.utc_now(), format)))
}

/// Render a .NET style date format string
pub(crate) fn format_datetime(now: DateTime<Utc>, format: &str) -> String {
    match format {
        "u" => return now.format("%Y-%m-%d %H:%M:%SZ").to_string(),
        "s" => return now.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "o" | "O" => return now.format("%Y-%m-%dT%H:%M:%S%.7fZ").to_string(),
        "d" => return now.format("%m/%d/%Y").to_string(),
        _ => {}
    }

    // Longest tokens first so "yyyy" wins over "yy"
    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("fff", "%3f"),
        ("tt", "%p"),
    ];

    let mut pattern = String::new();
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (token, strftime) in TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                pattern.push_str(strftime);
                rest = after;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                pattern.push_str("%%");
            } else {
                pattern.push(c);
            }
        }
        rest = chars.as_str();
    }
    now.format(&pattern).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticHost;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run(f: super::super::FunctionImpl, name: &str, values: Vec<Value>) -> ExprResult<Value> {
        f(&mut StaticHost::new(), &Args::new(name, values))
    }

    #[test]
    fn test_unique_string_is_deterministic() {
        let a = unique_string(&["sub", "rg"]);
        let b = unique_string(&["sub", "rg"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 13);
        assert_ne!(a, unique_string(&["sub", "rg2"]));
    }

    #[test]
    fn test_guid_is_deterministic() {
        let a = run(guid, "guid", vec![json!("a"), json!("b")]).unwrap();
        let b = run(guid, "guid", vec![json!("a"), json!("b")]).unwrap();
        assert_eq!(a, b);
        assert!(Uuid::parse_str(a.as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_base64_round_trip_through_functions() {
        let encoded = run(base64, "base64", vec![json!("one, two")]).unwrap();
        assert_eq!(encoded, json!("b25lLCB0d28="));
        let decoded = run(base64_to_string, "base64ToString", vec![encoded]).unwrap();
        assert_eq!(decoded, json!("one, two"));
    }

    #[test]
    fn test_data_uri() {
        let uri = run(data_uri, "dataUri", vec![json!("Hello")]).unwrap();
        assert_eq!(uri, json!("data:text/plain;charset=utf8;base64,SGVsbG8="));
        let text = run(data_uri_to_string, "dataUriToString", vec![uri]).unwrap();
        assert_eq!(text, json!("Hello"));
    }

    #[test]
    fn test_format_items() {
        let v = run(
            format,
            "format",
            vec![json!("{0}-{1:D3} {{x}} [{2,-4}]"), json!("vm"), json!(7), json!("a")],
        )
        .unwrap();
        assert_eq!(v, json!("vm-007 {x} [a   ]"));
    }

    #[test]
    fn test_format_thousands() {
        let v = run(format, "format", vec![json!("{0:N0}"), json!(8175133)]).unwrap();
        assert_eq!(v, json!("8,175,133"));
    }

    #[test]
    fn test_format_missing_argument() {
        assert!(run(format, "format", vec![json!("{1}"), json!("a")]).is_err());
    }

    #[test]
    fn test_pad_left() {
        assert_eq!(
            run(pad_left, "padLeft", vec![json!("123"), json!(5), json!("0")]).unwrap(),
            json!("00123")
        );
        assert_eq!(run(pad_left, "padLeft", vec![json!(7), json!(3)]).unwrap(), json!("  7"));
    }

    #[test]
    fn test_pad_left_rejects_oversized_length() {
        let err = run(
            pad_left,
            "padLeft",
            vec![json!("x"), json!(9223372036854775807i64), json!("0")],
        )
        .unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidArgument { .. }));
        let at_limit = run(
            pad_left,
            "padLeft",
            vec![json!("x"), json!(MAX_PADDED_LENGTH), json!("0")],
        )
        .unwrap();
        assert_eq!(at_limit.as_str().map(str::len), Some(MAX_PADDED_LENGTH));
    }

    #[test]
    fn test_format_rejects_oversized_width_and_precision() {
        for template in ["{0,2147483647}", "{0,-99999999999999999999}", "{0:D999999999}"] {
            let err = run(format, "format", vec![json!(template), json!(7)]).unwrap_err();
            assert!(
                matches!(err, ExpressionError::InvalidArgument { .. }),
                "{}: {:?}",
                template,
                err
            );
        }
        assert_eq!(
            run(format, "format", vec![json!("[{0,-4}]"), json!("ab")]).unwrap(),
            json!("[ab  ]")
        );
        assert_eq!(
            run(format, "format", vec![json!("{0:é}"), json!(5)]).unwrap(),
            json!("5")
        );
    }

    #[test]
    fn test_substring_bounds() {
        assert_eq!(
            run(substring, "substring", vec![json!("hello"), json!(1), json!(3)]).unwrap(),
            json!("ell")
        );
        assert!(run(substring, "substring", vec![json!("hello"), json!(3), json!(5)]).is_err());
    }

    #[test]
    fn test_split_multiple_delimiters() {
        let v = run(split, "split", vec![json!("a,b;c"), json!([",", ";"])]).unwrap();
        assert_eq!(v, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_starts_and_ends_with_ignore_case() {
        assert_eq!(
            run(starts_with, "startsWith", vec![json!("abcdef"), json!("AB")]).unwrap(),
            json!(true)
        );
        assert_eq!(
            run(ends_with, "endsWith", vec![json!("abcdef"), json!("EF")]).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_uri_and_components() {
        assert_eq!(
            run(uri, "uri", vec![json!("http://contoso.org/firstpath"), json!("myscript.sh")])
                .unwrap(),
            json!("http://contoso.org/myscript.sh")
        );
        let encoded = run(uri_component, "uriComponent", vec![json!("a b/c")]).unwrap();
        assert_eq!(encoded, json!("a%20b%2Fc"));
        let decoded = run(uri_component_to_string, "uriComponentToString", vec![encoded]).unwrap();
        assert_eq!(decoded, json!("a b/c"));
    }

    #[test]
    fn test_utc_now_uses_host_clock() {
        let mut host = StaticHost::new();
        host.now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let v = utc_now(&mut host, &Args::new("utcNow", vec![])).unwrap();
        assert_eq!(v, json!("20240305T140709Z"));
        let v = utc_now(&mut host, &Args::new("utcNow", vec![json!("u")])).unwrap();
        assert_eq!(v, json!("2024-03-05 14:07:09Z"));
        let v = utc_now(&mut host, &Args::new("utcNow", vec![json!("yyyy-MM-dd")])).unwrap();
        assert_eq!(v, json!("2024-03-05"));
    }

    #[test]
    fn test_new_guid_comes_from_host() {
        let mut a = StaticHost::new();
        let mut b = StaticHost::new();
        let x = new_guid(&mut a, &Args::new("newGuid", vec![])).unwrap();
        let y = new_guid(&mut b, &Args::new("newGuid", vec![])).unwrap();
        assert_eq!(x, y);
    }
}
