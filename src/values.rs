/// Normalization and equality for dynamic map payloads.
///
/// `properties` and `discovered` hold heterogeneous JSON-shaped values, and
/// two independently produced values must compare equal whenever they are
/// logically the same. Raw in-memory comparison is not enough: nested maps
/// can carry keys in any order. Everything here therefore goes through a
/// canonical string projection — map keys sorted, list order preserved —
/// which is deterministic: projecting the same logical value twice always
/// yields the same text.
use crate::types::PropertyMap;
use serde_json::Value as JsonValue;
use std::net::IpAddr;

/// Canonical textual form of a JSON value.
///
/// Scalars render as their JSON encoding; arrays keep their order; object
/// keys are sorted. Two values with the same canonical string are treated
/// as equal by the reconciler.
pub fn canonical_string(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Number(n) => out.push_str(&n.to_string()),
        JsonValue::String(s) => {
            // serde_json escaping keeps the projection unambiguous.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn is_primitive(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Array(_) | JsonValue::Object(_))
}

/// Exact numeric equality across integer and float representations.
fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Equality of two `discovered` maps.
///
/// The maps are equal iff they have the same key set and every key maps to
/// an equal value: primitives compare directly (numbers across int/float
/// representations), composites compare by canonical projection.
pub fn discovered_equal(a: &PropertyMap, b: &PropertyMap) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for (key, va) in a {
        let Some(vb) = b.get(key) else {
            return false;
        };
        if !values_identical(va, vb) {
            return false;
        }
    }
    true
}

fn values_identical(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => numbers_equal(x, y),
        _ if is_primitive(a) && is_primitive(b) => a == b,
        _ => canonical_string(a) == canonical_string(b),
    }
}

/// Type-aware equality between an asserted truth value and an observed one.
///
/// Strings compare case-insensitively after trimming (hostname policy);
/// strings that both parse as IP addresses compare as parsed addresses, so
/// textual variants of the same address match. Numbers compare numerically
/// across int/float. Composites compare by canonical projection. A scalar
/// of one type against a scalar of another falls back to a case-insensitive
/// textual comparison, so `"8080"` matches `8080`.
pub fn compare_values(truth: &JsonValue, actual: &JsonValue) -> bool {
    match (truth, actual) {
        (JsonValue::String(t), JsonValue::String(a)) => {
            let t = t.trim();
            let a = a.trim();
            if let (Ok(tip), Ok(aip)) = (t.parse::<IpAddr>(), a.parse::<IpAddr>()) {
                return tip == aip;
            }
            t.eq_ignore_ascii_case(a)
        }
        (JsonValue::Number(t), JsonValue::Number(a)) => numbers_equal(t, a),
        (JsonValue::Bool(t), JsonValue::Bool(a)) => t == a,
        (JsonValue::Null, JsonValue::Null) => true,
        _ if is_primitive(truth) && is_primitive(actual) => {
            scalar_text(truth).eq_ignore_ascii_case(&scalar_text(actual))
        }
        _ => canonical_string(truth) == canonical_string(actual),
    }
}

/// Unquoted textual form of a scalar, for cross-type comparison.
fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        other => canonical_string(other),
    }
}
