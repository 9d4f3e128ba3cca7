use serde_json::{Map, Number, Value};

/// Marker key the interpreter uses to encode unordered sets.
pub const SET_MARKER: &str = "$set";

/// Structural, type-aware equality between an observed value and an expected one.
///
/// Numbers compare by value (`2 == 2.0`); booleans never equal numbers.
/// Arrays compare element-wise. A `{"$set": [...]}` compares by membership
/// against another set or a plain list.
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_set(actual), as_set(expected)) {
        return same_members(a, b);
    }
    if let Some(a) = as_set(actual) {
        if let Value::Array(b) = expected {
            return same_members(a, b);
        }
    }
    if let Some(b) = as_set(expected) {
        if let Value::Array(a) = actual {
            return same_members(a, b);
        }
    }

    match (actual, expected) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => objects_equal(a, b),
        _ => false,
    }
}

fn as_set(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Object(map) if map.len() == 1 => match map.get(SET_MARKER) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn objects_equal(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| values_equal(value, other)))
}

fn same_members(a: &[Value], b: &[Value]) -> bool {
    let contains = |haystack: &[Value], needle: &Value| haystack.iter().any(|v| values_equal(v, needle));
    a.iter().all(|x| contains(b, x)) && b.iter().all(|y| contains(a, y))
}
