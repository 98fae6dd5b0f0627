//! Tolerant accessors for version-variable upstream JSON.
//!
//! The PVE and PBS APIs return numbers either as JSON numbers or as strings
//! depending on version, and omit optional fields freely. These helpers
//! accept both representations; callers treat `None` as "field absent" and
//! only raise a parse error on a structural mismatch.

use serde_json::Value;

/// Read a float from a number or a numeric string.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read an unsigned integer from a number or a numeric string.
///
/// Floats with a zero fraction are accepted too, PVE reports some byte
/// counters that way.
pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| *f >= 0.0)
                    .map(|f| f as u64)
            })
        }
        _ => None,
    }
}

/// Read a signed integer from a number or a numeric string.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Read a boolean from a bool, a 0/1 number or a "0"/"1"/"true"/"false" string.
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Read a string, stringifying numbers (PBS reports vmids as strings, PVE
/// as integers).
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Field access shorthands over an object.
pub fn field_f64(obj: &Value, name: &str) -> Option<f64> {
    obj.get(name).and_then(as_f64)
}

pub fn field_u64(obj: &Value, name: &str) -> Option<u64> {
    obj.get(name).and_then(as_u64)
}

pub fn field_i64(obj: &Value, name: &str) -> Option<i64> {
    obj.get(name).and_then(as_i64)
}

pub fn field_bool(obj: &Value, name: &str) -> Option<bool> {
    obj.get(name).and_then(as_bool)
}

pub fn field_string(obj: &Value, name: &str) -> Option<String> {
    obj.get(name).and_then(as_string)
}
