use itertools::Itertools;

/// A structurally comparable value: the universe test inputs, expected
/// outputs and candidate results live in.
///
/// `PartialEq` is [`deep_equal`], so `NaN == NaN` holds and `+0 != -0`.
#[derive(Clone, Debug)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    /// String-keyed mapping. Insertion order is kept for display only.
    Object(Vec<(String, Value)>),
}

/// Deep structural equality with same-value semantics for numbers.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => same_value(*a, *b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    b.iter()
                        .find(|(other_key, _)| other_key == key)
                        .is_some_and(|(_, other)| deep_equal(value, other))
                })
        }
        _ => false,
    }
}

fn same_value(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a == b && a.is_sign_negative() == b.is_sign_negative()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        deep_equal(self, other)
    }
}

impl Value {
    /// Human-readable rendering used in reports: strings as-is, everything
    /// else JSON-like.
    pub fn display(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Undefined => "undefined".to_string(),
            other => other.to_json(),
        }
    }

    /// `JSON.stringify`-compatible rendering.
    pub fn to_json(&self) -> String {
        match self {
            Value::Undefined | Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) if n.is_finite() => format_number(*n),
            Value::Number(_) => "null".to_string(),
            Value::String(s) => quote(s),
            Value::Array(items) => format!("[{}]", items.iter().map(Value::to_json).join(",")),
            Value::Object(entries) => format!(
                "{{{}}}",
                entries
                    .iter()
                    .filter(|(_, value)| !matches!(value, Value::Undefined))
                    .map(|(key, value)| format!("{}:{}", quote(key), value.to_json()))
                    .join(",")
            ),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

/// Formats a number the way the candidate dialect prints it: integers
/// without a fraction, exponent form outside `[1e-6, 1e21)`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if !(1e-6..1e21).contains(&abs) {
        let formatted = format!("{n:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        };
    }
    if n.fract() == 0.0 {
        return format!("{n:.0}");
    }
    format!("{n}")
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(value: serde_json::Value) -> Value {
        value.into()
    }

    #[test]
    fn test_nested_arrays_are_equal() {
        assert!(deep_equal(&v(json!([1, [2, 3]])), &v(json!([1, [2, 3]]))));
    }

    #[test]
    fn test_object_key_order_is_irrelevant() {
        let a = Value::Object(vec![
            ("a".to_string(), Value::Number(1.0)),
            ("b".to_string(), Value::Number(2.0)),
        ]);
        let b = Value::Object(vec![
            ("b".to_string(), Value::Number(2.0)),
            ("a".to_string(), Value::Number(1.0)),
        ]);
        assert!(deep_equal(&a, &b));
    }

    #[test]
    fn test_order_matters_for_arrays() {
        assert!(!deep_equal(&v(json!([1, 2])), &v(json!([2, 1]))));
        assert!(!deep_equal(&v(json!([1, 2])), &v(json!([1, 2, 3]))));
    }

    #[test]
    fn test_type_mismatch_is_inequality() {
        assert!(!deep_equal(&v(json!("1")), &v(json!(1))));
        assert!(!deep_equal(&v(json!(null)), &Value::Undefined));
        assert!(!deep_equal(&v(json!({"0": 1})), &v(json!([1]))));
        assert!(!deep_equal(&v(json!([])), &v(json!({}))));
    }

    #[test]
    fn test_same_value_semantics() {
        assert!(deep_equal(&Value::Number(f64::NAN), &Value::Number(f64::NAN)));
        assert!(!deep_equal(&Value::Number(0.0), &Value::Number(-0.0)));
        assert!(deep_equal(&Value::Number(-0.0), &Value::Number(-0.0)));
    }

    #[test]
    fn test_missing_key_differs_from_undefined_member() {
        let a = Value::Object(vec![("a".to_string(), Value::Undefined)]);
        let b = Value::Object(vec![]);
        assert!(!deep_equal(&a, &b));
    }

    #[test]
    fn test_display() {
        assert_eq!(v(json!([64, 34, 25])).display(), "[64,34,25]");
        assert_eq!(v(json!("plain")).display(), "plain");
        assert_eq!(v(json!(["a"])).display(), "[\"a\"]");
        assert_eq!(Value::Undefined.display(), "undefined");
        assert_eq!(
            Value::Array(vec![Value::Undefined, Value::Number(f64::NAN)]).display(),
            "[null,null]"
        );
        assert_eq!(
            Value::Object(vec![
                ("x".to_string(), Value::Undefined),
                ("y".to_string(), Value::Number(1.5)),
            ])
            .display(),
            "{\"y\":1.5}"
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }
}
