//! Dynamic value model for messages, worker data and option bags.
//!
//! Mirrors the value shapes structured clone has to handle: primitives,
//! strings, byte buffers, arrays, ordered string-keyed maps, and channel
//! endpoints. Maps keep insertion order and tolerate duplicate keys at the
//! model level; lookups resolve to the last write.

use crate::channel::MessagePort;
use crate::serialize::SharedBuffer;

/// A structured value that can cross the thread boundary.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// A byte buffer; copied on clone-serialization unless transferred.
    Bytes(SharedBuffer),
    Array(Vec<Value>),
    /// Ordered string-keyed entries. Duplicate keys allowed; last write wins.
    Map(Vec<(String, Value)>),
    /// A channel endpoint. Only crosses the boundary via a transfer list.
    Port(MessagePort),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn map(entries: Vec<(String, Value)>) -> Self {
        Value::Map(entries)
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Value::Bytes(SharedBuffer::new(data))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Last-write-wins lookup on a map value. `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Loose truthiness: the rule option parsing uses for flags like `ref`.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Bytes(_) | Value::Array(_) | Value::Map(_) | Value::Port(_) => true,
        }
    }

    /// Permissive string coercion used when capturing `env`, `argv` and
    /// `execArgv` entries.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Bytes(_) => "[object ArrayBuffer]".to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Map(_) => "[object Object]".to_string(),
            Value::Port(_) => "[object MessagePort]".to_string(),
        }
    }
}

/// Integral doubles render without a fractional part.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            // Buffers compare by contents; a detached buffer equals nothing.
            (Value::Bytes(a), Value::Bytes(b)) => match (a.to_vec(), b.to_vec()) {
                (Ok(x), Ok(y)) => x == y,
                _ => false,
            },
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Port(a), Value::Port(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lookup_is_last_write_wins() {
        let v = Value::map(vec![
            ("a".into(), Value::from(1)),
            ("b".into(), Value::from(2)),
            ("a".into(), Value::from(3)),
        ]);
        assert_eq!(v.get("a"), Some(&Value::from(3)));
        assert_eq!(v.get("b"), Some(&Value::from(2)));
        assert_eq!(v.get("missing"), None);
    }

    #[test]
    fn display_coercion() {
        assert_eq!(Value::from(42.0).to_display_string(), "42");
        assert_eq!(Value::from(1.5).to_display_string(), "1.5");
        assert_eq!(Value::Number(f64::NAN).to_display_string(), "NaN");
        assert_eq!(Value::Undefined.to_display_string(), "undefined");
        assert_eq!(Value::from(true).to_display_string(), "true");
        assert_eq!(
            Value::Array(vec![Value::from(1), Value::from("x")]).to_display_string(),
            "1,x"
        );
        assert_eq!(Value::map(vec![]).to_display_string(), "[object Object]");
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::from(0).truthy());
        assert!(!Value::from("").truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(Value::from("x").truthy());
        assert!(Value::map(vec![]).truthy());
    }

    #[test]
    fn buffers_compare_by_contents() {
        let a = Value::bytes(vec![1, 2, 3]);
        let b = Value::bytes(vec![1, 2, 3]);
        let c = Value::bytes(vec![9]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
