//! JSON-compatible values stored in entries
//!
//! Identity arguments, results, pass-through metadata and environment
//! snapshots all use [`Value`]. It mirrors JSON with one extra variant,
//! [`Value::Opaque`], holding the string form of something JSON cannot
//! represent. Opaque values serialize as plain strings, so after a
//! round-trip through the store they come back as [`Value::String`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A JSON-compatible value with an explicit lossy fallback
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// JSON `null`
    #[default]
    Null,
    /// JSON boolean
    Bool(bool),
    /// Finite JSON number
    Number(serde_json::Number),
    /// JSON string
    String(String),
    /// Ordered sequence
    Array(Vec<Value>),
    /// Mapping with sorted keys
    Object(BTreeMap<String, Value>),
    /// Human-readable form of a value JSON cannot represent
    Opaque(String),
}

impl Value {
    /// Wrap the display form of a non-representable value
    #[must_use]
    pub fn opaque(value: impl fmt::Display) -> Self {
        Self::Opaque(value.to_string())
    }

    /// Convert any serializable value, falling back to its `Debug` form
    ///
    /// Serialization failures (maps with non-string keys, failing custom
    /// `Serialize` impls) are not reported; the value becomes
    /// [`Value::Opaque`] instead.
    #[must_use]
    pub fn from_serialize<T: Serialize + fmt::Debug + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => Self::from(json),
            Err(_) => Self::Opaque(format!("{value:?}")),
        }
    }

    /// Look up a key in an object
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Borrow the map of an object
    #[must_use]
    pub const fn as_object(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow the elements of an array
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// String contents, including the text of an opaque value
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Opaque(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, if this is an integral number
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Floating-point value of any number
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Boolean value
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Whether this is `null`
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this holds a stringified fallback
    #[must_use]
    pub const fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) | Self::Opaque(s) => serializer.serialize_str(s),
            Self::Array(items) => items.serialize(serializer),
            Self::Object(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) | Value::Opaque(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

macro_rules! from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Self::Number(serde_json::Number::from(n))
                }
            }
        )*
    };
}

from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        serde_json::Number::from_f64(x).map_or_else(|| Self::opaque(x), Self::Number)
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Self {
        Self::from(f64::from(x))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<K: Into<String>, V: Into<Self>> From<BTreeMap<K, V>> for Value {
    fn from(map: BTreeMap<K, V>) -> Self {
        Self::Object(map.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<Self>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Object(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn non_finite_floats_become_opaque() {
        assert_eq!(Value::from(f64::NAN), Value::Opaque("NaN".to_string()));
        assert_eq!(Value::from(f64::INFINITY), Value::Opaque("inf".to_string()));
        assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn opaque_serializes_as_string() {
        let value = Value::opaque("<socket 0x7f>");
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"<socket 0x7f>\"");

        let back: Value = serde_json::from_str("\"<socket 0x7f>\"").unwrap();
        assert_eq!(back, Value::String("<socket 0x7f>".to_string()));
    }

    #[test]
    fn from_serialize_falls_back_to_debug() {
        // Tuple keys cannot become JSON object keys
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        let value = Value::from_serialize(&map);
        assert!(value.is_opaque());
        assert!(value.as_str().unwrap().contains("(1, 2)"));
    }

    #[test]
    fn from_serialize_keeps_representable_values() {
        #[derive(Debug, Serialize)]
        struct Config {
            alpha: f64,
            name: &'static str,
        }
        let value = Value::from_serialize(&Config {
            alpha: 0.5,
            name: "greedy",
        });
        assert_eq!(value.get("alpha").and_then(Value::as_f64), Some(0.5));
        assert_eq!(value.get("name").and_then(Value::as_str), Some("greedy"));
    }

    #[test]
    fn json_conversion_round_trips() {
        let json = json!({"b": [1, 2.5, null], "a": {"nested": true}, "s": "x"});
        let value = Value::from(json.clone());
        assert_eq!(serde_json::Value::from(value.clone()), json);
        assert_eq!(serde_json::to_value(&value).unwrap(), json);
    }

    #[test]
    fn object_keys_are_sorted() {
        let value: Value = [("z", 1), ("a", 2), ("m", 3)].into_iter().collect();
        assert_eq!(value.to_string(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn option_and_vec_conversions() {
        assert!(Value::from(None::<i32>).is_null());
        assert_eq!(Value::from(Some("x")), Value::from("x"));
        assert_eq!(Value::from(vec![1, 2]).as_array().map(<[Value]>::len), Some(2));
    }
}
