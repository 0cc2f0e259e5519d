//! Schema-less value tree for NodeTool payloads.
//!
//! Output, preview and node-result fields on the wire are open-ended. `Value`
//! wraps any decoded MessagePack payload without failing: shapes it does not
//! recognise become [`Value::Other`] with the raw payload kept for
//! inspection. Accessors are best-effort and return `None` instead of
//! erroring.

use std::collections::BTreeMap;

use base64::Engine;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Bytes,
    List,
    Map,
    Other,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    /// Wide enough for every MessagePack integer (full i64 and u64 ranges)
    Integer(i128),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Anything else (extension types, non-UTF-8 strings), kept verbatim
    Other(rmpv::Value),
}

impl Value {
    /// Wrap a decoded wire payload. Total: never fails.
    ///
    /// Map keys are normalized to strings (`1` becomes `"1"`, nil becomes
    /// `"null"`), so [`Value::to_payload`] of such a map yields string keys. Only
    /// [`Value::Other`] keeps the payload bit-for-bit.
    pub fn from_payload(payload: rmpv::Value) -> Self {
        match payload {
            rmpv::Value::Nil => Value::Null,
            rmpv::Value::Boolean(b) => Value::Boolean(b),
            rmpv::Value::Integer(i) => match (i.as_i64(), i.as_u64()) {
                (Some(v), _) => Value::Integer(v as i128),
                (None, Some(v)) => Value::Integer(v as i128),
                (None, None) => Value::Other(rmpv::Value::Integer(i)),
            },
            rmpv::Value::F32(f) => Value::Float(f as f64),
            rmpv::Value::F64(f) => Value::Float(f),
            rmpv::Value::String(s) => {
                if s.is_str() {
                    match s.into_str() {
                        Some(text) => Value::String(text),
                        None => Value::Null,
                    }
                } else {
                    Value::Other(rmpv::Value::String(s))
                }
            }
            rmpv::Value::Binary(bytes) => Value::Bytes(bytes),
            rmpv::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_payload).collect())
            }
            rmpv::Value::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key_to_string(&key), Value::from_payload(value));
                }
                Value::Map(map)
            }
            other @ rmpv::Value::Ext(..) => Value::Other(other),
        }
    }

    /// Build a value from JSON (CLI inputs, config-provided defaults)
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Boolean(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i as i128)
                } else if let Some(u) = n.as_u64() {
                    Value::Integer(u as i128)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Lower back into a wire payload
    pub fn to_payload(&self) -> rmpv::Value {
        match self {
            Value::Null => rmpv::Value::Nil,
            Value::Boolean(b) => rmpv::Value::Boolean(*b),
            Value::Integer(i) => {
                if let Ok(v) = i64::try_from(*i) {
                    rmpv::Value::from(v)
                } else if let Ok(v) = u64::try_from(*i) {
                    rmpv::Value::from(v)
                } else {
                    // Unreachable for values built from the wire.
                    rmpv::Value::from(*i as f64)
                }
            }
            Value::Float(f) => rmpv::Value::F64(*f),
            Value::String(s) => rmpv::Value::from(s.as_str()),
            Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
            Value::List(items) => rmpv::Value::Array(items.iter().map(Value::to_payload).collect()),
            Value::Map(map) => rmpv::Value::Map(
                map.iter()
                    .map(|(k, v)| (rmpv::Value::from(k.as_str()), v.to_payload()))
                    .collect(),
            ),
            Value::Other(raw) => raw.clone(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Other(_) => ValueKind::Other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The `"type"` field of a map, if present and string-like
    pub fn discriminator(&self) -> Option<&str> {
        match self.get("type")? {
            Value::String(s) => Some(s.as_str()),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Field lookup on a map; `None` for any other kind
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// First present, non-null field among `keys`
    pub fn get_any(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|key| self.get(key))
            .find(|value| !value.is_null())
    }

    pub fn as_list(&self) -> &[Value] {
        match self {
            Value::List(items) => items,
            _ => &[],
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn try_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn try_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => i64::try_from(*i).ok(),
            Value::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn try_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(i) => u64::try_from(*i).ok(),
            _ => self.try_i64().and_then(|i| u64::try_from(i).ok()),
        }
    }

    pub fn try_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Textual form of scalars; `None` for null, bytes and containers
    pub fn try_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Boolean(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn try_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Lower into primitives and containers only. Bytes become base64
    /// strings, unknown payloads their textual form.
    pub fn to_plain(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => {
                if let Ok(v) = i64::try_from(*i) {
                    JsonValue::Number(JsonNumber::from(v))
                } else if let Ok(v) = u64::try_from(*i) {
                    JsonValue::Number(JsonNumber::from(v))
                } else {
                    JsonValue::String(i.to_string())
                }
            }
            Value::Float(f) => JsonNumber::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(f.to_string())),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => {
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_plain).collect()),
            Value::Map(map) => {
                let mut out = JsonMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_plain());
                }
                JsonValue::Object(out)
            }
            Value::Other(raw) => JsonValue::String(raw.to_string()),
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string_pretty(&self.to_plain()).unwrap_or_else(|_| {
            self.try_string().unwrap_or_default()
        })
    }
}

fn key_to_string(key: &rmpv::Value) -> String {
    match key {
        rmpv::Value::Nil => "null".to_string(),
        rmpv::Value::String(s) => match s.as_str() {
            Some(text) => text.to_string(),
            None => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        },
        other => other.to_string(),
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i128)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value as i128)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Integer(value as i128)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl From<rmpv::Value> for Value {
    fn from(value: rmpv::Value) -> Self {
        Value::from_payload(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested_payload() -> rmpv::Value {
        rmpv::Value::Map(vec![
            (rmpv::Value::from("type"), rmpv::Value::from("image")),
            (rmpv::Value::from("uri"), rmpv::Value::from("/assets/1.png")),
            (rmpv::Value::Nil, rmpv::Value::from(1)),
            (rmpv::Value::from(42), rmpv::Value::F32(0.5)),
            (
                rmpv::Value::from("frames"),
                rmpv::Value::Array(vec![
                    rmpv::Value::Binary(vec![0, 1, 2]),
                    rmpv::Value::Ext(7, vec![9, 9]),
                    rmpv::Value::Array(vec![rmpv::Value::Boolean(true)]),
                ]),
            ),
        ])
    }

    #[test]
    fn test_from_payload_normalizes_map_keys() {
        let value = Value::from_payload(nested_payload());
        assert_eq!(value.kind(), ValueKind::Map);
        assert_eq!(value.discriminator(), Some("image"));
        assert_eq!(value.get("uri").and_then(Value::as_str), Some("/assets/1.png"));
        assert_eq!(value.get("null"), Some(&Value::Integer(1)));
        assert_eq!(value.get("42"), Some(&Value::Float(0.5)));
    }

    #[test]
    fn test_from_payload_keeps_exotic_payloads() {
        let value = Value::from_payload(nested_payload());
        let frames = value.get("frames").unwrap().as_list();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Value::Bytes(vec![0, 1, 2]));
        assert_eq!(frames[1], Value::Other(rmpv::Value::Ext(7, vec![9, 9])));
        assert_eq!(frames[2], Value::List(vec![Value::Boolean(true)]));
    }

    #[test]
    fn test_integers_and_floats_stay_distinct() {
        assert_eq!(Value::from_payload(rmpv::Value::from(3)).kind(), ValueKind::Integer);
        assert_eq!(Value::from_payload(rmpv::Value::F64(3.0)).kind(), ValueKind::Float);
        let big = Value::from_payload(rmpv::Value::from(u64::MAX));
        assert_eq!(big, Value::Integer(u64::MAX as i128));
        assert_eq!(big.try_u64(), Some(u64::MAX));
        assert_eq!(big.try_i64(), None);
    }

    #[test]
    fn test_to_plain_preserves_shape() {
        let value = Value::from_payload(nested_payload());
        let plain = value.to_plain();
        assert_eq!(plain["type"], json!("image"));
        assert_eq!(plain["frames"][0], json!("AAEC"));
        assert_eq!(plain["frames"][2], json!([true]));
        assert!(plain["frames"][1].is_string());
        assert_eq!(plain["null"], json!(1));
    }

    #[test]
    fn test_best_effort_accessors() {
        assert_eq!(Value::from("42").try_i64(), Some(42));
        assert_eq!(Value::from("4.5").try_f64(), Some(4.5));
        assert_eq!(Value::from("TRUE").try_bool(), Some(true));
        assert_eq!(Value::from("nope").try_bool(), None);
        assert_eq!(Value::from(2.5).try_i64(), None);
        assert_eq!(Value::from(2.0).try_i64(), Some(2));
        assert_eq!(Value::Bytes(vec![1]).try_string(), None);
        assert_eq!(Value::Null.try_f64(), None);
        assert_eq!(Value::from(7).try_string().as_deref(), Some("7"));
        assert_eq!(Value::from("x").try_bytes(), None);
        assert!(Value::from(1).as_list().is_empty());
        assert!(Value::from(1).get("type").is_none());
    }

    #[test]
    fn test_invalid_utf8_string_becomes_other() {
        // str8 header of length 2 followed by bytes that are not UTF-8
        let raw = rmpv::decode::read_value(&mut &[0xa2u8, 0xff, 0xfe][..]).unwrap();
        assert!(matches!(&raw, rmpv::Value::String(s) if !s.is_str()));
        let value = Value::from_payload(raw.clone());
        assert_eq!(value, Value::Other(raw));
        assert!(value.to_plain().is_string());
    }

    #[test]
    fn test_non_string_map_keys_lower_as_strings() {
        let raw = rmpv::Value::Map(vec![
            (rmpv::Value::from(1), rmpv::Value::from("one")),
            (rmpv::Value::Nil, rmpv::Value::from(true)),
        ]);
        let value = Value::from_payload(raw);
        assert_eq!(value.get("1").and_then(Value::as_str), Some("one"));
        assert_eq!(value.get("null"), Some(&Value::Boolean(true)));

        let lowered = value.to_payload();
        let keys: Vec<_> = lowered
            .as_map()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_str().map(str::to_string))
            .collect();
        assert_eq!(keys, vec![Some("1".to_string()), Some("null".to_string())]);
    }

    #[test]
    fn test_payload_lowering_matches_source() {
        let source = nested_payload();
        let value = Value::from_payload(source);
        let lowered = value.to_payload();
        assert_eq!(Value::from_payload(lowered), value);
    }

    #[test]
    fn test_from_json() {
        let value = Value::from_json(json!({"prompt": "a cat", "steps": 20, "scale": 7.5, "tags": [null]}));
        assert_eq!(value.get("prompt"), Some(&Value::from("a cat")));
        assert_eq!(value.get("steps"), Some(&Value::Integer(20)));
        assert_eq!(value.get("scale"), Some(&Value::Float(7.5)));
        assert_eq!(value.get("tags").unwrap().as_list(), &[Value::Null]);
    }
}
