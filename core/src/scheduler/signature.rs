//! Deterministic input signatures
//!
//! Each value renders through a typed fragment so `true`, `"true"` and `1`
//! never collide. Strings and keys are length-prefixed so separators inside
//! them cannot fake a boundary.

use std::fmt::{self, Write};

use crate::value::Value;

/// Elements of a list that contribute to its fragment
pub const SEQUENCE_SAMPLE: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Signature {
    fn from(value: String) -> Self {
        Signature(value)
    }
}

impl From<&str> for Signature {
    fn from(value: &str) -> Self {
        Signature(value.to_string())
    }
}

/// Signature of a named input snapshot. Keys are sorted; keys listed in
/// `excluded` are skipped entirely.
pub fn compute_signature<'a, I>(inputs: I, excluded: &[&str]) -> Signature
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut entries: Vec<(&str, &Value)> = inputs
        .into_iter()
        .filter(|(key, _)| !excluded.contains(key))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::new();
    for (key, value) in entries {
        write_entry(&mut out, key, value);
    }
    Signature(out)
}

fn write_entry(out: &mut String, key: &str, value: &Value) {
    let _ = write!(out, "{}:{}=", key.len(), key);
    write_fragment(out, value);
    out.push(';');
}

/// Typed rendering of one value
pub fn fragment(value: &Value) -> String {
    let mut out = String::new();
    write_fragment(&mut out, value);
    out
}

fn write_fragment(out: &mut String, value: &Value) {
    // Writing into a String cannot fail.
    let _ = match value {
        Value::Null => write!(out, "null"),
        Value::Boolean(b) => write!(out, "bool:{}", b),
        Value::Integer(i) => write!(out, "int:{}", i),
        Value::Float(f) => write!(out, "float:{:?}", f),
        Value::String(s) => write!(out, "str:{}:{}", s.len(), s),
        Value::Bytes(bytes) => write!(out, "bytes:{}:{:016x}", bytes.len(), fnv1a(bytes)),
        Value::List(items) => {
            let _ = write!(out, "seq:{}:[", items.len());
            for (i, item) in items.iter().take(SEQUENCE_SAMPLE).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_fragment(out, item);
            }
            write!(out, "]")
        }
        Value::Map(map) => {
            let _ = write!(out, "map:{}:{{", map.len());
            for (key, item) in map {
                write_entry(out, key, item);
            }
            write!(out, "}}")
        }
        Value::Other(raw) => write!(out, "other:{}", raw),
    };
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    fn sig(pairs: &[(&str, Value)], excluded: &[&str]) -> Signature {
        compute_signature(pairs.iter().map(|(k, v)| (*k, v)), excluded)
    }

    #[test]
    fn test_order_independent() {
        let a = sig(&[("prompt", "cat".into()), ("steps", Value::from(20))], &[]);
        let b = sig(&[("steps", Value::from(20)), ("prompt", "cat".into())], &[]);
        assert_eq!(a, b);

        let mut hashed: HashMap<String, Value> = HashMap::new();
        hashed.insert("steps".into(), Value::from(20));
        hashed.insert("prompt".into(), "cat".into());
        let c = compute_signature(hashed.iter().map(|(k, v)| (k.as_str(), v)), &[]);
        assert_eq!(a, c);
    }

    #[test]
    fn test_type_distinct_fragments() {
        let t = fragment(&Value::Boolean(true));
        let s = fragment(&Value::from("true"));
        let i = fragment(&Value::Integer(1));
        let f = fragment(&Value::Float(1.0));
        assert_ne!(t, s);
        assert_ne!(t, i);
        assert_ne!(s, i);
        assert_ne!(i, f);
    }

    #[test]
    fn test_changed_value_changes_signature() {
        let base = sig(&[("a", Value::from(1)), ("b", "x".into())], &[]);
        assert_ne!(base, sig(&[("a", Value::from(2)), ("b", "x".into())], &[]));
        assert_ne!(base, sig(&[("a", Value::from(1)), ("b", "y".into())], &[]));
    }

    #[test]
    fn test_excluded_keys_are_ignored() {
        let a = sig(&[("a", Value::from(1)), ("seed", Value::from(5))], &["seed"]);
        let b = sig(&[("a", Value::from(1)), ("seed", Value::from(6))], &["seed"]);
        let c = sig(&[("a", Value::from(1))], &[]);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_separators_inside_strings_do_not_collide() {
        let a = sig(&[("a", "x;b=str:1:y".into())], &[]);
        let b = sig(&[("a", "x".into()), ("b", "y".into())], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sequences_sample_first_elements() {
        let long: Vec<Value> = (0..100i64).map(Value::from).collect();
        let mut tail_changed = long.clone();
        tail_changed[50] = Value::from(-1);
        assert_eq!(
            fragment(&Value::List(long.clone())),
            fragment(&Value::List(tail_changed))
        );

        let mut head_changed = long.clone();
        head_changed[3] = Value::from(-1);
        assert_ne!(
            fragment(&Value::List(long.clone())),
            fragment(&Value::List(head_changed))
        );

        let mut longer = long.clone();
        longer.push(Value::Null);
        assert_ne!(fragment(&Value::List(long)), fragment(&Value::List(longer)));
    }

    #[test]
    fn test_bytes_and_maps() {
        let a = fragment(&Value::Bytes(vec![1, 2, 3]));
        let b = fragment(&Value::Bytes(vec![1, 2, 4]));
        assert_ne!(a, b);
        assert!(a.starts_with("bytes:3:"));

        let map: BTreeMap<String, Value> = [("k".to_string(), Value::from(1))].into();
        assert_eq!(fragment(&Value::Map(map)), "map:1:{1:k=int:1;}");
    }

    #[test]
    fn test_signature_is_input_only() {
        let inputs: BTreeMap<String, Value> = [("prompt".to_string(), Value::from("a cat"))].into();
        let first = compute_signature(inputs.iter().map(|(k, v)| (k.as_str(), v)), &[]);
        let second = compute_signature(inputs.iter().map(|(k, v)| (k.as_str(), v)), &[]);
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "6:prompt=str:5:a cat;");
    }
}
