//! Wire-type registry
//!
//! Maps a `"type"` discriminator to a record shape and performs the
//! MessagePack encode/decode for registered shapes. Built once at startup
//! and shared with the client by handle; there is no process-wide table.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DecodeError, NodetoolError, Result};
use crate::value::{Value, ValueKind};

/// Expected kind of a field on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Any,
    Bool,
    Integer,
    /// Accepts integers too
    Float,
    String,
    Bytes,
    List,
    Map,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match (self, value.kind()) {
            (FieldKind::Any, _) => true,
            (FieldKind::Bool, ValueKind::Boolean) => true,
            (FieldKind::Integer, ValueKind::Integer) => true,
            (FieldKind::Float, ValueKind::Float | ValueKind::Integer) => true,
            (FieldKind::String, ValueKind::String) => true,
            (FieldKind::Bytes, ValueKind::Bytes) => true,
            (FieldKind::List, ValueKind::List) => true,
            (FieldKind::Map, ValueKind::Map) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub optional: bool,
}

/// Field list of a registered record, in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeShape {
    pub discriminator: String,
    pub fields: Vec<FieldSpec>,
}

impl TypeShape {
    pub fn new(discriminator: impl Into<String>) -> Self {
        Self {
            discriminator: discriminator.into(),
            fields: Vec::new(),
        }
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            optional: false,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            optional: true,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A value of a registered shape
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypedRecord {
    pub discriminator: String,
    pub fields: BTreeMap<String, Value>,
}

impl TypedRecord {
    pub fn new(discriminator: impl Into<String>) -> Self {
        Self {
            discriminator: discriminator.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set `name` only when `value` is present
    pub fn with_opt<V: Into<Value>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Result of [`TypeRegistry::decode`]
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Typed(TypedRecord),
    Value(Value),
}

impl Decoded {
    pub fn into_value(self) -> Value {
        match self {
            Decoded::Value(value) => value,
            Decoded::Typed(record) => {
                let mut map = record.fields;
                map.insert("type".to_string(), Value::String(record.discriminator));
                Value::Map(map)
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct TypeRegistry {
    shapes: Arc<RwLock<HashMap<String, Arc<TypeShape>>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shape. Re-registering an identical shape is a no-op; a
    /// different shape under the same discriminator is rejected.
    pub fn register(&self, shape: TypeShape) -> Result<()> {
        if shape.discriminator.is_empty() {
            return Err(NodetoolError::configuration("type discriminator must not be empty"));
        }
        let mut shapes = self.shapes.write();
        if let Some(existing) = shapes.get(&shape.discriminator) {
            if **existing == shape {
                return Ok(());
            }
            return Err(NodetoolError::configuration(format!(
                "type '{}' is already registered with a different shape",
                shape.discriminator
            )));
        }
        shapes.insert(shape.discriminator.clone(), Arc::new(shape));
        Ok(())
    }

    pub fn shape(&self, discriminator: &str) -> Option<Arc<TypeShape>> {
        self.shapes.read().get(discriminator).cloned()
    }

    pub fn is_registered(&self, discriminator: &str) -> bool {
        self.shapes.read().contains_key(discriminator)
    }

    pub fn discriminators(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shapes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate `record` against its shape and lower it to a map value with
    /// `"type"` first, then declared fields in wire order
    pub fn lower(&self, record: &TypedRecord) -> Result<rmpv::Value> {
        let shape = self.shape(&record.discriminator).ok_or_else(|| {
            NodetoolError::serialization(format!(
                "type '{}' is not registered",
                record.discriminator
            ))
        })?;

        if let Some(unknown) = record.fields.keys().find(|name| shape.field(name).is_none()) {
            return Err(NodetoolError::serialization(format!(
                "field '{}' is not part of type '{}'",
                unknown, record.discriminator
            )));
        }

        let mut entries = Vec::with_capacity(shape.fields.len() + 1);
        entries.push((
            rmpv::Value::from("type"),
            rmpv::Value::from(record.discriminator.as_str()),
        ));
        for spec in &shape.fields {
            match record.fields.get(&spec.name) {
                None | Some(Value::Null) if spec.optional => continue,
                None => {
                    return Err(NodetoolError::serialization(format!(
                        "missing required field '{}' on type '{}'",
                        spec.name, record.discriminator
                    )))
                }
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(NodetoolError::serialization(format!(
                            "field '{}' on type '{}' expects {:?}, got {:?}",
                            spec.name,
                            record.discriminator,
                            spec.kind,
                            value.kind()
                        )));
                    }
                    entries.push((rmpv::Value::from(spec.name.as_str()), value.to_payload()));
                }
            }
        }
        Ok(rmpv::Value::Map(entries))
    }

    pub fn encode(&self, record: &TypedRecord) -> Result<Vec<u8>> {
        let payload = self.lower(record)?;
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &payload)
            .map_err(|e| NodetoolError::serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Decode one frame. With a registered `expected` shape the result is a
    /// [`TypedRecord`]; otherwise a generic [`Value`].
    pub fn decode(&self, bytes: &[u8], expected: Option<&str>) -> Result<Decoded, DecodeError> {
        let value = decode_value(bytes)?;
        let shape = match expected.and_then(|name| self.shape(name)) {
            Some(shape) => shape,
            None => return Ok(Decoded::Value(value)),
        };

        let whole = 0..bytes.len();
        if let Some(found) = value.discriminator() {
            if found != shape.discriminator {
                return Err(DecodeError::new(
                    format!("expected type '{}', found '{}'", shape.discriminator, found),
                    whole,
                    bytes,
                ));
            }
        }
        let mut map = match value.into_map() {
            Some(map) => map,
            None => {
                return Err(DecodeError::new(
                    format!("type '{}' must be a map", shape.discriminator),
                    whole,
                    bytes,
                ))
            }
        };

        let mut record = TypedRecord::new(shape.discriminator.clone());
        for spec in &shape.fields {
            match map.remove(&spec.name) {
                Some(value) if spec.kind.accepts(&value) => {
                    record.fields.insert(spec.name.clone(), value);
                }
                Some(Value::Null) | None if spec.optional => {}
                Some(value) => {
                    return Err(DecodeError::new(
                        format!(
                            "field '{}' expects {:?}, got {:?}",
                            spec.name,
                            spec.kind,
                            value.kind()
                        ),
                        whole,
                        bytes,
                    ))
                }
                None => {
                    return Err(DecodeError::new(
                        format!("missing required field '{}'", spec.name),
                        whole,
                        bytes,
                    ))
                }
            }
        }
        Ok(Decoded::Typed(record))
    }

    /// Discriminator a frame should be routed by, if any
    pub fn classify<'a>(&self, value: &'a Value) -> Option<&'a str> {
        value.discriminator()
    }
}

/// Deepest container nesting accepted in an incoming frame
pub const MAX_FRAME_DEPTH: usize = 128;

/// Decode exactly one MessagePack value spanning all of `bytes`. Frames nested
/// deeper than [`MAX_FRAME_DEPTH`] are rejected.
pub fn decode_value(bytes: &[u8]) -> Result<Value, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::new("empty frame", 0..0, bytes));
    }
    let mut cursor = Cursor::new(bytes);
    let payload = match rmpv::decode::read_value_with_max_depth(&mut cursor, MAX_FRAME_DEPTH) {
        Ok(payload) => payload,
        Err(e) => {
            let at = (cursor.position() as usize).min(bytes.len());
            let start = at.saturating_sub(1);
            return Err(DecodeError::new(e.to_string(), start..bytes.len(), bytes));
        }
    };
    let consumed = cursor.position() as usize;
    if consumed < bytes.len() {
        return Err(DecodeError::new(
            format!("{} trailing bytes after frame", bytes.len() - consumed),
            consumed..bytes.len(),
            bytes,
        ));
    }
    Ok(Value::from_payload(payload))
}
