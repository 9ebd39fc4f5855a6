//! Typed codecs and the codec registry.
//!
//! A [`TypeLayout`] binds a type id to an ordered list of fields. Encoding
//! walks the fields in layout order, so the byte representation of a value
//! is deterministic. Decoding walks the same order and substitutes field
//! defaults once the payload runs out, which is what makes adding trailing
//! fields a compatible change.
//!
//! Incompatible changes (renamed, retyped, or reordered fields) alter the
//! layout [fingerprint](TypeLayout::fingerprint), and are caught when a box
//! holding old data is opened against the new registry.

use crate::{error::Result, Error, Fingerprint, TypeId};
use dashmap::DashMap;
use serde_json::Value;

/// Field kinds supported in type layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    /// Arbitrary nested JSON
    Json,
}

impl FieldKind {
    /// Default value substituted for fields absent in older payloads.
    pub fn default_value(&self) -> Value {
        match self {
            FieldKind::String => Value::String(String::new()),
            FieldKind::Int => Value::from(0i64),
            FieldKind::Float => Value::from(0.0f64),
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Json => Value::Null,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Int => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Json => true,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            FieldKind::String => 1,
            FieldKind::Int => 2,
            FieldKind::Float => 3,
            FieldKind::Bool => 4,
            FieldKind::Json => 5,
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::String => write!(f, "String"),
            FieldKind::Int => write!(f, "Int"),
            FieldKind::Float => write!(f, "Float"),
            FieldKind::Bool => write!(f, "Bool"),
            FieldKind::Json => write!(f, "Json"),
        }
    }
}

fn json_kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Definition of one field in a type layout.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldLayout {
    /// Field name
    pub name: String,
    /// Field kind
    pub kind: FieldKind,
    /// Whether the field must be present when encoding
    pub required: bool,
}

impl FieldLayout {
    /// Create a required field.
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    /// Create an optional field. Absent optional fields encode as the
    /// kind's default value.
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// A type descriptor: type id plus ordered field layout.
///
/// The layout drives both directions of the codec and yields the structural
/// fingerprint used for compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeLayout {
    /// Unique type identifier, immutable once registered
    pub type_id: TypeId,
    /// Fields in encoding order
    pub fields: Vec<FieldLayout>,
}

impl TypeLayout {
    /// Create a new type layout.
    pub fn new(type_id: impl Into<TypeId>, fields: Vec<FieldLayout>) -> Self {
        Self {
            type_id: type_id.into(),
            fields,
        }
    }

    /// Structural fingerprint: CRC32 over the canonical field layout.
    ///
    /// Field names, kinds, requiredness, and order all contribute. The type
    /// id itself does not, so two ids may share a layout.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = crc32fast::Hasher::new();
        for field in &self.fields {
            hasher.update(field.name.as_bytes());
            hasher.update(&[0, field.kind.tag(), field.required as u8]);
        }
        hasher.finalize()
    }

    /// Encode a value to bytes, fields in layout order.
    ///
    /// Pure and deterministic: the same value always yields the same bytes.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        let mut out = Vec::new();
        for field in &self.fields {
            let value = match obj.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(Error::MissingRequiredField(field.name.clone()));
                }
                None | Some(Value::Null) => field.kind.default_value(),
                Some(v) if field.kind.matches(v) => v.clone(),
                Some(v) => {
                    return Err(Error::TypeMismatch {
                        field: field.name.clone(),
                        expected: field.kind.to_string(),
                        got: json_kind_name(v).to_string(),
                    });
                }
            };

            let bytes = serde_json::to_vec(&value)
                .map_err(|e| Error::InvalidPayload(e.to_string()))?;
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }

        Ok(out)
    }

    /// Decode bytes back into an object value.
    ///
    /// A payload shorter than the layout is tolerated: trailing fields that
    /// an older writer did not know about come back as their defaults.
    /// Anything else that does not line up is a [`Error::Decode`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let mut map = serde_json::Map::new();
        let mut pos = 0usize;

        for field in &self.fields {
            if pos == bytes.len() {
                // Older payload: remaining fields take their defaults
                map.insert(field.name.clone(), field.kind.default_value());
                continue;
            }

            if bytes.len() - pos < 4 {
                return self.decode_err("torn field length");
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[pos..pos + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            pos += 4;

            if bytes.len() - pos < len {
                return self.decode_err("torn field value");
            }
            let value: Value = serde_json::from_slice(&bytes[pos..pos + len])
                .map_err(|e| Error::Decode {
                    type_id: self.type_id.clone(),
                    reason: e.to_string(),
                })?;
            pos += len;

            map.insert(field.name.clone(), value);
        }

        if pos != bytes.len() {
            return self.decode_err("trailing bytes after last field");
        }

        Ok(Value::Object(map))
    }

    fn decode_err(&self, reason: &str) -> Result<Value> {
        Err(Error::Decode {
            type_id: self.type_id.clone(),
            reason: reason.into(),
        })
    }
}

/// Registry mapping type ids to layouts.
///
/// Constructed explicitly and shared by `Arc`, so tests can run independent
/// registries. A type id binds to exactly one fingerprint for the process
/// lifetime; registering a conflicting layout is a configuration error.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    layouts: DashMap<TypeId, TypeLayout>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type layout.
    ///
    /// Re-registering an identical layout is idempotent. Registering the
    /// same type id with a different fingerprint fails with
    /// [`Error::FingerprintConflict`] rather than silently rebinding.
    pub fn register(&self, layout: TypeLayout) -> Result<()> {
        if let Some(existing) = self.layouts.get(&layout.type_id) {
            let registered = existing.fingerprint();
            let offered = layout.fingerprint();
            if registered != offered {
                return Err(Error::FingerprintConflict {
                    type_id: layout.type_id.clone(),
                    registered,
                    offered,
                });
            }
            return Ok(());
        }

        self.layouts.insert(layout.type_id.clone(), layout);
        Ok(())
    }

    /// Whether a type id is registered.
    pub fn contains(&self, type_id: &str) -> bool {
        self.layouts.contains_key(type_id)
    }

    /// Fingerprint currently bound to a type id.
    pub fn fingerprint(&self, type_id: &str) -> Result<Fingerprint> {
        self.layouts
            .get(type_id)
            .map(|l| l.fingerprint())
            .ok_or_else(|| Error::CodecNotRegistered(type_id.into()))
    }

    /// Encode a value for a registered type.
    pub fn encode(&self, type_id: &str, value: &Value) -> Result<Vec<u8>> {
        self.layouts
            .get(type_id)
            .ok_or_else(|| Error::CodecNotRegistered(type_id.into()))?
            .encode(value)
    }

    /// Decode bytes for a registered type.
    pub fn decode(&self, type_id: &str, bytes: &[u8]) -> Result<Value> {
        self.layouts
            .get(type_id)
            .ok_or_else(|| Error::CodecNotRegistered(type_id.into()))?
            .decode(bytes)
    }
}
