//! Collection schemas and the crdt field contract.
//!
//! A collection schema declares its primary key, typed fields, and
//! optionally the path of the embedded crdt field. The crdt field itself has
//! a fixed shape ([`crdt_schema_part`]) which is merged into the collection's
//! effective JSON schema and enforced on every write.

use crate::{error::Result, path::FieldPath, CollectionName, CrdtField, Error};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Upper bound for operation timestamps.
pub const MAX_OPERATION_TIME: f64 = 1_000_000_000_000_000.0;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    fn json_schema(&self) -> Value {
        match self {
            FieldType::String => json!({"type": "string"}),
            FieldType::Int | FieldType::Timestamp => json!({"type": "integer"}),
            FieldType::Float => json!({"type": "number"}),
            FieldType::Bool => json!({"type": "boolean"}),
            FieldType::Json => json!({}),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
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

/// Where a collection keeps its crdt field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtOptions {
    pub field: FieldPath,
}

/// Schema for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Top-level field holding the document ID
    pub primary_key: String,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Crdt configuration, if the collection is crdt-enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crdt: Option<CrdtOptions>,
}

impl CollectionSchema {
    /// Create a new collection schema without a crdt field.
    pub fn new(
        name: impl Into<CollectionName>,
        primary_key: impl Into<String>,
        fields: Vec<FieldDef>,
    ) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            fields,
            crdt: None,
        }
    }

    /// Builder-style method to enable crdt storage at `field`.
    pub fn with_crdt(mut self, field: FieldPath) -> Self {
        self.crdt = Some(CrdtOptions { field });
        self
    }

    /// The configured crdt field path, if any.
    pub fn crdt_field(&self) -> Option<&FieldPath> {
        self.crdt.as_ref().map(|c| &c.field)
    }

    /// Read the primary key of a document.
    pub fn document_id(&self, doc: &Value) -> Result<String> {
        doc.get(&self.primary_key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::MissingPrimaryKey(self.primary_key.clone()))
    }

    /// Validate a full document: primary key, declared fields, and the crdt
    /// field contract when the collection is crdt-enabled.
    pub fn validate_document(&self, doc: &Value) -> Result<()> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::InvalidDocument("document must be an object".into()))?;

        self.document_id(doc)?;
        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        if let Some(path) = self.crdt_field() {
            let crdt = path.get(doc).ok_or_else(|| {
                Error::InvalidCrdtField(format!("document has no crdt field at '{}'", path))
            })?;
            validate_crdt_field(crdt)?;
        }

        Ok(())
    }

    /// The collection's JSON schema with the crdt fragment merged in at the
    /// configured field path.
    pub fn effective_json_schema(&self) -> Result<Value> {
        let mut properties = Map::new();
        properties.insert(self.primary_key.clone(), json!({"type": "string"}));
        for field in &self.fields {
            properties.insert(field.name.clone(), field.field_type.json_schema());
        }

        let mut required = vec![Value::String(self.primary_key.clone())];
        required.extend(
            self.fields
                .iter()
                .filter(|f| f.required)
                .map(|f| Value::String(f.name.clone())),
        );

        let mut schema = json!({
            "title": self.name,
            "primaryKey": self.primary_key,
            "type": "object",
            "properties": properties,
            "required": required,
        });

        if let Some(path) = self.crdt_field() {
            schema["crdt"] = json!({ "field": path.as_str() });
            let mut cursor = &mut schema;
            let (last, parents) = path
                .segments()
                .split_last()
                .ok_or_else(|| Error::InvalidDocument("empty crdt field path".into()))?;
            for segment in parents {
                let node = &mut cursor["properties"][segment.as_str()];
                if node.get("type").is_none() {
                    *node = json!({"type": "object", "properties": {}});
                }
                cursor = node;
            }
            cursor["properties"][last.as_str()] = crdt_schema_part();
            if let Some(Value::Array(required)) = schema.get_mut("required") {
                let root = Value::String(path.root().to_string());
                if !required.contains(&root) {
                    required.push(root);
                }
            }
        }

        Ok(schema)
    }
}

/// The JSON schema fragment every crdt field must satisfy.
pub fn crdt_schema_part() -> Value {
    let operation = json!({
        "type": "object",
        "properties": {
            "body": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "selector": {"type": "object"},
                        "ifMatch": {"type": "object"},
                        "ifNotMatch": {"type": "object"}
                    },
                    "additionalProperties": false
                },
                "minItems": 1
            },
            "creator": {"type": "string"},
            "time": {
                "type": "number",
                "minimum": 1,
                "maximum": MAX_OPERATION_TIME,
                "multipleOf": 0.01
            }
        },
        "additionalProperties": false,
        "required": ["body", "creator", "time"]
    });

    json!({
        "type": "object",
        "properties": {
            "operations": {
                "type": "array",
                "items": {"type": "array", "items": operation}
            },
            // minLength guards against silently storing an empty digest
            "hash": {"type": "string", "minLength": 2}
        },
        "additionalProperties": false,
        "required": ["operations", "hash"]
    })
}

/// Check a crdt field value against [`crdt_schema_part`].
pub fn validate_crdt_field(value: &Value) -> Result<()> {
    parse_crdt_field(value).map(|_| ())
}

/// Decode a crdt field, rejecting logs that [`crdt_schema_part`] would not
/// accept. Use this for every field that arrives from another replica.
pub fn parse_crdt_field(value: &Value) -> Result<CrdtField> {
    let field = CrdtField::from_value(value)?;

    if field.hash.chars().count() < 2 {
        return Err(Error::InvalidCrdtField(
            "hash must be at least 2 characters".into(),
        ));
    }

    for (row_index, row) in field.operations.iter().enumerate() {
        for op in row {
            let at = format!("row {} creator '{}'", row_index, op.creator);
            if op.body.is_empty() {
                return Err(Error::InvalidCrdtField(format!("{}: empty body", at)));
            }
            let parts = op.body.iter().flat_map(|part| {
                [&part.selector, &part.if_match, &part.if_not_match]
                    .into_iter()
                    .flatten()
            });
            for part in parts {
                if !part.is_object() {
                    return Err(Error::InvalidCrdtField(format!(
                        "{}: selector and patches must be objects",
                        at
                    )));
                }
            }
            if !(1.0..=MAX_OPERATION_TIME).contains(&op.time) {
                return Err(Error::InvalidCrdtField(format!(
                    "{}: time {} out of range",
                    at, op.time
                )));
            }
            let hundredths = op.time * 100.0;
            let tolerance = (hundredths.abs() * f64::EPSILON * 4.0).max(1e-6);
            if (hundredths.round() - hundredths).abs() > tolerance {
                return Err(Error::InvalidCrdtField(format!(
                    "{}: time {} has more than two decimals",
                    at, op.time
                )));
            }
        }
    }

    Ok(field)
}
