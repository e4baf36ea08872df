//! Replaying an operation log into a document.
//!
//! Replay order is the recorded order: rows first to last, operations in
//! their stored order inside a row, body parts in order inside an operation.
//! Each body part sees the state accumulated so far. Operations are not
//! assumed to commute, which is why merging must preserve row alignment.

use crate::{
    error::Result, patch::apply_update, query::QueryEngine, CollectionSchema, CrdtField, Error,
    Operation, DELETED_FIELD,
};
use serde_json::{Map, Value};

/// Apply a single operation to `doc`.
pub fn run_operation(
    query: &dyn QueryEngine,
    schema: &CollectionSchema,
    doc: Value,
    operation: &Operation,
) -> Result<Value> {
    operation.body.iter().try_fold(doc, |doc, part| {
        let is_matching = match &part.selector {
            Some(selector) => query.compile(schema, selector)?.matches(&doc),
            None => true,
        };
        let patch = if is_matching {
            part.if_match.as_ref()
        } else {
            part.if_not_match.as_ref()
        };
        match patch {
            Some(update) => apply_update(doc, update),
            None => Ok(doc),
        }
    })
}

/// Project `field` onto a fresh document.
///
/// The replay starts from `{"_deleted": false}` with the crdt field set.
/// When `base` is given its structural fields (internal `_` fields other
/// than `_deleted`, and the primary key) are carried over; its content
/// fields are not, since the log alone defines content.
pub fn rebuild(
    query: &dyn QueryEngine,
    schema: &CollectionSchema,
    base: Option<&Value>,
    field: &CrdtField,
) -> Result<Value> {
    let path = schema
        .crdt_field()
        .ok_or_else(|| Error::UnsupportedSchema(schema.name.clone()))?;

    let mut doc = structural_base(schema, base);
    path.set(&mut doc, field.to_value()?)?;

    field
        .iter_operations()
        .try_fold(doc, |doc, op| run_operation(query, schema, doc, op))
}

fn structural_base(schema: &CollectionSchema, base: Option<&Value>) -> Value {
    let mut doc = Map::new();
    if let Some(Value::Object(fields)) = base {
        for (key, value) in fields {
            let internal = key.starts_with('_') && key != DELETED_FIELD;
            if internal || *key == schema.primary_key {
                doc.insert(key.clone(), value.clone());
            }
        }
    }
    doc.insert(DELETED_FIELD.into(), Value::Bool(false));
    Value::Object(doc)
}

/// Whether a document carries the deletion flag.
pub fn is_deleted(doc: &Value) -> bool {
    doc.get(DELETED_FIELD).and_then(Value::as_bool).unwrap_or(false)
}
