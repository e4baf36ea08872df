//! Conflict handlers called by the replication engine.
//!
//! When a pushed document state diverges from the master state, the
//! replication engine asks the collection's handler whether the two are
//! equal, and if not, which state both sides should converge on. The
//! handler is bound once, when the collection is created.

use crate::{
    error::Result, hash::HashFunction, merge::merge_fields, path::FieldPath, query::QueryEngine,
    rebuild::rebuild, schema::parse_crdt_field, CollectionSchema, CrdtField, Error,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// The two states handed over by the replication engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInput {
    /// The state the fork wants to write
    pub new_document_state: Value,
    /// The state the master actually has
    pub real_master_state: Value,
}

impl ConflictInput {
    pub fn new(new_document_state: Value, real_master_state: Value) -> Self {
        Self {
            new_document_state,
            real_master_state,
        }
    }
}

/// Outcome of a conflict check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ResolutionWire", try_from = "ResolutionWire")]
pub enum ConflictResolution {
    /// Both states carry the same information; nothing to write
    Equal,
    /// Both sides should adopt this document
    Merged(Value),
}

impl ConflictResolution {
    pub fn is_equal(&self) -> bool {
        matches!(self, ConflictResolution::Equal)
    }

    /// The agreed document, when the states were not equal.
    pub fn document(&self) -> Option<&Value> {
        match self {
            ConflictResolution::Equal => None,
            ConflictResolution::Merged(doc) => Some(doc),
        }
    }
}

/// `{"isEqual": true}` or `{"isEqual": false, "documentData": {...}}`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolutionWire {
    is_equal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    document_data: Option<Value>,
}

impl From<ConflictResolution> for ResolutionWire {
    fn from(resolution: ConflictResolution) -> Self {
        match resolution {
            ConflictResolution::Equal => Self {
                is_equal: true,
                document_data: None,
            },
            ConflictResolution::Merged(doc) => Self {
                is_equal: false,
                document_data: Some(doc),
            },
        }
    }
}

impl TryFrom<ResolutionWire> for ConflictResolution {
    type Error = String;

    fn try_from(wire: ResolutionWire) -> std::result::Result<Self, String> {
        match (wire.is_equal, wire.document_data) {
            (true, _) => Ok(ConflictResolution::Equal),
            (false, Some(doc)) => Ok(ConflictResolution::Merged(doc)),
            (false, None) => Err("documentData is required when isEqual is false".into()),
        }
    }
}

/// Decides how two divergent document states converge.
pub trait ConflictHandler: Send + Sync {
    fn resolve(&self, input: &ConflictInput) -> Result<ConflictResolution>;
}

/// The handler bound to every crdt-enabled collection.
///
/// Equal digests mean equal states. Otherwise the two logs are merged and
/// the document is rebuilt from the merged log, on top of the structural
/// fields of the new state.
///
/// Both logs are checked against the crdt schema before merging, and a
/// malformed one is rejected with [`Error::InvalidCrdtField`].
///
/// # Poisoned logs
///
/// Operations from different replicas are replayed against each other's
/// results. A merged log can therefore fail to replay even when each side
/// replayed fine on its own. For example, one replica `$set`s a field to a
/// string in the same row where another `$inc`s it. `resolve` then returns
/// [`Error::InvalidPatch`] for that document every time it is asked, since
/// the log is append-only and cannot be repaired by merging. Hosts should
/// treat that error as permanent for the document and not retry it.
pub struct CrdtConflictHandler {
    schema: Arc<CollectionSchema>,
    field: FieldPath,
    hasher: Arc<dyn HashFunction>,
    query: Arc<dyn QueryEngine>,
}

impl CrdtConflictHandler {
    pub fn new(
        schema: Arc<CollectionSchema>,
        hasher: Arc<dyn HashFunction>,
        query: Arc<dyn QueryEngine>,
    ) -> Result<Self> {
        let field = schema
            .crdt_field()
            .cloned()
            .ok_or_else(|| Error::UnsupportedSchema(schema.name.clone()))?;
        Ok(Self {
            schema,
            field,
            hasher,
            query,
        })
    }

    fn crdt_of(&self, state: &Value, which: &str) -> Result<CrdtField> {
        let raw = self.field.get(state).ok_or_else(|| {
            Error::InvalidDocument(format!(
                "{} has no crdt field at '{}'",
                which, self.field
            ))
        })?;
        parse_crdt_field(raw)
    }
}

impl ConflictHandler for CrdtConflictHandler {
    fn resolve(&self, input: &ConflictInput) -> Result<ConflictResolution> {
        let ours = self.crdt_of(&input.new_document_state, "new document state")?;
        let theirs = self.crdt_of(&input.real_master_state, "master state")?;

        if ours.hash == theirs.hash {
            tracing::trace!(collection = %self.schema.name, "crdt hashes equal");
            return Ok(ConflictResolution::Equal);
        }

        let merged = merge_fields(self.hasher.as_ref(), &ours, &theirs);
        let doc = rebuild(
            self.query.as_ref(),
            &self.schema,
            Some(&input.new_document_state),
            &merged,
        )?;

        tracing::debug!(
            collection = %self.schema.name,
            ours = ours.row_count(),
            theirs = theirs.row_count(),
            merged = merged.row_count(),
            "resolved crdt conflict"
        );
        Ok(ConflictResolution::Merged(doc))
    }
}

/// Default handler for collections without a crdt field.
///
/// States that agree on every non-internal field are equal; otherwise the
/// master state wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterWinsHandler;

impl ConflictHandler for MasterWinsHandler {
    fn resolve(&self, input: &ConflictInput) -> Result<ConflictResolution> {
        if content(&input.new_document_state) == content(&input.real_master_state) {
            return Ok(ConflictResolution::Equal);
        }
        Ok(ConflictResolution::Merged(input.real_master_state.clone()))
    }
}

/// The non-internal top-level fields of a document.
pub(crate) fn content(doc: &Value) -> Map<String, Value> {
    doc.as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hash::Blake3Hash, query::MongoQueryEngine, BodyPart, Operation};
    use serde_json::json;

    fn handler() -> CrdtConflictHandler {
        let schema = CollectionSchema::new("items", "id", vec![])
            .with_crdt(FieldPath::parse("crdts").unwrap());
        CrdtConflictHandler::new(
            Arc::new(schema),
            Arc::new(Blake3Hash),
            Arc::new(MongoQueryEngine),
        )
        .unwrap()
    }

    fn op(creator: &str, fields: Value) -> Operation {
        Operation::new(BodyPart::set(fields).into(), creator, 1.0).unwrap()
    }

    fn state(rows: Vec<Vec<Operation>>) -> Value {
        let field = CrdtField::new(&Blake3Hash, rows);
        let schema = CollectionSchema::new("items", "id", vec![])
            .with_crdt(FieldPath::parse("crdts").unwrap());
        rebuild(&MongoQueryEngine, &schema, None, &field).unwrap()
    }

    #[test]
    fn equal_hashes_are_equal() {
        let a = state(vec![vec![op("x", json!({"id": "1", "v": 1}))]]);
        // same topology, different payload: the digest only sees creators
        let b = state(vec![vec![op("x", json!({"id": "1", "v": 2}))]]);
        let result = handler().resolve(&ConflictInput::new(a, b)).unwrap();
        assert!(result.is_equal());
    }

    #[test]
    fn diverging_states_are_merged() {
        let base = vec![op("x", json!({"id": "1", "name": "a"}))];
        let ours = state(vec![base.clone(), vec![op("x", json!({"name": "b"}))]]);
        let theirs = state(vec![base, vec![op("y", json!({"age": 5}))], vec![op("y", json!({"age": 6}))]]);

        let result = handler().resolve(&ConflictInput::new(ours, theirs)).unwrap();
        let doc = result.document().unwrap();
        assert_eq!(doc["name"], json!("b"));
        assert_eq!(doc["age"], json!(6));

        let merged = CrdtField::from_value(&doc["crdts"]).unwrap();
        assert_eq!(merged.row_count(), 3);
        assert!(merged.hash_matches(&Blake3Hash));
    }

    #[test]
    fn missing_crdt_field_is_an_error() {
        let good = state(vec![vec![op("x", json!({"id": "1"}))]]);
        let result = handler().resolve(&ConflictInput::new(good, json!({"id": "1"})));
        assert!(matches!(result, Err(Error::InvalidDocument(_))));
    }

    #[test]
    fn malformed_remote_logs_are_rejected() {
        let good = state(vec![vec![op("x", json!({"id": "1"}))]]);
        let valid_op = json!({"body": [{"ifMatch": {"$set": {"v": 1}}}], "creator": "y", "time": 5});
        let bad_fields = [
            json!({"operations": [[{"body": [], "creator": "y", "time": 5}]], "hash": "abc"}),
            json!({"operations": [[{"body": [{"ifMatch": {}}], "creator": "y", "time": -5.0}]], "hash": "abc"}),
            json!({"operations": [[{"body": [{"ifMatch": {}}], "creator": "y", "time": 1.005}]], "hash": "abc"}),
            json!({"operations": [[valid_op]], "hash": "a"}),
        ];

        for bad in bad_fields {
            let master = json!({"id": "1", "crdts": bad.clone()});
            let result = handler().resolve(&ConflictInput::new(good.clone(), master));
            assert!(matches!(result, Err(Error::InvalidCrdtField(_))), "{}", bad);
        }
    }

    #[test]
    fn out_of_range_array_write_fails_instead_of_panicking() {
        let base = vec![op("x", json!({"id": "1", "tags": ["a"]}))];
        let ours = state(vec![base.clone()]);
        let poisoned = CrdtField::new(
            &Blake3Hash,
            vec![base, vec![op("y", json!({"tags.18446744073709551615": "boom"}))]],
        );
        let mut theirs = ours.clone();
        theirs["crdts"] = poisoned.to_value().unwrap();

        let result = handler().resolve(&ConflictInput::new(ours, theirs));
        assert!(matches!(result, Err(Error::InvalidPatch(_))));
    }

    #[test]
    fn handler_requires_crdt_schema() {
        let result = CrdtConflictHandler::new(
            Arc::new(CollectionSchema::new("plain", "id", vec![])),
            Arc::new(Blake3Hash),
            Arc::new(MongoQueryEngine),
        );
        assert!(matches!(result, Err(Error::UnsupportedSchema(_))));
    }

    #[test]
    fn master_wins_handler() {
        let equal = MasterWinsHandler
            .resolve(&ConflictInput::new(
                json!({"id": "1", "v": 1, "_rev": "1"}),
                json!({"id": "1", "v": 1, "_rev": "2"}),
            ))
            .unwrap();
        assert!(equal.is_equal());

        let master = json!({"id": "1", "v": 2});
        let result = MasterWinsHandler
            .resolve(&ConflictInput::new(json!({"id": "1", "v": 1}), master.clone()))
            .unwrap();
        assert_eq!(result, ConflictResolution::Merged(master));
    }

    #[test]
    fn resolution_wire_format() {
        assert_eq!(
            serde_json::to_value(ConflictResolution::Equal).unwrap(),
            json!({"isEqual": true})
        );
        assert_eq!(
            serde_json::to_value(ConflictResolution::Merged(json!({"a": 1}))).unwrap(),
            json!({"isEqual": false, "documentData": {"a": 1}})
        );
        assert!(serde_json::from_value::<ConflictResolution>(json!({"isEqual": false})).is_err());
    }
}
