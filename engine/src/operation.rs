//! The operation log stored inside every crdt-enabled document.
//!
//! A document's history is a sequence of [`OperationRow`]s. Each row holds
//! the operations that were written concurrently at one causal position,
//! at most one per actor. Rows are only ever appended.

use crate::{
    error::Result,
    hash::{hash_operations, HashFunction},
    ActorId, Error,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// One conditional patch inside an operation.
///
/// Without a `selector` the part always matches and `if_match` is applied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BodyPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_not_match: Option<Value>,
}

impl BodyPart {
    /// An unconditional update document, e.g. `{"$inc": {"count": 1}}`.
    pub fn update(update: Value) -> Self {
        Self {
            if_match: Some(update),
            ..Self::default()
        }
    }

    /// Unconditionally `$set` the given fields.
    pub fn set(fields: Value) -> Self {
        Self::update(json!({ "$set": fields }))
    }

    /// The deletion patch.
    pub fn delete() -> Self {
        Self::set(json!({ "_deleted": true }))
    }

    /// A conditional part: `if_match` applies when `selector` matches.
    pub fn when(selector: Value, if_match: Value) -> Self {
        Self {
            selector: Some(selector),
            if_match: Some(if_match),
            if_not_match: None,
        }
    }

    /// Builder-style method to add the branch taken when the selector misses.
    pub fn otherwise(mut self, if_not_match: Value) -> Self {
        self.if_not_match = Some(if_not_match);
        self
    }
}

impl From<BodyPart> for Vec<BodyPart> {
    fn from(part: BodyPart) -> Self {
        vec![part]
    }
}

/// An atomic edit intent authored by one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Operation {
    /// Conditional patches, applied in order
    pub body: Vec<BodyPart>,
    /// Actor that authored the operation
    pub creator: ActorId,
    /// Milliseconds since epoch with hundredths precision. Diagnostic only.
    pub time: f64,
}

impl Operation {
    /// Create an operation. The body must not be empty.
    pub fn new(body: Vec<BodyPart>, creator: impl Into<ActorId>, time: f64) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::InvalidCrdtField(
                "operation body must not be empty".into(),
            ));
        }
        Ok(Self {
            body,
            creator: creator.into(),
            time,
        })
    }
}

/// Operations written concurrently at one causal position.
pub type OperationRow = Vec<Operation>;

/// The crdt field embedded in a document: the rows plus their digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CrdtField {
    pub operations: Vec<OperationRow>,
    pub hash: String,
}

impl CrdtField {
    /// Build a field from rows, computing the digest.
    pub fn new(hasher: &dyn HashFunction, operations: Vec<OperationRow>) -> Self {
        let hash = hash_operations(hasher, &operations);
        Self { operations, hash }
    }

    /// A fresh log holding a single row with a single operation.
    pub fn initial(hasher: &dyn HashFunction, operation: Operation) -> Self {
        Self::new(hasher, vec![vec![operation]])
    }

    /// A copy of this log with `operation` appended as a new row.
    ///
    /// Existing rows are never touched.
    pub fn appended(&self, hasher: &dyn HashFunction, operation: Operation) -> Self {
        let mut operations = self.operations.clone();
        operations.push(vec![operation]);
        Self::new(hasher, operations)
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.operations.len()
    }

    /// Iterate every operation in replay order.
    pub fn iter_operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter().flatten()
    }

    /// Recompute the digest and compare it with the stored one.
    pub fn hash_matches(&self, hasher: &dyn HashFunction) -> bool {
        hash_operations(hasher, &self.operations) == self.hash
    }

    /// Decode a field from its JSON form.
    pub fn from_value(value: &Value) -> Result<Self> {
        Self::deserialize(value).map_err(|e| Error::InvalidCrdtField(e.to_string()))
    }

    /// Encode the field as JSON.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Current wall-clock time in milliseconds, rounded to hundredths.
pub fn now() -> f64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(1.0);
    ((millis * 100.0).round() / 100.0).max(1.0)
}
