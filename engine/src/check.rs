//! Write verification for development builds.
//!
//! [`SelfCheckingStorage`] wraps a collection's storage and re-derives every
//! document it is asked to write: the document is rebuilt from its own crdt
//! field and compared with what is being written, and the digest is
//! recomputed. A mismatch is a bug in the engine, never a user error, so the
//! write is aborted with [`Error::InvariantViolation`].

use crate::{
    conflict::content, error::Result, hash::HashFunction, query::QueryEngine, rebuild::rebuild,
    storage::{DocumentStorage, StoredDocument},
    CollectionSchema, CrdtField, Error, Revision,
};
use serde_json::Value;
use std::sync::Arc;

/// Verify that `doc` is exactly what its crdt field replays to.
pub fn verify_document(
    query: &dyn QueryEngine,
    hasher: &dyn HashFunction,
    schema: &CollectionSchema,
    doc: &Value,
) -> Result<()> {
    let path = schema
        .crdt_field()
        .ok_or_else(|| Error::UnsupportedSchema(schema.name.clone()))?;
    let raw = path.get(doc).ok_or_else(|| {
        Error::InvariantViolation(format!("document has no crdt field at '{}'", path))
    })?;
    let field = CrdtField::from_value(raw)?;

    let rebuilt = rebuild(query, schema, None, &field)?;
    let mut written = doc.clone();
    let mut replayed = rebuilt;
    path.remove(&mut written);
    path.remove(&mut replayed);
    if content(&written) != content(&replayed) {
        tracing::error!(
            collection = %schema.name,
            written = %written,
            rebuilt = %replayed,
            "document does not match its crdt log"
        );
        return Err(Error::InvariantViolation(format!(
            "document in '{}' does not match the state rebuilt from its crdt log",
            schema.name
        )));
    }

    if !field.hash_matches(hasher) {
        tracing::error!(collection = %schema.name, hash = %field.hash, "stale crdt hash");
        return Err(Error::InvariantViolation(format!(
            "crdt hash '{}' does not match the recalculated hash",
            field.hash
        )));
    }

    Ok(())
}

/// Storage decorator running [`verify_document`] before every write.
pub struct SelfCheckingStorage {
    inner: Arc<dyn DocumentStorage>,
    schema: Arc<CollectionSchema>,
    query: Arc<dyn QueryEngine>,
    hasher: Arc<dyn HashFunction>,
}

impl SelfCheckingStorage {
    pub fn new(
        inner: Arc<dyn DocumentStorage>,
        schema: Arc<CollectionSchema>,
        query: Arc<dyn QueryEngine>,
        hasher: Arc<dyn HashFunction>,
    ) -> Self {
        Self {
            inner,
            schema,
            query,
            hasher,
        }
    }

    fn verify(&self, data: &Value) -> Result<()> {
        verify_document(
            self.query.as_ref(),
            self.hasher.as_ref(),
            &self.schema,
            data,
        )
    }
}

impl DocumentStorage for SelfCheckingStorage {
    fn get(&self, id: &str) -> Result<Option<StoredDocument>> {
        self.inner.get(id)
    }

    fn insert(&self, id: &str, data: Value) -> Result<StoredDocument> {
        self.verify(&data)?;
        self.inner.insert(id, data)
    }

    fn compare_and_set(&self, id: &str, expected: Revision, data: Value) -> Result<StoredDocument> {
        self.verify(&data)?;
        self.inner.compare_and_set(id, expected, data)
    }

    fn all(&self) -> Result<Vec<StoredDocument>> {
        self.inner.all()
    }
}
