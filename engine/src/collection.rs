//! Collections and document handles: the crdt write path.
//!
//! On a crdt-enabled collection every content change is an [`Operation`]
//! appended to the document's log as a new row. Every write is a
//! read-modify-write loop: read the current state, recompute the next state
//! from it, compare-and-set, and start over on a revision conflict.
//! The recomputation only depends on the state it was handed, so a retry
//! never applies an operation twice.

use crate::{
    conflict::{content, ConflictHandler},
    database::Database,
    error::Result,
    operation::now,
    patch::{apply_update, set_all_fields},
    path::FieldPath,
    rebuild::{is_deleted, run_operation},
    storage::{DocumentStorage, StoredDocument},
    BodyPart, CollectionSchema, CrdtField, DocumentId, Error, Operation, Revision, DELETED_FIELD,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Context tag that authorizes an atomic update on a crdt-enabled
/// collection. Only the write path passes it.
pub const CRDT_WRITE_CONTEXT: &str = "splice-crdt";

/// A collection of documents sharing one schema and one storage.
pub struct Collection {
    database: Database,
    schema: Arc<CollectionSchema>,
    json_schema: Value,
    storage: Arc<dyn DocumentStorage>,
    conflict_handler: Arc<dyn ConflictHandler>,
}

impl Collection {
    pub(crate) fn new(
        database: Database,
        schema: Arc<CollectionSchema>,
        json_schema: Value,
        storage: Arc<dyn DocumentStorage>,
        conflict_handler: Arc<dyn ConflictHandler>,
    ) -> Self {
        Self {
            database,
            schema,
            json_schema,
            storage,
            conflict_handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// The JSON schema computed at creation, crdt fragment included.
    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    /// The handler the replication engine calls for this collection.
    pub fn conflict_handler(&self) -> &Arc<dyn ConflictHandler> {
        &self.conflict_handler
    }

    /// Insert a plain document.
    ///
    /// On a crdt-enabled collection the document is turned into a log with
    /// one operation that sets all of its content fields.
    pub fn insert(&self, doc: Value) -> Result<Document<'_>> {
        let data = match self.schema.crdt_field() {
            Some(path) => self.wrap_plain_document(path, doc)?,
            None => doc,
        };
        self.write_insert(data)
    }

    /// Insert several plain documents. Each one succeeds or fails on its own.
    pub fn bulk_insert(&self, docs: Vec<Value>) -> Vec<Result<Document<'_>>> {
        docs.into_iter().map(|doc| self.insert(doc)).collect()
    }

    /// Create a document from a single operation.
    ///
    /// The operation is replayed on an empty document, which must end up
    /// with a primary key. When a document with that key already exists the
    /// operation is appended to it instead.
    pub fn insert_crdt(&self, entry: impl Into<Vec<BodyPart>>) -> Result<Document<'_>> {
        let path = self.require_crdt()?;
        let body = entry.into();
        let operation = self.operation(body.clone())?;

        let mut data = run_operation(
            self.database.query_engine().as_ref(),
            &self.schema,
            json!({ DELETED_FIELD: false }),
            &operation,
        )?;
        let field = CrdtField::initial(self.database.hasher().as_ref(), operation);
        path.set(&mut data, field.to_value()?)?;

        match self.write_insert(data) {
            Err(Error::DocumentAlreadyExists(id)) => {
                tracing::warn!(
                    collection = %self.schema.name,
                    id = %id,
                    "document exists, appending insert as update"
                );
                self.update_crdt(&id, body)
            }
            other => other,
        }
    }

    /// Find an active document by primary key.
    pub fn find_one(&self, id: &str) -> Result<Option<Document<'_>>> {
        Ok(self
            .storage
            .get(id)?
            .filter(|stored| !stored.is_deleted())
            .map(|stored| Document::new(self, stored)))
    }

    /// All active documents matching a selector, ordered by primary key.
    pub fn find(&self, selector: &Value) -> Result<Vec<Document<'_>>> {
        let predicate = self
            .database
            .query_engine()
            .compile(&self.schema, selector)?;
        Ok(self
            .storage
            .all()?
            .into_iter()
            .filter(|stored| !stored.is_deleted() && predicate.matches(&stored.data))
            .map(|stored| Document::new(self, stored))
            .collect())
    }

    fn require_crdt(&self) -> Result<&FieldPath> {
        self.schema
            .crdt_field()
            .ok_or_else(|| Error::UnsupportedSchema(self.schema.name.clone()))
    }

    fn operation(&self, body: Vec<BodyPart>) -> Result<Operation> {
        Operation::new(body, self.database.actor_id().clone(), now())
    }

    fn wrap_plain_document(&self, path: &FieldPath, doc: Value) -> Result<Value> {
        let Value::Object(fields) = doc else {
            return Err(Error::InvalidDocument("document must be an object".into()));
        };
        let update = set_all_fields(&fields, path.root());
        let operation = self.operation(BodyPart::update(update).into())?;

        let mut data = run_operation(
            self.database.query_engine().as_ref(),
            &self.schema,
            json!({ DELETED_FIELD: false }),
            &operation,
        )?;
        let field = CrdtField::initial(self.database.hasher().as_ref(), operation);
        path.set(&mut data, field.to_value()?)?;
        keep_internal_fields(&mut data, &fields);
        Ok(data)
    }

    fn write_insert(&self, data: Value) -> Result<Document<'_>> {
        let id = self.schema.document_id(&data)?;
        self.schema.validate_document(&data)?;
        let stored = self.storage.insert(&id, data)?;
        tracing::debug!(collection = %self.schema.name, id = %id, "inserted document");
        Ok(Document::new(self, stored))
    }

    fn get_any(&self, id: &str) -> Result<StoredDocument> {
        self.storage
            .get(id)?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// Append one operation row to a document's log.
    fn update_crdt(&self, id: &str, body: Vec<BodyPart>) -> Result<Document<'_>> {
        let path = self.require_crdt()?;
        let operation = self.operation(body)?;
        let hasher = self.database.hasher().as_ref();
        let query = self.database.query_engine().as_ref();

        let stored = self.atomic_write(id, |current| {
            let raw = path.get(current).ok_or_else(|| {
                Error::InvalidDocument(format!("document '{}' has no crdt field at '{}'", id, path))
            })?;
            let field = CrdtField::from_value(raw)?.appended(hasher, operation.clone());

            let mut doc = Value::Object(content(current));
            doc[DELETED_FIELD] = Value::Bool(is_deleted(current));
            let mut doc = run_operation(query, &self.schema, doc, &operation)?;
            path.set(&mut doc, field.to_value()?)?;
            if let Value::Object(read) = current {
                keep_internal_fields(&mut doc, read);
            }
            Ok(doc)
        })?;

        tracing::debug!(
            collection = %self.schema.name,
            id = %id,
            revision = stored.revision,
            "appended crdt operation"
        );
        Ok(Document::new(self, stored))
    }

    /// Read-modify-write a document with optimistic concurrency.
    ///
    /// `mutate` gets the latest stored state and returns the next one. On a
    /// revision conflict it is called again with the fresher state, up to
    /// `max_write_retries` times.
    fn atomic_write(
        &self,
        id: &str,
        mut mutate: impl FnMut(&Value) -> Result<Value>,
    ) -> Result<StoredDocument> {
        let max_retries = self.database.config().max_write_retries;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let current = self.get_any(id)?;
            let next = mutate(&current.data)?;

            self.schema.validate_document(&next)?;
            let next_id = self.schema.document_id(&next)?;
            if next_id != id {
                return Err(Error::InvalidDocument(format!(
                    "primary key changed from '{}' to '{}'",
                    id, next_id
                )));
            }

            match self.storage.compare_and_set(id, current.revision, next) {
                Ok(stored) => return Ok(stored),
                Err(Error::RevisionConflict { actual, .. }) if attempts <= max_retries => {
                    tracing::warn!(
                        collection = %self.schema.name,
                        id = %id,
                        attempt = attempts,
                        actual,
                        "revision conflict, recomputing write"
                    );
                }
                Err(Error::RevisionConflict { .. }) => {
                    return Err(Error::WriteRetriesExhausted {
                        id: id.to_string(),
                        attempts,
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Copy internal fields of `from` that `doc` does not set itself.
fn keep_internal_fields(doc: &mut Value, from: &Map<String, Value>) {
    let Value::Object(target) = doc else {
        return;
    };
    for (key, value) in from {
        if key.starts_with('_') {
            target.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// A handle to one stored revision of a document.
pub struct Document<'a> {
    collection: &'a Collection,
    state: StoredDocument,
}

impl<'a> Document<'a> {
    fn new(collection: &'a Collection, state: StoredDocument) -> Self {
        Self { collection, state }
    }

    pub fn id(&self) -> &DocumentId {
        &self.state.id
    }

    pub fn revision(&self) -> Revision {
        self.state.revision
    }

    /// Full document data, internal fields included.
    pub fn data(&self) -> &Value {
        &self.state.data
    }

    /// The document without internal fields.
    pub fn to_json(&self) -> Value {
        Value::Object(content(&self.state.data))
    }

    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    /// Decode the document's operation log.
    pub fn crdt(&self) -> Result<CrdtField> {
        let path = self.collection.require_crdt()?;
        let raw = path.get(&self.state.data).ok_or_else(|| {
            Error::InvalidDocument(format!("document '{}' has no crdt field", self.state.id))
        })?;
        CrdtField::from_value(raw)
    }

    /// Append an operation authored by the local actor.
    pub fn update_crdt(&self, entry: impl Into<Vec<BodyPart>>) -> Result<Document<'a>> {
        self.collection.update_crdt(&self.state.id, entry.into())
    }

    /// Delete the document. On a crdt-enabled collection deletion is an
    /// operation like any other.
    pub fn remove(&self) -> Result<Document<'a>> {
        if self.collection.schema.crdt_field().is_some() {
            return self.update_crdt(BodyPart::delete());
        }
        self.atomic_update(None, |doc| {
            let mut next = doc.clone();
            next[DELETED_FIELD] = Value::Bool(true);
            Ok(next)
        })
    }

    /// Set the given top-level fields.
    pub fn atomic_patch(&self, patch: Value) -> Result<Document<'a>> {
        if !patch.is_object() {
            return Err(Error::InvalidPatch("patch must be an object".into()));
        }
        if self.collection.schema.crdt_field().is_some() {
            return self.update_crdt(BodyPart::set(patch));
        }
        let update = json!({ "$set": patch });
        self.atomic_update(None, |doc| apply_update(doc.clone(), &update))
    }

    /// Rewrite the document with an arbitrary function.
    ///
    /// On a crdt-enabled collection an arbitrary rewrite would bypass the
    /// log, so it fails with [`Error::ProtocolViolation`] unless `context`
    /// is [`CRDT_WRITE_CONTEXT`].
    pub fn atomic_update(
        &self,
        context: Option<&str>,
        mutate: impl FnMut(&Value) -> Result<Value>,
    ) -> Result<Document<'a>> {
        if self.collection.schema.crdt_field().is_some() && context != Some(CRDT_WRITE_CONTEXT) {
            return Err(Error::ProtocolViolation {
                id: self.state.id.clone(),
                context: context.map(str::to_string),
            });
        }
        let stored = self.collection.atomic_write(&self.state.id, mutate)?;
        Ok(Document::new(self.collection, stored))
    }
}

impl std::fmt::Debug for Document<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("collection", &self.collection.name())
            .field("state", &self.state)
            .finish()
    }
}
