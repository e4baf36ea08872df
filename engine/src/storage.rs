//! Document storage seam.
//!
//! The engine never owns persistence. It needs a keyed document store with
//! an insert that reports "already exists" and a compare-and-set write that
//! reports stale revisions; everything else (durability, indexing) belongs
//! to the host. [`MemoryStorage`] is an in-memory implementation.

use crate::{error::Result, rebuild::is_deleted, DocumentId, Error, Revision};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A document as held by storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    /// Primary key
    pub id: DocumentId,
    /// Incremented on every successful write
    pub revision: Revision,
    /// Full document data, internal fields included
    pub data: Value,
}

impl StoredDocument {
    /// Check if the document is a tombstone.
    pub fn is_deleted(&self) -> bool {
        is_deleted(&self.data)
    }
}

/// Keyed document storage with optimistic concurrency.
pub trait DocumentStorage: Send + Sync {
    /// Latest state of a document, tombstones included.
    fn get(&self, id: &str) -> Result<Option<StoredDocument>>;

    /// Insert a new document.
    ///
    /// Fails with [`Error::DocumentAlreadyExists`] when the ID is taken,
    /// by a tombstone too.
    fn insert(&self, id: &str, data: Value) -> Result<StoredDocument>;

    /// Replace a document if its revision is still `expected`.
    ///
    /// Fails with [`Error::RevisionConflict`] otherwise.
    fn compare_and_set(&self, id: &str, expected: Revision, data: Value) -> Result<StoredDocument>;

    /// All documents, tombstones included, ordered by ID.
    fn all(&self) -> Result<Vec<StoredDocument>>;
}

/// In-memory storage backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<DocumentId, StoredDocument>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of active (non-deleted) documents.
    pub fn len(&self) -> usize {
        self.documents
            .read()
            .values()
            .filter(|d| !d.is_deleted())
            .count()
    }

    /// Check if storage has no active documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStorage for MemoryStorage {
    fn get(&self, id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.documents.read().get(id).cloned())
    }

    fn insert(&self, id: &str, data: Value) -> Result<StoredDocument> {
        let mut documents = self.documents.write();
        if documents.contains_key(id) {
            return Err(Error::DocumentAlreadyExists(id.to_string()));
        }
        let stored = StoredDocument {
            id: id.to_string(),
            revision: 1,
            data,
        };
        documents.insert(id.to_string(), stored.clone());
        Ok(stored)
    }

    fn compare_and_set(&self, id: &str, expected: Revision, data: Value) -> Result<StoredDocument> {
        let mut documents = self.documents.write();
        let current = documents
            .get_mut(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;

        if current.revision != expected {
            return Err(Error::RevisionConflict {
                id: id.to_string(),
                expected,
                actual: current.revision,
            });
        }

        current.revision += 1;
        current.data = data;
        Ok(current.clone())
    }

    fn all(&self) -> Result<Vec<StoredDocument>> {
        let mut documents: Vec<_> = self.documents.read().values().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(documents)
    }
}
