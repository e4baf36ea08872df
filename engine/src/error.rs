//! Error types for the Splice engine.

use crate::{CollectionName, DocumentId, Revision};
use thiserror::Error;

/// All possible errors from the Splice engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("collection '{0}' has no crdt field configured")]
    UnsupportedSchema(CollectionName),

    #[error("collection '{0}' already has a conflict handler")]
    DuplicateConflictHandler(CollectionName),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid crdt field: {0}")]
    InvalidCrdtField(String),

    // Write path errors
    #[error("atomic update on crdt document '{id}' outside the crdt write context (context: {context:?})")]
    ProtocolViolation {
        id: DocumentId,
        context: Option<String>,
    },

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("gave up writing document '{id}' after {attempts} attempts")]
    WriteRetriesExhausted { id: DocumentId, attempts: u32 },

    // Storage errors
    #[error("document already exists: {0}")]
    DocumentAlreadyExists(DocumentId),

    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("revision conflict on '{id}': expected {expected}, got {actual}")]
    RevisionConflict {
        id: DocumentId,
        expected: Revision,
        actual: Revision,
    },

    #[error("document has no primary key '{0}'")]
    MissingPrimaryKey(String),

    // Content errors
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
