//! # Splice Engine
//!
//! An operation-based CRDT core for replicated document stores.
//!
//! Replicas of a document can be edited independently, offline, by different
//! actors, and merged later without coordination and without losing writes.
//! Instead of storing only the latest state, every crdt-enabled document
//! embeds the log of operations that produced it. Merging two replicas means
//! merging their logs and replaying the result.
//!
//! ## Design Principles
//!
//! - **No IO**: persistence, transport and replication belong to the host
//! - **Deterministic**: merge and rebuild are pure functions of their inputs
//! - **Pluggable**: storage, digest and query engine are traits
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! An [`Operation`] is a list of conditional patches ([`BodyPart`]) plus the
//! actor that wrote it. A body part with a `selector` applies `ifMatch` when
//! the selector matches the state at replay time, `ifNotMatch` otherwise.
//!
//! ### Operation Log
//!
//! A [`CrdtField`] holds rows of operations. Row `i` contains the operations
//! written concurrently at causal position `i`, at most one per actor. Local
//! writes only ever append a new row. The field also carries a digest of the
//! per-row creators, which lets two replicas detect equality cheaply.
//!
//! ### Merge and Rebuild
//!
//! [`merge_fields`] aligns two logs by row, keeps the longer one's extra
//! rows, deduplicates by creator and sorts each row by creator. [`rebuild()`]
//! replays a log into a document. The [`CrdtConflictHandler`] combines both
//! and is what a replication engine calls on conflict.
//!
//! ## Quick Start
//!
//! ```rust
//! use splice_engine::{
//!     BodyPart, CollectionOptions, CollectionSchema, ConflictHandler, ConflictInput,
//!     Database, DocumentStorage, FieldPath, MemoryStorage,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! // 1. Two replicas of the same collection, each with its own actor
//! let schema = CollectionSchema::new("todos", "id", vec![])
//!     .with_crdt(FieldPath::parse("crdts").unwrap());
//!
//! let alice_db = Database::new("alice");
//! let alice = alice_db
//!     .create_collection(CollectionOptions::new(schema.clone(), Arc::new(MemoryStorage::new())))
//!     .unwrap();
//! let bob_storage = Arc::new(MemoryStorage::new());
//! let bob_db = Database::new("bob");
//! let bob = bob_db
//!     .create_collection(CollectionOptions::new(schema, bob_storage.clone()))
//!     .unwrap();
//!
//! // 2. Replication copies the document as-is, then both sides edit it
//! let doc = alice.insert(json!({"id": "t1", "title": "write docs", "points": 0})).unwrap();
//! bob_storage.insert("t1", doc.data().clone()).unwrap();
//!
//! let ours = doc
//!     .update_crdt(BodyPart::update(json!({"$inc": {"points": 1}})))
//!     .unwrap();
//! let theirs = bob
//!     .find_one("t1").unwrap().unwrap()
//!     .update_crdt(BodyPart::update(json!({"$inc": {"points": 2}})))
//!     .unwrap();
//!
//! // 3. Replication reports a conflict; the handler merges both logs
//! let input = ConflictInput::new(ours.data().clone(), theirs.data().clone());
//! let resolution = alice.conflict_handler().resolve(&input).unwrap();
//! let merged = resolution.document().unwrap();
//! assert_eq!(merged["points"], json!(3));
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig`] controls the dev-mode write self-check and the retry
//! bound of the write path. [`EngineConfig::from_env`] reads
//! `SPLICE_DEV_MODE` and `SPLICE_MAX_WRITE_RETRIES`.
//!
//! ## FFI
//!
//! The [`ffi`] module exposes merge, rebuild, digest and conflict resolution
//! as C-compatible functions. All data is exchanged as JSON strings.

pub mod check;
pub mod collection;
pub mod config;
pub mod conflict;
pub mod database;
pub mod error;
pub mod ffi;
pub mod hash;
pub mod merge;
pub mod operation;
pub mod patch;
pub mod path;
pub mod query;
pub mod rebuild;
pub mod schema;
pub mod storage;

// Re-export main types at crate root
pub use check::{verify_document, SelfCheckingStorage};
pub use collection::{Collection, Document, CRDT_WRITE_CONTEXT};
pub use config::{ConfigError, EngineConfig};
pub use conflict::{
    ConflictHandler, ConflictInput, ConflictResolution, CrdtConflictHandler, MasterWinsHandler,
};
pub use database::{CollectionOptions, Database};
pub use error::{Error, Result};
pub use hash::{hash_operations, Blake3Hash, HashFunction};
pub use merge::merge_fields;
pub use operation::{BodyPart, CrdtField, Operation, OperationRow};
pub use path::FieldPath;
pub use query::{MongoQueryEngine, Predicate, QueryEngine};
pub use rebuild::{rebuild, run_operation};
pub use schema::{
    crdt_schema_part, parse_crdt_field, CollectionSchema, CrdtOptions, FieldDef, FieldType,
};
pub use storage::{DocumentStorage, MemoryStorage, StoredDocument};

/// Type aliases for clarity
pub type ActorId = String;
pub type DocumentId = String;
pub type CollectionName = String;
pub type Revision = u64;

/// Internal field flagging a document as deleted.
pub const DELETED_FIELD: &str = "_deleted";
