//! The database runtime: one actor, many collections.

use crate::{
    check::SelfCheckingStorage,
    collection::Collection,
    config::EngineConfig,
    conflict::{ConflictHandler, CrdtConflictHandler, MasterWinsHandler},
    error::Result,
    hash::{Blake3Hash, HashFunction},
    query::{MongoQueryEngine, QueryEngine},
    storage::DocumentStorage,
    ActorId, CollectionSchema, Error,
};
use std::sync::Arc;

/// Everything needed to create a collection.
pub struct CollectionOptions {
    pub schema: CollectionSchema,
    pub storage: Arc<dyn DocumentStorage>,
    /// Custom conflict handler. Not allowed on crdt-enabled collections.
    pub conflict_handler: Option<Arc<dyn ConflictHandler>>,
}

impl CollectionOptions {
    pub fn new(schema: CollectionSchema, storage: Arc<dyn DocumentStorage>) -> Self {
        Self {
            schema,
            storage,
            conflict_handler: None,
        }
    }

    /// Builder-style method to set a custom conflict handler.
    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = Some(handler);
        self
    }
}

/// Owns the local actor identity and the pluggable collaborators shared by
/// every collection.
#[derive(Clone)]
pub struct Database {
    actor_id: ActorId,
    hasher: Arc<dyn HashFunction>,
    query: Arc<dyn QueryEngine>,
    config: EngineConfig,
}

impl Database {
    /// Create a database for the given actor with default collaborators.
    pub fn new(actor_id: impl Into<ActorId>) -> Self {
        Self {
            actor_id: actor_id.into(),
            hasher: Arc::new(Blake3Hash),
            query: Arc::new(MongoQueryEngine),
            config: EngineConfig::default(),
        }
    }

    /// Builder-style method to replace the digest function.
    pub fn with_hasher(mut self, hasher: Arc<dyn HashFunction>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Builder-style method to replace the query engine.
    pub fn with_query_engine(mut self, query: Arc<dyn QueryEngine>) -> Self {
        self.query = query;
        self
    }

    /// Builder-style method to replace the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the local actor ID.
    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hasher(&self) -> &Arc<dyn HashFunction> {
        &self.hasher
    }

    pub fn query_engine(&self) -> &Arc<dyn QueryEngine> {
        &self.query
    }

    /// Create a collection and bind its conflict handler.
    ///
    /// Crdt-enabled collections always get the crdt handler; passing a
    /// custom one fails with [`Error::DuplicateConflictHandler`]. In dev mode
    /// their storage is wrapped in a [`SelfCheckingStorage`].
    pub fn create_collection(&self, options: CollectionOptions) -> Result<Collection> {
        let CollectionOptions {
            schema,
            storage,
            conflict_handler,
        } = options;
        let schema = Arc::new(schema);
        let json_schema = schema.effective_json_schema()?;

        let (handler, storage): (Arc<dyn ConflictHandler>, Arc<dyn DocumentStorage>) =
            if schema.crdt_field().is_some() {
                if conflict_handler.is_some() {
                    return Err(Error::DuplicateConflictHandler(schema.name.clone()));
                }
                let handler = CrdtConflictHandler::new(
                    Arc::clone(&schema),
                    Arc::clone(&self.hasher),
                    Arc::clone(&self.query),
                )?;
                let storage: Arc<dyn DocumentStorage> = if self.config.dev_mode {
                    Arc::new(SelfCheckingStorage::new(
                        storage,
                        Arc::clone(&schema),
                        Arc::clone(&self.query),
                        Arc::clone(&self.hasher),
                    ))
                } else {
                    storage
                };
                (Arc::new(handler), storage)
            } else {
                let handler = conflict_handler.unwrap_or_else(|| Arc::new(MasterWinsHandler));
                (handler, storage)
            };

        tracing::debug!(
            collection = %schema.name,
            crdt = schema.crdt_field().is_some(),
            dev_mode = self.config.dev_mode,
            "created collection"
        );

        Ok(Collection::new(
            self.clone(),
            schema,
            json_schema,
            storage,
            handler,
        ))
    }
}
