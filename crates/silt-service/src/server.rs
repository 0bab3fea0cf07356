//! In-process Silt server.
//!
//! Wires the segment store, the compaction scheduler, the query-segment
//! registry and the scan engine together and hands out [`Collection`]
//! handles bound to a connection alias.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use silt_compaction::{CompactionScheduler, QuerySegmentRegistry};
use silt_core::metrics;
use silt_core::{
    CollectionDescriptor, CollectionSchema, CoreError, CoreResult, IdAllocator, SiltConfig,
    TimestampOracle,
};
use silt_query::{ExecutionEngine, ScanEngine};
use silt_storage::{MemoryObjectStore, ObjectStore, SegmentCatalog, SegmentStore};

use crate::collection::{Collection, CollectionState};
use crate::connection::ConnectionManager;

pub(crate) struct ServerInner {
    pub(crate) config: SiltConfig,
    pub(crate) connections: ConnectionManager,
    pub(crate) ids: Arc<IdAllocator>,
    pub(crate) oracle: Arc<TimestampOracle>,
    pub(crate) store: Arc<SegmentStore>,
    pub(crate) scheduler: CompactionScheduler,
    pub(crate) registry: QuerySegmentRegistry,
    pub(crate) engine: Arc<dyn ExecutionEngine>,
    collections: RwLock<HashMap<String, Arc<CollectionState>>>,
}

/// Entry point for clients.
///
/// # Example
///
/// ```no_run
/// use silt_core::{CollectionSchema, SiltConfig};
/// use silt_service::{Entity, SiltServer, DEFAULT_ALIAS};
///
/// # async fn example() -> silt_core::CoreResult<()> {
/// let server = SiltServer::new(SiltConfig::default())?;
/// server.connect(DEFAULT_ALIAS)?;
/// let collection =
///     server.create_collection(DEFAULT_ALIAS, CollectionSchema::new("docs", 4).with_shards(1))?;
/// collection
///     .insert(vec![Entity::new(1, vec![0.1, 0.2, 0.3, 0.4])], None)
///     .await?;
/// collection.flush().await?;
/// let group = collection.compact()?;
/// # let _ = group;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SiltServer {
    inner: Arc<ServerInner>,
}

impl SiltServer {
    /// Server backed by an in-memory object store.
    pub fn new(config: SiltConfig) -> CoreResult<Self> {
        Self::with_object_store(config, Arc::new(MemoryObjectStore::new()))
    }

    /// # Errors
    ///
    /// `Config` if `config` fails validation.
    pub fn with_object_store(
        config: SiltConfig,
        objects: Arc<dyn ObjectStore>,
    ) -> CoreResult<Self> {
        config
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let ids = Arc::new(IdAllocator::default());
        let oracle = Arc::new(TimestampOracle::new());
        let catalog = Arc::new(SegmentCatalog::new());
        let store = Arc::new(SegmentStore::new(
            catalog.clone(),
            objects,
            ids.clone(),
            oracle.clone(),
            config.segment.max_rows,
        )
        .with_row_cache_capacity(config.segment.row_cache_capacity));
        let scheduler =
            CompactionScheduler::new(&config, store.clone(), ids.clone(), oracle.clone())?;

        Ok(Self {
            inner: Arc::new(ServerInner {
                connections: ConnectionManager::new(),
                registry: QuerySegmentRegistry::new(catalog),
                engine: Arc::new(ScanEngine::new(store.clone())),
                config,
                ids,
                oracle,
                store,
                scheduler,
                collections: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Starts background compaction. Needs a tokio runtime.
    pub fn start(&self) {
        self.inner.scheduler.start();
    }

    /// Stops background compaction; plans already running finish.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }

    pub fn config(&self) -> &SiltConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &CompactionScheduler {
        &self.inner.scheduler
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.inner.store
    }

    pub fn oracle(&self) -> &Arc<TimestampOracle> {
        &self.inner.oracle
    }

    pub fn connect(&self, alias: &str) -> CoreResult<()> {
        self.inner.connections.connect(alias)
    }

    pub fn remove_connection(&self, alias: &str) {
        self.inner.connections.remove_connection(alias);
    }

    pub fn list_connections(&self) -> Vec<String> {
        self.inner.connections.list_connections()
    }

    /// Creates a collection with its default partition.
    ///
    /// # Errors
    ///
    /// - `NotConnected` for an unknown alias
    /// - `ValidationError` for an invalid schema
    /// - `AlreadyExists` if the name is taken
    pub fn create_collection(&self, alias: &str, schema: CollectionSchema) -> CoreResult<Collection> {
        self.inner.connections.ensure_connected(alias)?;
        schema.validate().map_err(CoreError::ValidationError)?;

        let mut collections = self.inner.collections.write();
        if collections.contains_key(&schema.name) {
            return Err(CoreError::already_exists("collection", schema.name.clone()));
        }
        let descriptor = CollectionDescriptor::new(schema, self.inner.ids.partition());
        let name = descriptor.schema.name.clone();
        info!(
            collection = %name,
            collection_id = %descriptor.collection_id,
            shards = descriptor.schema.shards_num,
            dimension = descriptor.schema.dimension,
            "Collection created"
        );
        let state = Arc::new(CollectionState::new(descriptor));
        collections.insert(name, state.clone());
        Ok(Collection::new(self.inner.clone(), alias.to_string(), state))
    }

    /// Handle on an existing collection.
    pub fn collection(&self, alias: &str, name: &str) -> CoreResult<Collection> {
        self.inner.connections.ensure_connected(alias)?;
        let state = self
            .inner
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found("collection", name))?;
        Ok(Collection::new(self.inner.clone(), alias.to_string(), state))
    }

    pub fn has_collection(&self, alias: &str, name: &str) -> CoreResult<bool> {
        self.inner.connections.ensure_connected(alias)?;
        Ok(self.inner.collections.read().contains_key(name))
    }

    /// Collection names in name order.
    pub fn list_collections(&self, alias: &str) -> CoreResult<Vec<String>> {
        self.inner.connections.ensure_connected(alias)?;
        let mut names: Vec<String> = self.inner.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Prometheus text exposition of the engine metrics.
    pub fn metrics_text(&self) -> String {
        metrics::export_text()
    }
}
