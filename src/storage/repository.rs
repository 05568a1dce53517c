use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::{Config, EngineConfig};
use crate::fs::error::{AvmError, AvmResult};
use crate::layer::LookupCache;
use crate::metrics::AvmMetrics;
use crate::types::{NodeId, StoreId, VersionId, VersionRef};

use super::arena::NodeArena;
use super::events::NullIndexSink;
use super::memory::{AllowAll, MemoryBlobRepository, MemoryPropertyRepository};
use super::models::Node;
use super::store::{StoreHandle, StoreRegistry};
use super::traits::{AccessOperation, AccessPolicy, BlobRepository, IndexSink, PropertyRepository};

/// Shared state behind every service handle and the orphan reaper.
pub struct AvmRepository {
    pub(crate) arena: NodeArena,
    pub(crate) stores: StoreRegistry,
    pub(crate) properties: Arc<dyn PropertyRepository>,
    pub(crate) blobs: Arc<dyn BlobRepository>,
    pub(crate) access: Arc<dyn AccessPolicy>,
    pub(crate) index: Arc<dyn IndexSink>,
    pub(crate) cache: LookupCache,
    pub(crate) metrics: Option<Arc<AvmMetrics>>,
    pub(crate) config: EngineConfig,
    /// Shared by write transactions, exclusive for the reaper's reclaim phase.
    pub(crate) gate: RwLock<()>,
}

pub struct RepositoryBuilder {
    config: Config,
    properties: Option<Arc<dyn PropertyRepository>>,
    blobs: Option<Arc<dyn BlobRepository>>,
    access: Option<Arc<dyn AccessPolicy>>,
    index: Option<Arc<dyn IndexSink>>,
    metrics: Option<Arc<AvmMetrics>>,
}

impl RepositoryBuilder {
    pub fn new(config: Config) -> Self {
        Self { config, properties: None, blobs: None, access: None, index: None, metrics: None }
    }

    pub fn properties(mut self, properties: Arc<dyn PropertyRepository>) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobRepository>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn index_sink(mut self, index: Arc<dyn IndexSink>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn metrics(mut self, metrics: Arc<AvmMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Arc<AvmRepository> {
        Arc::new(AvmRepository {
            arena: NodeArena::new(),
            stores: StoreRegistry::new(),
            properties: self.properties.unwrap_or_else(|| Arc::new(MemoryPropertyRepository::new())),
            blobs: self.blobs.unwrap_or_else(|| Arc::new(MemoryBlobRepository::new())),
            access: self.access.unwrap_or_else(|| Arc::new(AllowAll)),
            index: self.index.unwrap_or_else(|| Arc::new(NullIndexSink)),
            cache: LookupCache::new(&self.config.cache),
            metrics: self.metrics,
            config: self.config.engine,
            gate: RwLock::new(()),
        })
    }
}

impl AvmRepository {
    pub fn builder(config: Config) -> RepositoryBuilder {
        RepositoryBuilder::new(config)
    }

    pub fn in_memory() -> Arc<Self> {
        RepositoryBuilder::new(Config::default()).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub(crate) async fn authorize(
        &self,
        principal: &str,
        path: &str,
        operation: AccessOperation,
    ) -> AvmResult<()> {
        if self.access.allow(principal, path, operation).await? {
            Ok(())
        } else {
            tracing::debug!(principal, path, operation = %operation, "Access denied");
            Err(AvmError::AccessDenied(format!("{} may not {} {}", principal, operation, path)))
        }
    }

    pub(crate) fn record<T>(&self, operation: &str, started: Instant, result: &AvmResult<T>) {
        if let Some(metrics) = &self.metrics {
            let kind = result.as_ref().err().map(AvmError::kind);
            metrics.record_operation(operation, started.elapsed(), kind);
        }
    }
}

/// Read access to nodes and store roots, either committed or through a pending transaction.
pub trait NodeSource: Send + Sync {
    fn repo(&self) -> &AvmRepository;

    fn node(&self, id: NodeId) -> AvmResult<Arc<Node>>;

    fn head_root(&self, store_id: StoreId) -> AvmResult<NodeId>;

    fn root(&self, store_id: StoreId, version: VersionRef) -> AvmResult<NodeId> {
        match version {
            VersionRef::Head => self.head_root(store_id),
            VersionRef::At(id) => {
                let handle = self.repo().stores.get_by_id(store_id)?;
                handle.read(|record| {
                    record.version(id).map(|v| v.root).ok_or_else(|| {
                        AvmError::NotFound(format!("Version {} of store {}", id, record.name))
                    })
                })
            }
        }
    }

    fn store(&self, store_id: StoreId) -> AvmResult<Arc<StoreHandle>> {
        self.repo().stores.get_by_id(store_id)
    }

    fn next_version_id(&self, store_id: StoreId) -> AvmResult<VersionId> {
        Ok(self.store(store_id)?.read(|record| record.next_version_id))
    }

    /// Whether `version` exists only inside this source and must not be cached.
    fn is_staged(&self, _store_id: StoreId, _version: VersionId) -> bool {
        false
    }
}

impl NodeSource for AvmRepository {
    fn repo(&self) -> &AvmRepository {
        self
    }

    fn node(&self, id: NodeId) -> AvmResult<Arc<Node>> {
        self.arena.get(id).ok_or_else(|| AvmError::NotFound(format!("Node {}", id)))
    }

    fn head_root(&self, store_id: StoreId) -> AvmResult<NodeId> {
        Ok(self.store(store_id)?.read(|record| record.head_root))
    }
}
