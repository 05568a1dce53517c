use anyhow::anyhow;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLockReadGuard;
use uuid::Uuid;

use crate::fs::error::{AvmError, AvmResult};
use crate::types::{ContentId, NodeId, StoreId, VersionId, VersionRef};

use super::events::IndexEvent;
use super::models::{Node, NodeKind};
use super::repository::{AvmRepository, NodeSource};
use super::traits::PropertyOwner;

/// A snapshot that becomes a version when its transaction commits.
#[derive(Debug, Clone)]
struct StagedVersion {
    store_id: StoreId,
    id: VersionId,
    root: NodeId,
    tag: Option<String>,
    description: Option<String>,
}

/// A pending head mutation.
///
/// New and modified nodes, head roots, snapshots, content and property copies
/// are staged here and published together by [`Txn::commit`]. Dropping a
/// transaction discards everything it staged, leaving the stores untouched.
pub struct Txn<'a> {
    repo: &'a AvmRepository,
    principal: String,
    nodes: HashMap<NodeId, Arc<Node>>,
    roots: HashMap<StoreId, NodeId>,
    dirty: HashSet<StoreId>,
    versions: Vec<StagedVersion>,
    property_copies: Vec<(NodeId, NodeId)>,
    blob_writes: Vec<(ContentId, Vec<u8>)>,
    events: Vec<IndexEvent>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl<'a> Txn<'a> {
    pub async fn begin(repo: &'a AvmRepository, principal: &str) -> Txn<'a> {
        let gate = repo.gate.read().await;
        Txn {
            repo,
            principal: principal.to_string(),
            nodes: HashMap::new(),
            roots: HashMap::new(),
            dirty: HashSet::new(),
            versions: Vec::new(),
            property_copies: Vec::new(),
            blob_writes: Vec::new(),
            events: Vec::new(),
            _gate: gate,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Allocates a fresh head node in `store_id`.
    ///
    /// With a `predecessor`, the node continues that node's history and keeps
    /// its creator, owner and creation time.
    pub fn create_node(
        &mut self,
        store_id: StoreId,
        kind: NodeKind,
        predecessor: Option<&Node>,
    ) -> AvmResult<NodeId> {
        let id = self.repo.arena.allocate_id();
        let version_id = self.next_version_id(store_id)?;
        let now = Utc::now();
        let (creator, owner, created_at) = match predecessor {
            Some(p) => (p.creator.clone(), p.owner.clone(), p.created_at),
            None => (self.principal.clone(), self.principal.clone(), now),
        };
        let node = Node {
            id,
            kind,
            creator,
            owner,
            last_modifier: self.principal.clone(),
            guid: Uuid::new_v4(),
            created_at,
            modified_at: now,
            ancestor: predecessor.map(|p| p.id),
            store_id,
            version_id,
            mod_seq: self.repo.arena.next_mod_seq(),
        };
        self.nodes.insert(id, Arc::new(node));
        self.dirty.insert(store_id);
        Ok(id)
    }

    /// Mutable access to a head node, refusing nodes frozen by a snapshot.
    pub fn node_mut(&mut self, id: NodeId) -> AvmResult<&mut Node> {
        let current = self.node(id)?;
        let next = self.next_version_id(current.store_id)?;
        if !current.is_writable_in(current.store_id, next) {
            return Err(AvmError::Storage(anyhow!("node {} is frozen by a snapshot", id)));
        }
        self.dirty.insert(current.store_id);
        let mod_seq = self.repo.arena.next_mod_seq();
        let principal = self.principal.clone();
        let slot = self.nodes.entry(id).or_insert(current);
        let node = Arc::make_mut(slot);
        node.mod_seq = mod_seq;
        node.modified_at = Utc::now();
        node.last_modifier = principal;
        Ok(node)
    }

    pub fn set_head_root(&mut self, store_id: StoreId, root: NodeId) {
        self.roots.insert(store_id, root);
        self.dirty.insert(store_id);
    }

    /// Stages a snapshot of the store's head as this transaction sees it.
    ///
    /// Reads at the returned version resolve right away. Nodes created
    /// afterwards belong to the head that follows it.
    pub fn stage_snapshot(
        &mut self,
        store_id: StoreId,
        tag: Option<&str>,
        description: Option<&str>,
    ) -> AvmResult<VersionId> {
        let id = self.next_version_id(store_id)?;
        let root = self.head_root(store_id)?;
        let store = self.store(store_id)?.name();
        self.dirty.remove(&store_id);
        self.versions.push(StagedVersion {
            store_id,
            id,
            root,
            tag: tag.map(str::to_string),
            description: description.map(str::to_string),
        });
        self.events.push(IndexEvent::Snapshotted { store, version: id });
        Ok(id)
    }

    fn staged(&self, store_id: StoreId, id: VersionId) -> Option<&StagedVersion> {
        self.versions.iter().find(|v| v.store_id == store_id && v.id == id)
    }

    pub fn copy_properties(&mut self, from: NodeId, to: NodeId) {
        self.property_copies.push((from, to));
    }

    pub fn write_blob(&mut self, content_id: ContentId, bytes: Vec<u8>) {
        self.blob_writes.push((content_id, bytes));
    }

    pub fn emit(&mut self, event: IndexEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.roots.is_empty() && self.versions.is_empty()
    }

    /// Publishes staged content and properties first, then nodes, then head
    /// roots and versions.
    pub async fn commit(self) -> AvmResult<()> {
        let Txn {
            repo,
            principal,
            nodes,
            roots,
            dirty,
            versions,
            property_copies,
            blob_writes,
            events,
            _gate,
        } = self;

        for (content_id, bytes) in blob_writes {
            repo.blobs.put(content_id, bytes).await?;
        }
        for (from, to) in property_copies {
            repo.properties.copy_all(PropertyOwner::Node(from), PropertyOwner::Node(to)).await?;
        }

        let node_count = nodes.len();
        repo.arena.insert_all(nodes.into_values().collect());
        let mut stores: Vec<StoreId> = dirty
            .iter()
            .chain(roots.keys())
            .copied()
            .chain(versions.iter().map(|v| v.store_id))
            .collect();
        stores.sort_unstable();
        stores.dedup();
        for store_id in stores {
            if let Ok(handle) = repo.stores.get_by_id(store_id) {
                handle.update(|record| {
                    if let Some(root) = roots.get(&store_id) {
                        record.head_root = *root;
                    }
                    for staged in versions.iter().filter(|v| v.store_id == store_id) {
                        record.push_version(
                            staged.root,
                            &principal,
                            staged.tag.clone(),
                            staged.description.clone(),
                        );
                    }
                    if dirty.contains(&store_id) {
                        record.dirty = true;
                    }
                });
            }
        }
        if let Some(metrics) = &repo.metrics {
            metrics.nodes.set(repo.arena.len() as f64);
            metrics.snapshots_total.inc_by(versions.len() as f64);
        }
        for staged in &versions {
            tracing::info!(
                store_id = staged.store_id,
                version = staged.id,
                tag = staged.tag.as_deref(),
                "Created snapshot"
            );
        }
        drop(_gate);

        tracing::trace!(nodes = node_count, events = events.len(), "Committed transaction");
        for event in events {
            repo.index.notify(event);
        }
        Ok(())
    }
}

impl NodeSource for Txn<'_> {
    fn repo(&self) -> &AvmRepository {
        self.repo
    }

    fn node(&self, id: NodeId) -> AvmResult<Arc<Node>> {
        match self.nodes.get(&id) {
            Some(node) => Ok(node.clone()),
            None => self.repo.node(id),
        }
    }

    fn head_root(&self, store_id: StoreId) -> AvmResult<NodeId> {
        match self.roots.get(&store_id) {
            Some(root) => Ok(*root),
            None => self.repo.head_root(store_id),
        }
    }

    fn root(&self, store_id: StoreId, version: VersionRef) -> AvmResult<NodeId> {
        match version {
            VersionRef::Head => self.head_root(store_id),
            VersionRef::At(id) => match self.staged(store_id, id) {
                Some(staged) => Ok(staged.root),
                None => self.repo.root(store_id, version),
            },
        }
    }

    fn next_version_id(&self, store_id: StoreId) -> AvmResult<VersionId> {
        match self.versions.iter().rev().find(|v| v.store_id == store_id) {
            Some(staged) => Ok(staged.id + 1),
            None => self.repo.next_version_id(store_id),
        }
    }

    fn is_staged(&self, store_id: StoreId, version: VersionId) -> bool {
        self.staged(store_id, version).is_some()
    }
}
