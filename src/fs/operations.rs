use std::sync::Arc;

use crate::fs::error::{AvmError, AvmResult};
use crate::fs::path::{AvmPath, validate_name};
use crate::layer::cow::{WritePath, lookup_for_write, put_entry, put_tombstone, remove_entry};
use crate::layer::union_view::{
    Lookup, LookupComponent, deleted_names, describe, directory_fallback, file_content,
    list_directory, lookup, lookup_child,
};
use crate::storage::events::IndexEvent;
use crate::storage::models::{
    ChildEntry, ContentRef, Entries, Indirection, LayeringInfo, Node, NodeDescriptor, NodeKind,
    entry_key,
};
use crate::storage::repository::{AvmRepository, NodeSource};
use crate::storage::store::{StoreHandle, StoreLocks, lock_stores};
use crate::storage::traits::AccessOperation;
use crate::storage::txn::Txn;
use crate::types::{NodeId, StoreId, VersionRef};

use crate::composition::ancestry::PathFinder;
use crate::composition::resolver::{indirection_path, layering_info, validate_no_cycle};

/// Client handle onto a repository, acting as one principal.
///
/// Cheap to clone. Every operation runs to completion before returning and
/// either commits all of its head changes or none of them.
#[derive(Clone)]
pub struct AvmService {
    pub(crate) repo: Arc<AvmRepository>,
    pub(crate) principal: String,
}

impl AvmService {
    pub fn new(repo: Arc<AvmRepository>) -> Self {
        let principal = repo.config().default_principal.clone();
        Self { repo, principal }
    }

    pub fn as_user(&self, principal: &str) -> Self {
        Self { repo: self.repo.clone(), principal: principal.to_string() }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn repository(&self) -> &Arc<AvmRepository> {
        &self.repo
    }

    pub(crate) async fn lock(&self, store: &str) -> AvmResult<(Arc<StoreHandle>, StoreLocks)> {
        let handle = self.repo.stores.get(store)?;
        let locks = lock_stores(std::slice::from_ref(&handle)).await;
        // Purged while we waited.
        self.repo.stores.get_by_id(handle.id)?;
        Ok((handle, locks))
    }

    pub(crate) async fn authorize(&self, path: &str, operation: AccessOperation) -> AvmResult<()> {
        self.repo.authorize(&self.principal, path, operation).await
    }

    /// Parses `store:/path[@version]` into an indirection target.
    pub(crate) fn parse_target(&self, target: &str) -> AvmResult<Indirection> {
        let parsed = AvmPath::parse(target)?;
        let handle = self.repo.stores.get(&parsed.store)?;
        let version = parsed.version.map(VersionRef::At).unwrap_or(VersionRef::Head);
        Ok(Indirection { store_id: handle.id, path: parsed.path, version })
    }

    /// Resolves a read path. An `@version` suffix applies when `version` is head.
    pub(crate) fn resolve_read(
        &self,
        version: VersionRef,
        path: &str,
        include_deleted: bool,
    ) -> AvmResult<(AvmPath, Lookup)> {
        let parsed = AvmPath::parse(path)?;
        let version = match (version, parsed.version) {
            (VersionRef::Head, Some(v)) => VersionRef::At(v),
            (version, _) => version,
        };
        let handle = self.repo.stores.get(&parsed.store)?;
        let found = lookup(self.repo.as_ref(), handle.id, version, &parsed.path, include_deleted)?;
        Ok((parsed, found))
    }

    pub(crate) fn describe_head(&self, path: &AvmPath) -> AvmResult<NodeDescriptor> {
        let handle = self.repo.stores.get(&path.store)?;
        let found = lookup(self.repo.as_ref(), handle.id, VersionRef::Head, &path.path, true)?;
        Ok(describe(self.repo.as_ref(), path.to_string(), found.last()))
    }

    pub(crate) fn describe_node(&self, node: Arc<Node>) -> NodeDescriptor {
        let fallback = directory_fallback(&node, None);
        let native_store = node.store_id;
        let component = LookupComponent {
            name: String::new(),
            node,
            primary: true,
            local: true,
            context: None,
            fallback,
            native_store,
        };
        describe(self.repo.as_ref(), String::new(), &component)
    }

    pub async fn lookup(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
    ) -> AvmResult<NodeDescriptor> {
        self.lookup_with_deleted(version, path, false).await
    }

    /// Like [`AvmService::lookup`], optionally returning tombstones.
    pub async fn lookup_with_deleted(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
        include_deleted: bool,
    ) -> AvmResult<NodeDescriptor> {
        let version = version.into();
        instrumented!(self.repo, "lookup", {
            let (parsed, found) = self.resolve_read(version, path, include_deleted)?;
            Ok(describe(self.repo.as_ref(), parsed.to_string(), found.last()))
        })
    }

    /// Directory contents sorted by name. `direct` lists only local entries.
    pub async fn get_directory_listing(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
        direct: bool,
    ) -> AvmResult<Vec<NodeDescriptor>> {
        let version = version.into();
        instrumented!(self.repo, "get_directory_listing", {
            let (parsed, found) = self.resolve_read(version, path, false)?;
            let listing = list_directory(self.repo.as_ref(), found.last(), direct, false)?;
            let mut result = Vec::with_capacity(listing.len());
            for (_, entry) in listing {
                let child = lookup_child(self.repo.as_ref(), found.last(), &entry.name, false)?;
                result.push(describe(self.repo.as_ref(), parsed.join(&entry.name).to_string(), &child));
            }
            Ok(result)
        })
    }

    /// Names tombstoned directly in a directory.
    pub async fn get_deleted(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
    ) -> AvmResult<Vec<String>> {
        let version = version.into();
        instrumented!(self.repo, "get_deleted", {
            let (_, found) = self.resolve_read(version, path, false)?;
            deleted_names(self.repo.as_ref(), found.last())
        })
    }

    /// Bytes served at `path`, reading through layered files and directories.
    pub async fn get_file_content(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
    ) -> AvmResult<Vec<u8>> {
        let version = version.into();
        instrumented!(self.repo, "get_file_content", {
            let (parsed, found) = self.resolve_read(version, path, false)?;
            let Some(content) = file_content(self.repo.as_ref(), found.node())? else {
                return Ok(Vec::new());
            };
            self.repo
                .blobs
                .get(content.content_id)
                .await?
                .ok_or_else(|| AvmError::NotFound(format!("content of {}", parsed)))
        })
    }

    pub async fn create_file(
        &self,
        parent: &str,
        name: &str,
        bytes: &[u8],
    ) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "create_file", {
            let content = ContentRef::for_bytes(bytes);
            let content_id = content.content_id;
            let path = self
                .create_child(parent, name, |_| Ok(NodeKind::PlainFile { content: Some(content) }), |txn| {
                    txn.write_blob(content_id, bytes.to_vec())
                })
                .await?;
            self.describe_head(&path)
        })
    }

    /// Creates a directory. Inside a layered directory the new directory is
    /// itself layered so that same-named content below keeps showing through.
    pub async fn create_directory(&self, parent: &str, name: &str) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "create_directory", {
            let path = self
                .create_child(
                    parent,
                    name,
                    |dir| {
                        Ok(if dir.falls_through() {
                            NodeKind::LayeredDirectory {
                                indirection: None,
                                opacity: false,
                                entries: Entries::new(),
                            }
                        } else {
                            NodeKind::PlainDirectory { entries: Entries::new() }
                        })
                    },
                    |_| {},
                )
                .await?;
            self.describe_head(&path)
        })
    }

    /// Creates a layered directory at `parent/name` delegating to `target`.
    pub async fn create_layered_directory(
        &self,
        target: &str,
        parent: &str,
        name: &str,
    ) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "create_layered_directory", {
            let indirection = self.parse_target(target)?;
            let path = self
                .create_child(
                    parent,
                    name,
                    |_| {
                        Ok(NodeKind::LayeredDirectory {
                            indirection: Some(indirection.clone()),
                            opacity: false,
                            entries: Entries::new(),
                        })
                    },
                    |_| {},
                )
                .await?;
            tracing::info!(path = %path, target, "Created layered directory");
            self.describe_head(&path)
        })
    }

    pub async fn create_layered_file(
        &self,
        target: &str,
        parent: &str,
        name: &str,
    ) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "create_layered_file", {
            let indirection = self.parse_target(target)?;
            let path = self
                .create_child(
                    parent,
                    name,
                    |_| Ok(NodeKind::LayeredFile { indirection: indirection.clone() }),
                    |_| {},
                )
                .await?;
            self.describe_head(&path)
        })
    }

    /// Shared body of the create operations: copy-on-write down to `parent`,
    /// refuse live names, validate layered targets, bind the new node.
    async fn create_child(
        &self,
        parent: &str,
        name: &str,
        kind: impl FnOnce(&LookupComponent) -> AvmResult<NodeKind>,
        stage: impl FnOnce(&mut Txn<'_>),
    ) -> AvmResult<AvmPath> {
        let parent = AvmPath::parse(parent)?;
        validate_name(name)?;
        let path = parent.join(name);
        self.authorize(&path.to_string(), AccessOperation::Create).await?;

        let (handle, _locks) = self.lock(&parent.store).await?;
        let mut txn = Txn::begin(&self.repo, &self.principal).await;
        let wp = lookup_for_write(&mut txn, handle.id, &parent.path)?;
        let dir = directory_target(&txn, &wp, &parent)?;
        let predecessor = vacant_slot(&txn, &dir, name, &path)?;

        let kind = kind(&dir)?;
        if let NodeKind::LayeredDirectory { indirection: Some(target), .. }
        | NodeKind::LayeredFile { indirection: target } = &kind
        {
            validate_no_cycle(&txn, handle.id, &path.path, target)?;
        }
        stage(&mut txn);
        let id = txn.create_node(handle.id, kind, predecessor.as_deref())?;
        put_entry(&mut txn, wp.target_id(), name, id, true)?;
        txn.emit(IndexEvent::Created { path: path.to_string(), node_id: id });
        txn.commit().await?;

        tracing::debug!(path = %path, node_id = id, "Created node");
        Ok(path)
    }

    pub async fn write_file(&self, path: &str, bytes: &[u8]) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "write_file", {
            let path = AvmPath::parse(path)?;
            self.authorize(&path.to_string(), AccessOperation::Write).await?;
            let (handle, _locks) = self.lock(&path.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let wp = lookup_for_write(&mut txn, handle.id, &path.path)?;
            let id = wp.target_id();
            let content = ContentRef::for_bytes(bytes);
            txn.write_blob(content.content_id, bytes.to_vec());
            if !txn.node(id)?.is_file() {
                return Err(AvmError::WrongType(format!("{} is not a file", path)));
            }
            txn.node_mut(id)?.kind = NodeKind::PlainFile { content: Some(content) };
            txn.emit(IndexEvent::Modified { path: path.to_string(), node_id: id });
            txn.commit().await?;
            self.describe_head(&path)
        })
    }

    /// Replaces `parent/name` with a tombstone.
    pub async fn remove_node(&self, parent: &str, name: &str) -> AvmResult<()> {
        instrumented!(self.repo, "remove_node", {
            let parent = AvmPath::parse(parent)?;
            let path = parent.join(name);
            self.authorize(&path.to_string(), AccessOperation::Delete).await?;
            let (handle, _locks) = self.lock(&parent.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let wp = lookup_for_write(&mut txn, handle.id, &parent.path)?;
            let dir = directory_target(&txn, &wp, &parent)?;
            let child = lookup_child(&txn, &dir, name, false)
                .map_err(|_| AvmError::NotFound(path.to_string()))?;
            put_tombstone(&mut txn, handle.id, wp.target_id(), &child.name, &child.node)?;
            txn.emit(IndexEvent::Deleted { path: path.to_string() });
            txn.commit().await?;
            tracing::debug!(path = %path, "Removed node");
            Ok(())
        })
    }

    /// Drops the local override of `name` in a layered directory, exposing what lies below.
    pub async fn uncover(&self, dir_path: &str, name: &str) -> AvmResult<()> {
        instrumented!(self.repo, "uncover", {
            let parent = AvmPath::parse(dir_path)?;
            let path = parent.join(name);
            self.authorize(&path.to_string(), AccessOperation::Delete).await?;
            let (handle, _locks) = self.lock(&parent.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let wp = lookup_for_write(&mut txn, handle.id, &parent.path)?;
            let dir = wp.target(&txn)?;
            if !matches!(dir.node.kind, NodeKind::LayeredDirectory { .. }) {
                return Err(AvmError::WrongType(format!("{} is not a layered directory", parent)));
            }
            if remove_entry(&mut txn, wp.target_id(), name)?.is_none() {
                return Err(AvmError::NotFound(format!("No override for {}", path)));
            }
            txn.emit(IndexEvent::Modified { path: parent.to_string(), node_id: wp.target_id() });
            txn.commit().await?;
            Ok(())
        })
    }

    pub async fn retarget_layered_directory(
        &self,
        path: &str,
        target: &str,
    ) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "retarget_layered_directory", {
            let path = AvmPath::parse(path)?;
            let indirection = self.parse_target(target)?;
            self.authorize(&path.to_string(), AccessOperation::Write).await?;
            let (handle, _locks) = self.lock(&path.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            validate_no_cycle(&txn, handle.id, &path.path, &indirection)?;
            let wp = lookup_for_write(&mut txn, handle.id, &path.path)?;
            let id = wp.target_id();
            match &mut txn.node_mut(id)?.kind {
                NodeKind::LayeredDirectory { indirection: current, .. } => {
                    *current = Some(indirection);
                }
                _ => return Err(AvmError::WrongType(format!("{} is not a layered directory", path))),
            }
            txn.emit(IndexEvent::Modified { path: path.to_string(), node_id: id });
            txn.commit().await?;
            tracing::info!(path = %path, target, "Retargeted layered directory");
            self.describe_head(&path)
        })
    }

    pub async fn set_opacity(&self, path: &str, opacity: bool) -> AvmResult<()> {
        instrumented!(self.repo, "set_opacity", {
            let path = AvmPath::parse(path)?;
            self.authorize(&path.to_string(), AccessOperation::Write).await?;
            let (handle, _locks) = self.lock(&path.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let wp = lookup_for_write(&mut txn, handle.id, &path.path)?;
            let id = wp.target_id();
            match &mut txn.node_mut(id)?.kind {
                NodeKind::LayeredDirectory { opacity: current, .. } => *current = opacity,
                _ => return Err(AvmError::WrongType(format!("{} is not a layered directory", path))),
            }
            txn.emit(IndexEvent::Modified { path: path.to_string(), node_id: id });
            txn.commit().await?;
            Ok(())
        })
    }

    /// Binds an existing node under a second name. The new entry is not primary.
    pub async fn link(&self, parent: &str, name: &str, node_id: NodeId) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "link", {
            let parent = AvmPath::parse(parent)?;
            validate_name(name)?;
            let path = parent.join(name);
            self.authorize(&path.to_string(), AccessOperation::Create).await?;
            let (handle, _locks) = self.lock(&parent.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let node = txn.node(node_id)?;
            if node.is_deleted() {
                return Err(AvmError::BadArgument(format!("node {} is a tombstone", node_id)));
            }
            let mutable_elsewhere = node.store_id != handle.id
                && txn
                    .next_version_id(node.store_id)
                    .is_ok_and(|next| node.is_writable_in(node.store_id, next));
            if mutable_elsewhere {
                return Err(AvmError::BadArgument(format!(
                    "node {} is still mutable in another store's head",
                    node_id
                )));
            }
            let wp = lookup_for_write(&mut txn, handle.id, &parent.path)?;
            let in_path = wp.ids.contains(&node_id)
                || wp.lookup.components.iter().any(|c| c.node.id == node_id);
            if in_path {
                return Err(AvmError::BadArgument(format!("{} would contain itself", path)));
            }
            let dir = directory_target(&txn, &wp, &parent)?;
            vacant_slot(&txn, &dir, name, &path)?;
            put_entry(&mut txn, wp.target_id(), name, node_id, false)?;
            txn.emit(IndexEvent::Created { path: path.to_string(), node_id });
            txn.commit().await?;
            self.describe_head(&path)
        })
    }

    /// Makes `path` the canonical path of its node within the store head.
    pub async fn make_primary(&self, path: &str) -> AvmResult<()> {
        instrumented!(self.repo, "make_primary", {
            let path = AvmPath::parse(path)?;
            let (parent, name) = path.parent_and_name()?;
            self.authorize(&path.to_string(), AccessOperation::Write).await?;
            let (handle, _locks) = self.lock(&path.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;

            let target = lookup(&txn, handle.id, VersionRef::Head, &path.path, false)?;
            let node_id = target.node().id;
            let mut finder = PathFinder::new(&txn, node_id);
            let others: Vec<String> = finder
                .paths_from(handle.id, VersionRef::Head)?
                .into_iter()
                .map(|p| p.path)
                .filter(|p| !p.eq_ignore_ascii_case(&path.path))
                .collect();

            for other in others {
                let other = AvmPath::new(&path.store, &other)?;
                let (other_parent, other_name) = other.parent_and_name()?;
                let wp = lookup_for_write(&mut txn, handle.id, &other_parent.path)?;
                set_primary(&mut txn, wp.target_id(), &other_name, false)?;
            }
            let wp = lookup_for_write(&mut txn, handle.id, &parent.path)?;
            let dir = wp.target(&txn)?;
            if dir.node.entries().and_then(|e| e.get(&entry_key(&name))).is_none() {
                // Seen through indirection only: pin it locally first.
                lookup_for_write(&mut txn, handle.id, &path.path)?;
            }
            let wp = lookup_for_write(&mut txn, handle.id, &parent.path)?;
            set_primary(&mut txn, wp.target_id(), &name, true)?;
            txn.commit().await?;
            Ok(())
        })
    }

    /// Moves `src_parent/src_name` to `dst_parent/dst_name`, possibly across stores.
    pub async fn rename(
        &self,
        src_parent: &str,
        src_name: &str,
        dst_parent: &str,
        dst_name: &str,
    ) -> AvmResult<()> {
        instrumented!(self.repo, "rename", {
            let src_parent = AvmPath::parse(src_parent)?;
            let dst_parent = AvmPath::parse(dst_parent)?;
            validate_name(dst_name)?;
            let src = src_parent.join(src_name);
            let dst = dst_parent.join(dst_name);
            if dst.is_within(&src) && !dst.path.eq_ignore_ascii_case(&src.path) {
                return Err(AvmError::BadArgument(format!("cannot move {} into {}", src, dst)));
            }
            self.authorize(&src.to_string(), AccessOperation::Delete).await?;
            self.authorize(&dst.to_string(), AccessOperation::Create).await?;

            let src_handle = self.repo.stores.get(&src.store)?;
            let dst_handle = self.repo.stores.get(&dst.store)?;
            let _locks = lock_stores(&[src_handle.clone(), dst_handle.clone()]).await;
            self.repo.stores.get_by_id(src_handle.id)?;
            self.repo.stores.get_by_id(dst_handle.id)?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;

            let wp = lookup_for_write(&mut txn, src_handle.id, &src_parent.path)?;
            let dir = directory_target(&txn, &wp, &src_parent)?;
            let child = lookup_child(&txn, &dir, src_name, false)
                .map_err(|_| AvmError::NotFound(src.to_string()))?;
            put_tombstone(&mut txn, src_handle.id, wp.target_id(), &child.name, &child.node)?;

            let detached = detach_kind(&child)
                .or_else(|| (src_handle.id != dst_handle.id).then(|| child.node.kind.clone()));
            let moved = match detached {
                Some(kind) => {
                    if let NodeKind::LayeredDirectory { indirection: Some(target), .. } = &kind {
                        validate_no_cycle(&txn, dst_handle.id, &dst.path, target)?;
                    }
                    let kind = adopt(&mut txn, dst_handle.id, kind, 0)?;
                    let id = txn.create_node(dst_handle.id, kind, Some(&child.node))?;
                    txn.copy_properties(child.node.id, id);
                    id
                }
                None => {
                    if let NodeKind::LayeredDirectory { indirection: Some(target), .. } =
                        &child.node.kind
                    {
                        validate_no_cycle(&txn, dst_handle.id, &dst.path, target)?;
                    }
                    child.node.id
                }
            };

            let wp = lookup_for_write(&mut txn, dst_handle.id, &dst_parent.path)?;
            let dir = directory_target(&txn, &wp, &dst_parent)?;
            vacant_slot(&txn, &dir, dst_name, &dst)?;
            put_entry(&mut txn, wp.target_id(), dst_name, moved, true)?;
            txn.emit(IndexEvent::Renamed { from: src.to_string(), to: dst.to_string() });
            txn.commit().await?;
            tracing::info!(from = %src, to = %dst, "Renamed node");
            Ok(())
        })
    }

    /// Deep copy that resolves layering into plain nodes.
    pub async fn copy(
        &self,
        version: impl Into<VersionRef>,
        src_path: &str,
        dst_parent: &str,
        name: &str,
    ) -> AvmResult<NodeDescriptor> {
        let version = version.into();
        instrumented!(self.repo, "copy", {
            let dst_parent = AvmPath::parse(dst_parent)?;
            validate_name(name)?;
            let dst = dst_parent.join(name);
            let src = AvmPath::parse(src_path)?;
            if version.is_head() && src.version.is_none() && dst.is_within(&src) {
                return Err(AvmError::BadArgument(format!("cannot copy {} into itself", src)));
            }
            self.authorize(&dst.to_string(), AccessOperation::Create).await?;
            let (handle, _locks) = self.lock(&dst.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let (_, found) = self.resolve_read(version, src_path, false)?;
            let wp = lookup_for_write(&mut txn, handle.id, &dst_parent.path)?;
            let dir = directory_target(&txn, &wp, &dst_parent)?;
            let predecessor = vacant_slot(&txn, &dir, name, &dst)?;
            let id = materialize(&mut txn, handle.id, found.last(), 0, predecessor.as_deref())?;
            put_entry(&mut txn, wp.target_id(), name, id, true)?;
            txn.emit(IndexEvent::Created { path: dst.to_string(), node_id: id });
            txn.commit().await?;
            self.describe_head(&dst)
        })
    }

    /// Copies everything down to `path` into the head without other change.
    pub async fn force_copy(&self, path: &str) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "force_copy", {
            let path = AvmPath::parse(path)?;
            self.authorize(&path.to_string(), AccessOperation::Write).await?;
            let (handle, _locks) = self.lock(&path.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            lookup_for_write(&mut txn, handle.id, &path.path)?;
            txn.commit().await?;
            self.describe_head(&path)
        })
    }

    /// Replaces the node at `path` with a copy of an historic node, continuing its history.
    pub async fn revert(&self, path: &str, to_node: NodeId) -> AvmResult<NodeDescriptor> {
        instrumented!(self.repo, "revert", {
            let path = AvmPath::parse(path)?;
            let (parent, name) = path.parent_and_name()?;
            self.authorize(&path.to_string(), AccessOperation::Write).await?;
            let (handle, _locks) = self.lock(&path.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let historic = txn.node(to_node)?;
            if historic.is_deleted() {
                return Err(AvmError::BadArgument(format!("node {} is a tombstone", to_node)));
            }
            let wp = lookup_for_write(&mut txn, handle.id, &parent.path)?;
            let dir = directory_target(&txn, &wp, &parent)?;
            let current = lookup_child(&txn, &dir, &name, false)
                .map_err(|_| AvmError::NotFound(path.to_string()))?;
            let kind = adopt(&mut txn, handle.id, historic.kind.clone(), 0)?;
            let id = txn.create_node(handle.id, kind, Some(&current.node))?;
            txn.copy_properties(historic.id, id);
            put_entry(&mut txn, wp.target_id(), &current.name, id, current.primary)?;
            txn.emit(IndexEvent::Modified { path: path.to_string(), node_id: id });
            txn.commit().await?;
            tracing::info!(path = %path, to_node, "Reverted node");
            self.describe_head(&path)
        })
    }

    pub async fn get_indirection_path(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
    ) -> AvmResult<String> {
        let version = version.into();
        instrumented!(self.repo, "get_indirection_path", {
            let parsed = AvmPath::parse(path)?;
            let handle = self.repo.stores.get(&parsed.store)?;
            let target = indirection_path(self.repo.as_ref(), handle.id, version, &parsed.path)?;
            let store = self.repo.stores.get_by_id(target.store_id)?.name();
            Ok(format!("{}:{}", store, target.path))
        })
    }

    pub async fn get_layering_info(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
    ) -> AvmResult<LayeringInfo> {
        let version = version.into();
        instrumented!(self.repo, "get_layering_info", {
            let parsed = AvmPath::parse(path)?;
            let handle = self.repo.stores.get(&parsed.store)?;
            layering_info(self.repo.as_ref(), handle.id, version, &parsed.path)
        })
    }
}

/// The writable directory at the end of `wp`.
pub(crate) fn directory_target(
    txn: &Txn<'_>,
    wp: &WritePath,
    shown: &AvmPath,
) -> AvmResult<LookupComponent> {
    let dir = wp.target(txn)?;
    if !dir.node.is_directory() {
        return Err(AvmError::WrongType(format!("{} is not a directory", shown)));
    }
    Ok(dir)
}

/// Fails with `Exists` when `name` is live in `dir`; returns a tombstone it may replace.
pub(crate) fn vacant_slot(
    src: &dyn NodeSource,
    dir: &LookupComponent,
    name: &str,
    shown: &AvmPath,
) -> AvmResult<Option<Arc<Node>>> {
    match lookup_child(src, dir, name, true) {
        Ok(existing) if existing.node.is_deleted() => Ok(Some(existing.node)),
        Ok(_) => Err(AvmError::Exists(shown.to_string())),
        Err(AvmError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn set_primary(txn: &mut Txn<'_>, dir_id: NodeId, name: &str, primary: bool) -> AvmResult<()> {
    let dir = txn.node_mut(dir_id)?;
    if let Some(entry) = dir.entries_mut().and_then(|e| e.get_mut(&entry_key(name))) {
        entry.primary = primary;
    }
    Ok(())
}

/// Replacement kind for a node leaving its layered context, or `None` to move it as is.
pub(crate) fn detach_kind(child: &LookupComponent) -> Option<NodeKind> {
    let node = &child.node;
    match &node.kind {
        NodeKind::PlainDirectory { .. } | NodeKind::LayeredDirectory { .. } if !child.local => {
            Some(NodeKind::LayeredDirectory {
                indirection: child.context.clone(),
                opacity: false,
                entries: Entries::new(),
            })
        }
        NodeKind::LayeredDirectory { indirection: None, opacity, entries } => {
            Some(NodeKind::LayeredDirectory {
                indirection: child.fallback.clone(),
                opacity: *opacity,
                entries: entries.clone(),
            })
        }
        _ if !child.local => Some(node.kind.clone()),
        _ => None,
    }
}

/// Writes a plain deep copy of `source` into the head of `store_id`.
pub(crate) fn materialize(
    txn: &mut Txn<'_>,
    store_id: StoreId,
    source: &LookupComponent,
    depth: usize,
    predecessor: Option<&Node>,
) -> AvmResult<NodeId> {
    let max = txn.repo().config.max_path_depth;
    if depth > max {
        return Err(AvmError::BadArgument(format!("copy deeper than {} levels", max)));
    }
    let node = &source.node;
    let kind = if node.is_directory() {
        let listing = list_directory(&*txn, source, false, false)?;
        let mut entries = Entries::new();
        for (key, listed) in listing {
            let child = lookup_child(&*txn, source, &listed.name, false)?;
            let id = materialize(txn, store_id, &child, depth + 1, None)?;
            entries.insert(key, ChildEntry { name: listed.name, node_id: id, primary: true });
        }
        NodeKind::PlainDirectory { entries }
    } else if node.is_file() {
        NodeKind::PlainFile { content: file_content(&*txn, node)? }
    } else {
        return Err(AvmError::NotFound(format!("node {} is deleted", node.id)));
    };
    let id = txn.create_node(store_id, kind, predecessor)?;
    txn.copy_properties(node.id, id);
    Ok(id)
}

/// Whether `node` lives in another store's head and can still change there.
pub(crate) fn mutable_outside(src: &dyn NodeSource, node: &Node, store_id: StoreId) -> bool {
    node.store_id != store_id
        && src
            .next_version_id(node.store_id)
            .is_ok_and(|next| node.is_writable_in(node.store_id, next))
}

/// Rebinds the children of `kind` that are still writable in another store's
/// head to copies owned by `store_id`.
///
/// Frozen children are shared as they are, since nothing below them changes.
pub(crate) fn adopt(
    txn: &mut Txn<'_>,
    store_id: StoreId,
    mut kind: NodeKind,
    depth: usize,
) -> AvmResult<NodeKind> {
    let max = txn.repo().config.max_path_depth;
    if depth > max {
        return Err(AvmError::BadArgument(format!("move deeper than {} levels", max)));
    }
    let children: Vec<(String, NodeId)> = match kind.entries() {
        Some(entries) => entries.iter().map(|(key, e)| (key.clone(), e.node_id)).collect(),
        None => return Ok(kind),
    };
    for (key, node_id) in children {
        let child = txn.node(node_id)?;
        if !mutable_outside(&*txn, &child, store_id) {
            continue;
        }
        let child_kind = adopt(txn, store_id, child.kind.clone(), depth + 1)?;
        let id = txn.create_node(store_id, child_kind, Some(child.as_ref()))?;
        txn.copy_properties(child.id, id);
        if let Some(entry) = kind.entries_mut().and_then(|entries| entries.get_mut(&key)) {
            entry.node_id = id;
        }
    }
    Ok(kind)
}
