use crate::fs::error::{AvmError, AvmResult};
use crate::fs::operations::{AvmService, detach_kind, directory_target, vacant_slot};
use crate::fs::path::{AvmPath, validate_name};
use crate::layer::cow::{lookup_for_write, put_entry};
use crate::layer::union_view::lookup;
use crate::storage::events::IndexEvent;
use crate::storage::models::NodeDescriptor;
use crate::storage::repository::NodeSource;
use crate::storage::store::lock_stores;
use crate::storage::traits::AccessOperation;
use crate::storage::txn::Txn;
use crate::types::{NodeId, VersionRef};

use super::ancestry::{NodePath, PathFinder, common_ancestor, history};

impl AvmService {
    /// Forks `src_path` into `dst_parent/name`.
    ///
    /// A head source is snapshotted first so the branch point is addressable.
    /// That snapshot is only kept when the branch is created.
    /// The new node shares structure with the source and records it as its
    /// predecessor.
    pub async fn create_branch(
        &self,
        version: impl Into<VersionRef>,
        src_path: &str,
        dst_parent: &str,
        name: &str,
    ) -> AvmResult<NodeDescriptor> {
        let version = version.into();
        instrumented!(self.repo, "create_branch", {
            let src = AvmPath::parse(src_path)?;
            let dst_parent = AvmPath::parse(dst_parent)?;
            validate_name(name)?;
            let dst = dst_parent.join(name);
            if dst.is_within(&src) {
                return Err(AvmError::Cycle(format!("{} would be branched into itself", src)));
            }
            self.authorize(&dst.to_string(), AccessOperation::Create).await?;

            let src_handle = self.repo.stores.get(&src.store)?;
            let dst_handle = self.repo.stores.get(&dst.store)?;
            let _locks = lock_stores(&[src_handle.clone(), dst_handle.clone()]).await;
            self.repo.stores.get_by_id(src_handle.id)?;
            self.repo.stores.get_by_id(dst_handle.id)?;

            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let version = match (version, src.version) {
                (VersionRef::Head, Some(v)) => VersionRef::At(v),
                (VersionRef::Head, None) => {
                    let note = format!("branch point for {}", dst);
                    VersionRef::At(txn.stage_snapshot(src_handle.id, None, Some(&note))?)
                }
                (pinned, _) => pinned,
            };
            let found = lookup(&txn, src_handle.id, version, &src.path, false)?;
            let source = found.last().clone();
            let kind = detach_kind(&source).unwrap_or_else(|| source.node.kind.clone());

            let wp = lookup_for_write(&mut txn, dst_handle.id, &dst_parent.path)?;
            let dir = directory_target(&txn, &wp, &dst_parent)?;
            vacant_slot(&txn, &dir, name, &dst)?;
            let id = txn.create_node(dst_handle.id, kind, Some(&source.node))?;
            txn.copy_properties(source.node.id, id);
            put_entry(&mut txn, wp.target_id(), name, id, true)?;
            txn.emit(IndexEvent::Created { path: dst.to_string(), node_id: id });
            txn.commit().await?;

            tracing::info!(
                source = %src,
                version = %version,
                branch = %dst,
                node_id = id,
                "Created branch"
            );
            self.describe_head(&dst)
        })
    }

    /// Predecessors of a node, newest first.
    pub async fn get_history(
        &self,
        node_id: NodeId,
        limit: usize,
    ) -> AvmResult<Vec<NodeDescriptor>> {
        instrumented!(self.repo, "get_history", {
            let node = self.repo.node(node_id)?;
            Ok(history(self.repo.as_ref(), &node, limit)
                .into_iter()
                .map(|n| self.describe_node(n))
                .collect())
        })
    }

    pub async fn get_common_ancestor(
        &self,
        a: NodeId,
        b: NodeId,
    ) -> AvmResult<Option<NodeDescriptor>> {
        instrumented!(self.repo, "get_common_ancestor", {
            let a = self.repo.node(a)?;
            let b = self.repo.node(b)?;
            Ok(common_ancestor(self.repo.as_ref(), &a, &b).map(|n| self.describe_node(n)))
        })
    }

    /// Every `(version, store:/path)` a node is reachable from, heads included.
    pub async fn get_paths(&self, node_id: NodeId) -> AvmResult<Vec<(VersionRef, String)>> {
        instrumented!(self.repo, "get_paths", {
            Ok(self.find_paths(node_id, true)?.into_iter().map(|p| self.render(p)).collect())
        })
    }

    /// Head paths only.
    pub async fn get_head_paths(&self, node_id: NodeId) -> AvmResult<Vec<(VersionRef, String)>> {
        instrumented!(self.repo, "get_head_paths", {
            Ok(self.find_paths(node_id, false)?.into_iter().map(|p| self.render(p)).collect())
        })
    }

    /// Head paths of a node within a single store, as plain paths.
    pub async fn get_paths_in_store_head(
        &self,
        node_id: NodeId,
        store: &str,
    ) -> AvmResult<Vec<String>> {
        instrumented!(self.repo, "get_paths_in_store_head", {
            let handle = self.repo.stores.get(store)?;
            let mut finder = PathFinder::new(self.repo.as_ref(), node_id);
            Ok(finder
                .paths_from(handle.id, VersionRef::Head)?
                .into_iter()
                .map(|p| p.path)
                .collect())
        })
    }

    /// One path to the node, preferring the head and then canonical entries.
    pub async fn get_a_path(&self, node_id: NodeId) -> AvmResult<Option<(VersionRef, String)>> {
        instrumented!(self.repo, "get_a_path", {
            let mut paths = self.find_paths(node_id, true)?;
            paths.sort_by_key(|p| (!p.version.is_head(), !p.primary));
            Ok(paths.into_iter().next().map(|p| self.render(p)))
        })
    }

    fn find_paths(&self, node_id: NodeId, include_versions: bool) -> AvmResult<Vec<NodePath>> {
        self.repo.node(node_id)?;
        let mut finder = PathFinder::new(self.repo.as_ref(), node_id);
        let mut found = Vec::new();
        for handle in self.repo.stores.all() {
            found.extend(finder.paths_from(handle.id, VersionRef::Head)?);
            if include_versions {
                let ids: Vec<_> = handle.read(|r| r.versions.iter().map(|v| v.id).collect());
                for id in ids {
                    found.extend(finder.paths_from(handle.id, VersionRef::At(id))?);
                }
            }
        }
        Ok(found)
    }

    fn render(&self, path: NodePath) -> (VersionRef, String) {
        let store = self
            .repo
            .stores
            .get_by_id(path.store_id)
            .map(|h| h.name())
            .unwrap_or_else(|_| format!("#{}", path.store_id));
        (path.version, format!("{}:{}", store, path.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::AvmRepository;

    #[tokio::test]
    async fn test_branch_snapshots_source_and_links_history() {
        let service = AvmService::new(AvmRepository::in_memory());
        service.create_store("main").await.unwrap();
        service.create_directory("main:/", "a").await.unwrap();
        service.create_file("main:/a", "foo", b"hi").await.unwrap();

        let source = service.lookup(-1, "main:/a").await.unwrap();
        let branch = service.create_branch(-1, "main:/a", "main:/", "branch").await.unwrap();
        assert_eq!(service.get_next_version_id("main").await.unwrap(), 2);
        assert_eq!(branch.ancestor, Some(source.id));

        let history = service.get_history(branch.id, 10).await.unwrap();
        assert_eq!(history[0].id, source.id);
        let common = service.get_common_ancestor(branch.id, source.id).await.unwrap();
        assert_eq!(common.map(|n| n.id), Some(source.id));
    }

    #[tokio::test]
    async fn test_branch_into_itself_is_rejected() {
        let service = AvmService::new(AvmRepository::in_memory());
        service.create_store("main").await.unwrap();
        service.create_directory("main:/", "a").await.unwrap();
        let result = service.create_branch(-1, "main:/a", "main:/a", "inner").await;
        assert!(matches!(result, Err(AvmError::Cycle(_))));
    }

    #[tokio::test]
    async fn test_paths_cover_versions_and_head() {
        let service = AvmService::new(AvmRepository::in_memory());
        service.create_store("main").await.unwrap();
        service.create_directory("main:/", "a").await.unwrap();
        let foo = service.create_file("main:/a", "foo", b"hi").await.unwrap();
        service.create_snapshot("main", None, None).await.unwrap();
        service.link("main:/", "alias", foo.id).await.unwrap();

        let head = service.get_head_paths(foo.id).await.unwrap();
        assert_eq!(head.len(), 2);
        let all = service.get_paths(foo.id).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(
            service.get_a_path(foo.id).await.unwrap(),
            Some((VersionRef::Head, "main:/a/foo".to_string()))
        );
        let mut in_head = service.get_paths_in_store_head(foo.id, "main").await.unwrap();
        in_head.sort();
        assert_eq!(in_head, vec!["/a/foo".to_string(), "/alias".to_string()]);
    }
}
