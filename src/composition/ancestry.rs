use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::fs::error::AvmResult;
use crate::fs::path::join_path;
use crate::storage::models::Node;
use crate::storage::repository::NodeSource;
use crate::types::{NodeId, StoreId, VersionRef};

/// Predecessors of `node`, newest first, at most `limit` of them.
///
/// The chain ends early where the reaper has already reclaimed a predecessor.
pub fn history(src: &dyn NodeSource, node: &Node, limit: usize) -> Vec<Arc<Node>> {
    let mut result = Vec::new();
    let mut next = node.ancestor;
    while let Some(id) = next {
        if result.len() >= limit {
            break;
        }
        let Ok(ancestor) = src.node(id) else {
            break;
        };
        next = ancestor.ancestor;
        result.push(ancestor);
    }
    result
}

/// True when `candidate` appears in the predecessor chain of `node`.
pub fn is_ancestor(src: &dyn NodeSource, candidate: NodeId, node: &Node) -> bool {
    let mut next = node.ancestor;
    while let Some(id) = next {
        if id == candidate {
            return true;
        }
        // Predecessors always carry smaller ids.
        if id < candidate {
            return false;
        }
        next = match src.node(id) {
            Ok(ancestor) => ancestor.ancestor,
            Err(_) => None,
        };
    }
    false
}

/// Most recent node present in both predecessor chains, walking them alternately.
pub fn common_ancestor(src: &dyn NodeSource, a: &Node, b: &Node) -> Option<Arc<Node>> {
    let mut seen_a: HashSet<NodeId> = HashSet::new();
    let mut seen_b: HashSet<NodeId> = HashSet::new();
    let mut next_a = Some(a.id);
    let mut next_b = Some(b.id);

    while next_a.is_some() || next_b.is_some() {
        if let Some(id) = next_a {
            if seen_b.contains(&id) {
                return src.node(id).ok();
            }
            seen_a.insert(id);
            next_a = src.node(id).ok().and_then(|n| n.ancestor);
        }
        if let Some(id) = next_b {
            if seen_a.contains(&id) {
                return src.node(id).ok();
            }
            seen_b.insert(id);
            next_b = src.node(id).ok().and_then(|n| n.ancestor);
        }
    }
    None
}

/// A place a node is reachable from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePath {
    pub store_id: StoreId,
    pub version: VersionRef,
    pub path: String,
    /// Every entry on the way is marked primary.
    pub primary: bool,
}

/// Reverse index over plain directory entries.
///
/// Subtrees shared between versions are only searched once: whether a
/// subtree contains the target is memoized by node id.
pub struct PathFinder<'s> {
    src: &'s dyn NodeSource,
    target: NodeId,
    contains: HashMap<NodeId, bool>,
}

impl<'s> PathFinder<'s> {
    pub fn new(src: &'s dyn NodeSource, target: NodeId) -> Self {
        Self { src, target, contains: HashMap::new() }
    }

    /// Every path to the target under the root of `(store_id, version)`.
    pub fn paths_from(
        &mut self,
        store_id: StoreId,
        version: VersionRef,
    ) -> AvmResult<Vec<NodePath>> {
        let root = self.src.root(store_id, version)?;
        let mut found = Vec::new();
        self.collect(root, "/".to_string(), true, &mut |path, primary| {
            found.push(NodePath { store_id, version, path, primary })
        })?;
        Ok(found)
    }

    fn subtree_contains(&mut self, id: NodeId) -> AvmResult<bool> {
        if id == self.target {
            return Ok(true);
        }
        if let Some(known) = self.contains.get(&id) {
            return Ok(*known);
        }
        let node = self.src.node(id)?;
        let mut result = false;
        if let Some(entries) = node.entries() {
            for entry in entries.values() {
                if self.subtree_contains(entry.node_id)? {
                    result = true;
                    break;
                }
            }
        }
        self.contains.insert(id, result);
        Ok(result)
    }

    fn collect(
        &mut self,
        id: NodeId,
        path: String,
        primary: bool,
        emit: &mut dyn FnMut(String, bool),
    ) -> AvmResult<()> {
        if id == self.target {
            emit(path.clone(), primary);
        }
        if !self.subtree_contains(id)? {
            return Ok(());
        }
        let node = self.src.node(id)?;
        let Some(entries) = node.entries() else {
            return Ok(());
        };
        for entry in entries.values() {
            if entry.node_id == self.target || self.subtree_contains(entry.node_id)? {
                let child_path = join_path(&path, &entry.name);
                self.collect(entry.node_id, child_path, primary && entry.primary, emit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::cow::put_entry;
    use crate::storage::models::{Entries, NodeKind, StoreRecord};
    use crate::storage::repository::AvmRepository;
    use crate::storage::txn::Txn;
    use chrono::Utc;

    fn store(repo: &AvmRepository) -> StoreId {
        let id = repo.stores.allocate_id();
        repo.stores
            .insert(StoreRecord {
                id,
                name: "main".to_string(),
                creator: "system".to_string(),
                created_at: Utc::now(),
                head_root: 0,
                versions: Vec::new(),
                next_version_id: 1,
                dirty: false,
            })
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_history_and_common_ancestor() {
        let repo = AvmRepository::in_memory();
        let main = store(&repo);
        let mut txn = Txn::begin(&repo, "system").await;
        let base = txn.create_node(main, NodeKind::PlainFile { content: None }, None).unwrap();
        let base_node = txn.node(base).unwrap();
        let left = txn.create_node(main, NodeKind::PlainFile { content: None }, Some(&base_node)).unwrap();
        let right =
            txn.create_node(main, NodeKind::PlainFile { content: None }, Some(&base_node)).unwrap();
        let right_node = txn.node(right).unwrap();
        let right2 =
            txn.create_node(main, NodeKind::PlainFile { content: None }, Some(&right_node)).unwrap();

        let left_node = txn.node(left).unwrap();
        let right2_node = txn.node(right2).unwrap();

        let chain = history(&txn, &right2_node, 10);
        assert_eq!(chain.iter().map(|n| n.id).collect::<Vec<_>>(), vec![right, base]);
        assert_eq!(history(&txn, &right2_node, 1).len(), 1);

        let common = common_ancestor(&txn, &left_node, &right2_node).unwrap();
        assert_eq!(common.id, base);
        assert!(is_ancestor(&txn, base, &right2_node));
        assert!(!is_ancestor(&txn, left, &right2_node));

        let unrelated = txn.create_node(main, NodeKind::PlainFile { content: None }, None).unwrap();
        let unrelated = txn.node(unrelated).unwrap();
        assert!(common_ancestor(&txn, &left_node, &unrelated).is_none());
    }

    #[tokio::test]
    async fn test_paths_prefer_primary() {
        let repo = AvmRepository::in_memory();
        let main = store(&repo);
        let mut txn = Txn::begin(&repo, "system").await;
        let foo = txn.create_node(main, NodeKind::PlainFile { content: None }, None).unwrap();
        let a = txn.create_node(main, NodeKind::PlainDirectory { entries: Entries::new() }, None).unwrap();
        let b = txn.create_node(main, NodeKind::PlainDirectory { entries: Entries::new() }, None).unwrap();
        put_entry(&mut txn, a, "foo", foo, true).unwrap();
        put_entry(&mut txn, b, "alias", foo, false).unwrap();
        let root =
            txn.create_node(main, NodeKind::PlainDirectory { entries: Entries::new() }, None).unwrap();
        put_entry(&mut txn, root, "a", a, true).unwrap();
        put_entry(&mut txn, root, "b", b, true).unwrap();
        txn.set_head_root(main, root);

        let mut finder = PathFinder::new(&txn, foo);
        let paths = finder.paths_from(main, VersionRef::Head).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().any(|p| p.path == "/a/foo" && p.primary));
        assert!(paths.iter().any(|p| p.path == "/b/alias" && !p.primary));
    }
}
