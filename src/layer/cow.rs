//! Copy-on-write module.
//!
//! Before a head path is mutated every node on the way down is made writable
//! in the target store, one level at a time. Nodes frozen by a snapshot get a
//! shallow copy of the same kind; nodes seen through a layered directory get a
//! local override that keeps tracking its counterpart below. Unmodified
//! siblings stay shared with earlier versions.

use std::sync::Arc;

use crate::fs::error::{AvmError, AvmResult};
use crate::storage::models::{ChildEntry, Entries, Node, NodeKind, entry_key};
use crate::storage::repository::NodeSource;
use crate::storage::txn::Txn;
use crate::types::{NodeId, StoreId, VersionRef};

use super::union_view::{Lookup, LookupComponent, directory_fallback, lookup};

/// A head path whose nodes are all writable in the pending transaction.
#[derive(Debug, Clone)]
pub struct WritePath {
    pub store_id: StoreId,
    /// Writable node ids, root first.
    pub ids: Vec<NodeId>,
    /// The resolution the copies were made from.
    pub lookup: Lookup,
}

impl WritePath {
    pub fn target_id(&self) -> NodeId {
        self.ids[self.ids.len() - 1]
    }

    /// The writable node at `index`, with the layering context it was found in.
    pub fn component(&self, txn: &Txn<'_>, index: usize) -> AvmResult<LookupComponent> {
        let found = &self.lookup.components[index];
        let node = txn.node(self.ids[index])?;
        let fallback = directory_fallback(&node, found.context.as_ref());
        Ok(LookupComponent {
            name: found.name.clone(),
            node,
            primary: found.primary,
            local: true,
            context: found.context.clone(),
            fallback,
            native_store: self.store_id,
        })
    }

    pub fn target(&self, txn: &Txn<'_>) -> AvmResult<LookupComponent> {
        self.component(txn, self.ids.len() - 1)
    }

    pub fn path(&self) -> String {
        self.lookup.path()
    }
}

/// Kind of the local override created for a node seen through indirection.
pub(crate) fn override_kind(node: &Node) -> NodeKind {
    match &node.kind {
        NodeKind::PlainDirectory { .. } | NodeKind::LayeredDirectory { .. } => {
            NodeKind::LayeredDirectory { indirection: None, opacity: false, entries: Entries::new() }
        }
        other => other.clone(),
    }
}

/// Resolves `path` in the head of `store_id` and copies whatever is not yet writable.
pub fn lookup_for_write(txn: &mut Txn<'_>, store_id: StoreId, path: &str) -> AvmResult<WritePath> {
    let found = lookup(txn, store_id, VersionRef::Head, path, false)?;
    let next = txn.next_version_id(store_id)?;

    let mut ids: Vec<NodeId> = Vec::with_capacity(found.components.len());
    let mut background = false;
    for (index, component) in found.components.iter().enumerate() {
        background |= !component.local;
        let node = &component.node;
        if !background && node.is_writable_in(store_id, next) {
            ids.push(node.id);
            continue;
        }

        let kind = if background { override_kind(node) } else { node.kind.clone() };
        let copy = txn.create_node(store_id, kind, Some(node))?;
        txn.copy_properties(node.id, copy);
        tracing::debug!(
            store_id,
            path = %found.path(),
            level = index,
            from = node.id,
            to = copy,
            layered_override = background,
            "Copy on write"
        );

        match ids.last() {
            None => txn.set_head_root(store_id, copy),
            Some(parent) => {
                let primary = background || component.primary;
                put_entry(txn, *parent, &component.name, copy, primary)?;
            }
        }
        ids.push(copy);
    }

    Ok(WritePath { store_id, ids, lookup: found })
}

/// Binds `name` in a writable directory, keeping the spelling of an existing entry.
pub fn put_entry(
    txn: &mut Txn<'_>,
    dir_id: NodeId,
    name: &str,
    node_id: NodeId,
    primary: bool,
) -> AvmResult<()> {
    let dir = txn.node_mut(dir_id)?;
    let entries = dir
        .entries_mut()
        .ok_or_else(|| AvmError::WrongType(format!("node {} is not a directory", dir_id)))?;
    let key = entry_key(name);
    let name = entries.get(&key).map(|e| e.name.clone()).unwrap_or_else(|| name.to_string());
    entries.insert(key, ChildEntry { name, node_id, primary });
    Ok(())
}

pub fn remove_entry(txn: &mut Txn<'_>, dir_id: NodeId, name: &str) -> AvmResult<Option<ChildEntry>> {
    let dir = txn.node_mut(dir_id)?;
    let entries = dir
        .entries_mut()
        .ok_or_else(|| AvmError::WrongType(format!("node {} is not a directory", dir_id)))?;
    Ok(entries.remove(&entry_key(name)))
}

/// Records a tombstone for `removed` under `name`.
pub fn put_tombstone(
    txn: &mut Txn<'_>,
    store_id: StoreId,
    dir_id: NodeId,
    name: &str,
    removed: &Arc<Node>,
) -> AvmResult<NodeId> {
    let tombstone = txn.create_node(store_id, removed.tombstone_kind(), Some(removed))?;
    put_entry(txn, dir_id, name, tombstone, true)?;
    Ok(tombstone)
}
