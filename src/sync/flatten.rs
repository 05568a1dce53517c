use crate::fs::error::{AvmError, AvmResult};
use crate::fs::operations::AvmService;
use crate::fs::path::{AvmPath, join_path, split_path};
use crate::layer::cow::{lookup_for_write, remove_entry};
use crate::layer::union_view::{LookupComponent, local_child, lookup};
use crate::storage::events::IndexEvent;
use crate::storage::models::{Node, NodeKind};
use crate::storage::repository::NodeSource;
use crate::storage::store::lock_stores;
use crate::storage::traits::AccessOperation;
use crate::storage::txn::Txn;
use crate::types::VersionRef;

use super::compare::{Side, child_optional, compare_trees};
use super::update::{UpdateOptions, apply, pin_sources, plan};

fn is_override(node: &Node) -> bool {
    matches!(node.kind, NodeKind::LayeredDirectory { indirection: None, .. })
}

/// Collects layer-relative paths of local entries that match the target.
///
/// A nested override directory left without entries is removed as a whole.
/// Returns how many local entries stay.
fn collect_identical(
    src: &dyn NodeSource,
    layer: &LookupComponent,
    target: &LookupComponent,
    rel: &str,
    out: &mut Vec<String>,
    depth: usize,
) -> AvmResult<usize> {
    let max = src.repo().config.max_path_depth;
    if depth > max {
        return Err(AvmError::BadArgument(format!("flatten deeper than {} levels", max)));
    }
    let Some(entries) = layer.node.entries() else {
        return Ok(0);
    };
    let mut remaining = 0;
    for entry in entries.values() {
        let child_rel = join_path(rel, &entry.name);
        let Some(mine) = local_child(src, layer, &entry.name)? else {
            continue;
        };
        let theirs = child_optional(src, Some(target), &entry.name)?;
        let identical = match &theirs {
            Some(t) => t.node.id == mine.node.id || (t.node.is_deleted() && mine.node.is_deleted()),
            None => mine.node.is_deleted(),
        };
        if identical {
            out.push(child_rel);
            continue;
        }
        if let Some(t) = theirs.filter(|t| t.node.is_directory())
            && is_override(&mine.node)
        {
            let mut nested = Vec::new();
            let left = collect_identical(src, &mine, &t, &child_rel, &mut nested, depth + 1)?;
            if left == 0 {
                out.push(child_rel);
            } else {
                out.extend(nested);
                remaining += 1;
            }
            continue;
        }
        remaining += 1;
    }
    Ok(remaining)
}

impl AvmService {
    /// Promotes every override of a layer into the directory it covers, then
    /// drops the overrides so the layer passes straight through again.
    ///
    /// Running it on an already flat layer changes nothing.
    pub async fn flatten(&self, layer_path: &str, target_path: &str) -> AvmResult<()> {
        instrumented!(self.repo, "flatten", {
            let layer = AvmPath::parse(layer_path)?;
            let target = AvmPath::parse(target_path)?;
            self.authorize(&layer.to_string(), AccessOperation::Write).await?;
            self.authorize(&target.to_string(), AccessOperation::Write).await?;

            let layer_handle = self.repo.stores.get(&layer.store)?;
            let target_handle = self.repo.stores.get(&target.store)?;
            let _locks = lock_stores(&[layer_handle.clone(), target_handle.clone()]).await;
            self.repo.stores.get_by_id(layer_handle.id)?;
            self.repo.stores.get_by_id(target_handle.id)?;

            let found =
                lookup(self.repo.as_ref(), layer_handle.id, VersionRef::Head, &layer.path, false)?;
            if !matches!(found.node().kind, NodeKind::LayeredDirectory { .. }) {
                return Err(AvmError::WrongType(format!("{} is not a layered directory", layer)));
            }

            let layer_side = Side {
                store_id: layer_handle.id,
                store_name: layer_handle.name(),
                version: VersionRef::Head,
                path: layer.path.clone(),
            };
            let target_side = Side {
                store_id: target_handle.id,
                store_name: target_handle.name(),
                version: VersionRef::Head,
                path: target.path.clone(),
            };
            let diffs = compare_trees(self.repo.as_ref(), &layer_side, &target_side, None)?;
            let options = UpdateOptions {
                override_older: true,
                snapshot_destination: false,
                ..UpdateOptions::default()
            };
            let (mut planned, _) = plan(self, &diffs, &options)?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            if !planned.is_empty() {
                pin_sources(&mut txn, &mut planned, false, "flatten source")?;
            }
            apply(&mut txn, &planned)?;

            let layer_dir = lookup(&txn, layer_handle.id, VersionRef::Head, &layer.path, false)?;
            let target_dir = lookup(&txn, target_handle.id, VersionRef::Head, &target.path, false)?;
            let mut removals = Vec::new();
            collect_identical(&txn, layer_dir.last(), target_dir.last(), "/", &mut removals, 0)?;

            for rel in &removals {
                let (parent_rel, name) = split_path(rel)?;
                let parent = match parent_rel.as_str() {
                    "/" => layer.path.clone(),
                    nested => join_path(&layer.path, nested.trim_start_matches('/')),
                };
                let wp = lookup_for_write(&mut txn, layer_handle.id, &parent)?;
                remove_entry(&mut txn, wp.target_id(), &name)?;
            }
            if !removals.is_empty() {
                let layer_id = lookup(&txn, layer_handle.id, VersionRef::Head, &layer.path, false)?
                    .node()
                    .id;
                txn.emit(IndexEvent::Modified { path: layer.to_string(), node_id: layer_id });
            }
            txn.commit().await?;

            tracing::info!(
                layer = %layer,
                target = %target,
                promoted = planned.len(),
                removed = removals.len(),
                "Flattened layer"
            );
            Ok(())
        })
    }

    /// Discards every local override of a layered directory.
    pub async fn reset_layer(&self, path: &str) -> AvmResult<()> {
        instrumented!(self.repo, "reset_layer", {
            let path = AvmPath::parse(path)?;
            self.authorize(&path.to_string(), AccessOperation::Write).await?;
            let (handle, _locks) = self.lock(&path.store).await?;
            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            let found = lookup(&txn, handle.id, VersionRef::Head, &path.path, false)?;
            match &found.node().kind {
                NodeKind::LayeredDirectory { entries, .. } if entries.is_empty() => return Ok(()),
                NodeKind::LayeredDirectory { .. } => {}
                _ => {
                    return Err(AvmError::WrongType(format!("{} is not a layered directory", path)));
                }
            }
            let wp = lookup_for_write(&mut txn, handle.id, &path.path)?;
            let id = wp.target_id();
            if let Some(entries) = txn.node_mut(id)?.entries_mut() {
                entries.clear();
            }
            txn.emit(IndexEvent::Modified { path: path.to_string(), node_id: id });
            txn.commit().await?;
            tracing::info!(path = %path, "Reset layer");
            Ok(())
        })
    }
}
