use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::fs::error::{AvmError, AvmResult};
use crate::fs::operations::{AvmService, directory_target, materialize};
use crate::fs::path::{AvmPath, path_is_within};
use crate::layer::cow::{lookup_for_write, put_entry, put_tombstone};
use crate::layer::union_view::{LookupComponent, file_content, list_directory, lookup, lookup_child};
use crate::storage::events::IndexEvent;
use crate::storage::models::{ChildEntry, Entries, Node, NodeKind};
use crate::storage::repository::NodeSource;
use crate::storage::store::{StoreHandle, lock_stores};
use crate::storage::traits::AccessOperation;
use crate::storage::txn::Txn;
use crate::types::{NodeId, StoreId, VersionRef};

use super::compare::{DiffCode, Difference};
use super::filter::NameFilter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOptions {
    /// Differences whose final name matches are skipped.
    pub filter: Option<NameFilter>,
    /// Snapshot source stores even without pending changes.
    pub snapshot_source: bool,
    /// Snapshot destination stores afterwards. Off when batching several updates.
    pub snapshot_destination: bool,
    /// Skip `Older` differences instead of failing.
    pub ignore_older: bool,
    /// Apply `Older` differences, regressing the destination.
    pub override_older: bool,
    pub tag: Option<String>,
    pub description: Option<String>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            filter: None,
            snapshot_source: false,
            snapshot_destination: true,
            ignore_older: false,
            override_older: false,
            tag: None,
            description: None,
        }
    }
}

/// A difference with both paths resolved to stores.
#[derive(Debug, Clone)]
pub(crate) struct PlannedDiff {
    pub source_store: StoreId,
    pub source_version: VersionRef,
    pub source: AvmPath,
    pub dest_store: StoreId,
    pub dest: AvmPath,
}

/// Checks conflicts and resolves store names. Nothing is mutated.
pub(crate) fn plan(
    service: &AvmService,
    diffs: &[Difference],
    options: &UpdateOptions,
) -> AvmResult<(Vec<PlannedDiff>, Vec<Arc<StoreHandle>>)> {
    let mut planned = Vec::with_capacity(diffs.len());
    let mut handles: HashMap<StoreId, Arc<StoreHandle>> = HashMap::new();

    for diff in diffs {
        if options.filter.as_ref().is_some_and(|f| f.excludes_path(&diff.source_path)) {
            continue;
        }
        if diff.code == DiffCode::Older && !options.override_older {
            if options.ignore_older {
                tracing::debug!(diff = %diff, "Skipping older difference");
                continue;
            }
            return Err(AvmError::Conflict(format!("{} would regress the destination", diff)));
        }
        if !diff.dest_version.is_head() {
            return Err(AvmError::BadArgument(format!(
                "{} targets version {}, only heads can be updated",
                diff, diff.dest_version
            )));
        }
        let source = AvmPath::parse(&diff.source_path)?;
        let dest = AvmPath::parse(&diff.dest_path)?;
        if dest.is_root() {
            return Err(AvmError::BadArgument(format!("cannot replace the root {}", dest)));
        }
        let source_handle = service.repo.stores.get(&source.store)?;
        let dest_handle = service.repo.stores.get(&dest.store)?;
        planned.push(PlannedDiff {
            source_store: source_handle.id,
            source_version: diff.source_version,
            source,
            dest_store: dest_handle.id,
            dest,
        });
        handles.insert(source_handle.id, source_handle);
        handles.insert(dest_handle.id, dest_handle);
    }
    Ok((planned, handles.into_values().collect()))
}

/// Stages snapshots of source stores that need one and pins head reads to them.
///
/// The snapshots only become versions when `txn` commits. Callers hold the
/// write locks of every store involved.
pub(crate) fn pin_sources(
    txn: &mut Txn<'_>,
    planned: &mut [PlannedDiff],
    force: bool,
    note: &str,
) -> AvmResult<()> {
    let mut pinned: HashMap<StoreId, VersionRef> = HashMap::new();
    for diff in planned.iter_mut() {
        if !diff.source_version.is_head() {
            continue;
        }
        let version = match pinned.get(&diff.source_store) {
            Some(version) => *version,
            None => {
                let handle = txn.store(diff.source_store)?;
                let (dirty, latest) =
                    handle.read(|r| (r.dirty, r.latest_version().map(|v| v.id)));
                let id = match latest {
                    Some(id) if !dirty && !force => id,
                    _ => txn.stage_snapshot(diff.source_store, None, Some(note))?,
                };
                pinned.insert(diff.source_store, VersionRef::At(id));
                VersionRef::At(id)
            }
        };
        diff.source_version = version;
    }
    Ok(())
}

/// Applies planned differences inside `txn`. Returns the destination stores touched.
pub(crate) fn apply(txn: &mut Txn<'_>, planned: &[PlannedDiff]) -> AvmResult<Vec<StoreId>> {
    let mut touched = Vec::new();
    for diff in planned {
        let (parent, name) = diff.dest.parent_and_name()?;
        let resolved =
            lookup(&*txn, diff.source_store, diff.source_version, &diff.source.path, true);
        let source = match resolved {
            Ok(found) => Some(found.last().clone()),
            Err(AvmError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let wp = lookup_for_write(txn, diff.dest_store, &parent.path)?;
        let dir = directory_target(txn, &wp, &parent)?;
        let existing = match lookup_child(&*txn, &dir, &name, false) {
            Ok(child) => Some(child),
            Err(AvmError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        match source {
            Some(source) if !source.node.is_deleted() => {
                let predecessor = existing.as_ref().map(|c| c.node.clone());
                let id = import(txn, diff.dest_store, &source, &diff.dest, predecessor, 0)?;
                put_entry(txn, wp.target_id(), &name, id, true)?;
                let event = match existing {
                    Some(_) => IndexEvent::Modified { path: diff.dest.to_string(), node_id: id },
                    None => IndexEvent::Created { path: diff.dest.to_string(), node_id: id },
                };
                txn.emit(event);
            }
            _ => {
                if let Some(existing) = existing {
                    let dir_id = wp.target_id();
                    put_tombstone(txn, diff.dest_store, dir_id, &existing.name, &existing.node)?;
                    txn.emit(IndexEvent::Deleted { path: diff.dest.to_string() });
                }
            }
        }
        tracing::debug!(source = %diff.source, dest = %diff.dest, "Applied difference");
        if !touched.contains(&diff.dest_store) {
            touched.push(diff.dest_store);
        }
    }
    Ok(touched)
}

/// Node to bind at `dest` for `source`.
///
/// Frozen nodes that keep resolving the same way are shared by id. Layering
/// that only makes sense in the source context is rebuilt as plain nodes.
fn import(
    txn: &mut Txn<'_>,
    dest_store: StoreId,
    source: &LookupComponent,
    dest: &AvmPath,
    predecessor: Option<Arc<Node>>,
    depth: usize,
) -> AvmResult<NodeId> {
    let max = txn.repo().config.max_path_depth;
    if depth > max {
        return Err(AvmError::BadArgument(format!("update deeper than {} levels", max)));
    }
    let node = &source.node;
    let into_dest = |store_id: StoreId, path: &str, version: VersionRef| {
        version.is_head() && store_id == dest_store && path_is_within(path, &dest.path)
    };

    let context_bound = match &node.kind {
        NodeKind::LayeredDirectory { indirection: None, .. } => true,
        NodeKind::LayeredDirectory { indirection: Some(i), .. }
        | NodeKind::LayeredFile { indirection: i } => into_dest(i.store_id, &i.path, i.version),
        _ => false,
    };

    if context_bound {
        let kind = if node.is_directory() {
            let mut entries = Entries::new();
            for (key, listed) in list_directory(&*txn, source, false, false)? {
                let child = lookup_child(&*txn, source, &listed.name, false)?;
                let child_dest = dest.join(&listed.name);
                let id = import(txn, dest_store, &child, &child_dest, None, depth + 1)?;
                entries.insert(key, ChildEntry { name: listed.name, node_id: id, primary: true });
            }
            NodeKind::PlainDirectory { entries }
        } else {
            NodeKind::PlainFile { content: file_content(&*txn, node)? }
        };
        let id = txn.create_node(dest_store, kind, predecessor.as_deref())?;
        txn.copy_properties(node.id, id);
        return Ok(id);
    }

    let frozen = match txn.next_version_id(node.store_id) {
        Ok(next) => !node.is_writable_in(node.store_id, next),
        Err(_) => true,
    };
    if frozen {
        Ok(node.id)
    } else {
        materialize(txn, dest_store, source, depth, predecessor.as_deref())
    }
}

impl AvmService {
    /// Applies differences from their source to their destination, all or nothing.
    ///
    /// Sources are read at a snapshot taken first when they have pending
    /// changes. Destinations are snapshotted afterwards unless batching. No
    /// snapshot is published when any difference fails.
    pub async fn update(&self, diffs: &[Difference], options: &UpdateOptions) -> AvmResult<()> {
        instrumented!(self.repo, "update", {
            let (mut planned, handles) = plan(self, diffs, options)?;
            if planned.is_empty() {
                return Ok(());
            }
            for diff in &planned {
                self.authorize(&diff.dest.to_string(), AccessOperation::Write).await?;
            }
            let _locks = lock_stores(&handles).await;
            for handle in &handles {
                self.repo.stores.get_by_id(handle.id)?;
            }

            let mut txn = Txn::begin(&self.repo, &self.principal).await;
            pin_sources(&mut txn, &mut planned, options.snapshot_source, "update source")?;
            let touched = apply(&mut txn, &planned)?;
            if options.snapshot_destination {
                for store_id in &touched {
                    txn.stage_snapshot(
                        *store_id,
                        options.tag.as_deref(),
                        options.description.as_deref(),
                    )?;
                }
            }
            txn.commit().await?;
            tracing::info!(applied = planned.len(), stores = touched.len(), "Applied update");
            Ok(())
        })
    }
}
