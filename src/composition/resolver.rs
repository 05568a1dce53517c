use std::collections::HashSet;

use crate::fs::error::{AvmError, AvmResult};
use crate::fs::path::{components_of, join_path, path_is_within};
use crate::layer::union_view::{LookupComponent, display_path, local_child, lookup};
use crate::storage::models::{Indirection, LayeringInfo};
use crate::storage::repository::NodeSource;
use crate::types::{StoreId, VersionRef};

/// Rejects an indirection whose resolution would pass back through `(own_store, own_path)`.
///
/// Every jump the target's resolution makes is followed, as is the fallback of
/// whatever the target finally resolves to. Targets that do not resolve yet are
/// accepted.
pub fn validate_no_cycle(
    src: &dyn NodeSource,
    own_store: StoreId,
    own_path: &str,
    target: &Indirection,
) -> AvmResult<()> {
    let max_hops = src.repo().config.max_indirection_depth;
    let own = display_path(src, own_store, own_path);
    let mut pending = vec![(target.clone(), 0usize)];
    let mut visited = HashSet::new();

    while let Some((frontier, hops)) = pending.pop() {
        let shown = display_path(src, frontier.store_id, &frontier.path);
        if frontier.version.is_head()
            && frontier.store_id == own_store
            && path_is_within(&frontier.path, own_path)
        {
            return Err(AvmError::Cycle(format!("{} would resolve through {}", own, shown)));
        }
        if hops > max_hops {
            return Err(AvmError::Cycle(format!("more than {} hops following {}", max_hops, shown)));
        }
        let key = (frontier.store_id, frontier.path.to_lowercase(), frontier.version);
        if !visited.insert(key) {
            continue;
        }
        if let Some(next) = next_hop(src, &frontier)? {
            pending.push((next, hops + 1));
        }
    }
    Ok(())
}

/// Walks `frontier` locally until resolution would leave the tree it started in.
fn next_hop(src: &dyn NodeSource, frontier: &Indirection) -> AvmResult<Option<Indirection>> {
    let root = match src.root(frontier.store_id, frontier.version) {
        Ok(root) => src.node(root)?,
        Err(AvmError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let names = components_of(&frontier.path);
    let mut current = LookupComponent::root(root, frontier.store_id);

    for (index, name) in names.iter().enumerate() {
        if !current.node.is_directory() {
            return Ok(None);
        }
        match local_child(src, &current, name)? {
            Some(child) if child.node.is_deleted() => return Ok(None),
            Some(child) => current = child,
            None if current.falls_through() => {
                let Some(fallback) = current.fallback.clone() else {
                    return Ok(None);
                };
                let rest = names[index..].iter().fold(fallback.path.clone(), |acc, n| join_path(&acc, n));
                return Ok(Some(Indirection { path: rest, ..fallback }));
            }
            None => return Ok(None),
        }
    }
    Ok(current.indirection())
}

pub fn layering_info(
    src: &dyn NodeSource,
    store_id: StoreId,
    version: VersionRef,
    path: &str,
) -> AvmResult<LayeringInfo> {
    let found = lookup(src, store_id, version, path, false)?;
    Ok(LayeringInfo {
        background: found.is_background(),
        path_store: src.store(store_id)?.name(),
        native_store: src.store(found.last().native_store)?.name(),
    })
}

/// Where a node inside a layered context maps to in the layer below.
pub fn indirection_path(
    src: &dyn NodeSource,
    store_id: StoreId,
    version: VersionRef,
    path: &str,
) -> AvmResult<Indirection> {
    let found = lookup(src, store_id, version, path, false)?;
    let last = found.last();
    last.indirection().or_else(|| last.context.clone()).ok_or_else(|| {
        AvmError::WrongType(format!(
            "{} is not in a layered context",
            display_path(src, store_id, path)
        ))
    })
}
