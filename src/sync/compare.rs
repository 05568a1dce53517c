//! Lock-step tree comparison.
//!
//! Both sides are walked together in lower-cased name order. A subtree shared
//! by node id is skipped outright, and a layered directory that falls through
//! to exactly the other side only has its local overrides inspected. Each
//! reported difference sits at the highest level where the sides diverge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::composition::ancestry::is_ancestor;
use crate::fs::error::{AvmError, AvmResult};
use crate::fs::path::join_path;
use crate::layer::union_view::{LookupComponent, list_directory, lookup, lookup_child};
use crate::storage::repository::NodeSource;
use crate::types::{StoreId, VersionRef};

use super::filter::NameFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffCode {
    /// The source side is newer or the destination lacks it.
    Newer,
    /// The destination side is newer or the source lacks it.
    Older,
}

impl DiffCode {
    pub fn reversed(self) -> Self {
        match self {
            DiffCode::Newer => DiffCode::Older,
            DiffCode::Older => DiffCode::Newer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difference {
    pub source_version: VersionRef,
    pub source_path: String,
    pub dest_version: VersionRef,
    pub dest_path: String,
    pub code: DiffCode,
    /// Position in the pre-order walk. Ancestors always sort first.
    pub order_value: u64,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.code {
            DiffCode::Newer => '>',
            DiffCode::Older => '<',
        };
        write!(f, "[{} {} {}]", self.source_path, arrow, self.dest_path)
    }
}

/// One side of a comparison.
#[derive(Debug, Clone)]
pub struct Side {
    pub store_id: StoreId,
    pub store_name: String,
    pub version: VersionRef,
    pub path: String,
}

impl Side {
    fn child(&self, name: &str) -> Side {
        Side { path: join_path(&self.path, name), ..self.clone() }
    }

    fn display(&self) -> String {
        format!("{}:{}", self.store_name, self.path)
    }
}

struct Walker<'s> {
    src: &'s dyn NodeSource,
    filter: Option<&'s NameFilter>,
    max_depth: usize,
    diffs: Vec<Difference>,
}

/// Compares `source` against `dest`. A missing source is an error; a missing
/// destination yields a single `Newer` difference.
pub fn compare_trees(
    src: &dyn NodeSource,
    source: &Side,
    dest: &Side,
    filter: Option<&NameFilter>,
) -> AvmResult<Vec<Difference>> {
    let from = lookup(src, source.store_id, source.version, &source.path, false)?;
    let to = resolve_optional(src, dest)?;
    let mut walker = Walker {
        src,
        filter: filter.filter(|f| !f.is_empty()),
        max_depth: src.repo().config.max_path_depth,
        diffs: Vec::new(),
    };
    walker.walk(Some(from.last().clone()), to, source, dest, 0)?;
    Ok(walker.diffs)
}

fn resolve_optional(src: &dyn NodeSource, side: &Side) -> AvmResult<Option<LookupComponent>> {
    match lookup(src, side.store_id, side.version, &side.path, true) {
        Ok(found) => Ok(Some(found.last().clone())),
        Err(AvmError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn child_optional(
    src: &dyn NodeSource,
    parent: Option<&LookupComponent>,
    name: &str,
) -> AvmResult<Option<LookupComponent>> {
    let Some(parent) = parent.filter(|p| p.node.is_directory()) else {
        return Ok(None);
    };
    match lookup_child(src, parent, name, true) {
        Ok(child) => Ok(Some(child)),
        Err(AvmError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl Walker<'_> {
    fn push(&mut self, source: &Side, dest: &Side, code: DiffCode) {
        let order_value = self.diffs.len() as u64;
        self.diffs.push(Difference {
            source_version: source.version,
            source_path: source.display(),
            dest_version: dest.version,
            dest_path: dest.display(),
            code,
            order_value,
        });
    }

    fn walk(
        &mut self,
        from: Option<LookupComponent>,
        to: Option<LookupComponent>,
        source: &Side,
        dest: &Side,
        depth: usize,
    ) -> AvmResult<()> {
        if depth > self.max_depth {
            return Err(AvmError::BadArgument(format!(
                "comparison deeper than {} levels at {}",
                self.max_depth,
                source.display()
            )));
        }
        let (from, to) = match (from, to) {
            (None, None) => return Ok(()),
            (Some(f), None) => {
                if !f.node.is_deleted() {
                    self.push(source, dest, DiffCode::Newer);
                }
                return Ok(());
            }
            (None, Some(t)) => {
                if !t.node.is_deleted() {
                    self.push(source, dest, DiffCode::Older);
                }
                return Ok(());
            }
            (Some(f), Some(t)) => (f, t),
        };

        if from.node.id == to.node.id || (from.node.is_deleted() && to.node.is_deleted()) {
            return Ok(());
        }
        if from.node.is_directory() && to.node.is_directory() {
            return self.walk_directories(&from, &to, source, dest, depth);
        }
        let code = self.newer_side(&from, &to);
        self.push(source, dest, code);
        Ok(())
    }

    fn newer_side(&self, from: &LookupComponent, to: &LookupComponent) -> DiffCode {
        if is_ancestor(self.src, to.node.id, &from.node) {
            return DiffCode::Newer;
        }
        if is_ancestor(self.src, from.node.id, &to.node) {
            return DiffCode::Older;
        }
        let from_key = (from.node.mod_seq, from.node.id);
        let to_key = (to.node.mod_seq, to.node.id);
        if from_key > to_key { DiffCode::Newer } else { DiffCode::Older }
    }

    fn walk_directories(
        &mut self,
        from: &LookupComponent,
        to: &LookupComponent,
        source: &Side,
        dest: &Side,
        depth: usize,
    ) -> AvmResult<()> {
        // A layer over exactly the other side only differs in its own entries.
        let from_over_to = from.falls_through()
            && from
                .fallback
                .as_ref()
                .is_some_and(|f| f.addresses(dest.store_id, &dest.path, dest.version));
        let to_over_from = to.falls_through()
            && to
                .fallback
                .as_ref()
                .is_some_and(|f| f.addresses(source.store_id, &source.path, source.version));

        let mut names: BTreeMap<String, String> = BTreeMap::new();
        if from_over_to || to_over_from {
            let layer = if from_over_to { from } else { to };
            for (key, entry) in list_directory(self.src, layer, true, true)? {
                names.insert(key, entry.name);
            }
            if from_over_to && to_over_from {
                for (key, entry) in list_directory(self.src, to, true, true)? {
                    names.entry(key).or_insert(entry.name);
                }
            }
        } else {
            for (key, entry) in list_directory(self.src, from, false, true)? {
                names.insert(key, entry.name);
            }
            for (key, entry) in list_directory(self.src, to, false, true)? {
                names.entry(key).or_insert(entry.name);
            }
        }

        for name in names.into_values() {
            if self.filter.is_some_and(|f| f.excludes(&name)) {
                continue;
            }
            let from_child = child_optional(self.src, Some(from), &name)?;
            let to_child = child_optional(self.src, Some(to), &name)?;
            let source_child = source.child(&name);
            let dest_child = dest.child(&name);
            self.walk(from_child, to_child, &source_child, &dest_child, depth + 1)?;
        }
        Ok(())
    }
}
