//! Union view module.
//!
//! Resolves `store:/path` references component by component. Inside a
//! layered directory a name that is not overridden locally is looked up at
//! the directory's indirection target, using the layered node's own pinned
//! version, recursively across stores. Opaque directories only expose their
//! local entries.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fs::error::{AvmError, AvmResult};
use crate::fs::path::{components_of, join_path};
use crate::storage::models::{ContentRef, Indirection, Node, NodeDescriptor, NodeKind, entry_key};
use crate::storage::repository::NodeSource;
use crate::types::{StoreId, VersionRef};

/// One resolved path component.
#[derive(Debug, Clone)]
pub struct LookupComponent {
    pub name: String,
    pub node: Arc<Node>,
    /// Primary flag of the directory entry that led here.
    pub primary: bool,
    /// Found in the parent node's own entries rather than through indirection.
    pub local: bool,
    /// Where this position maps to in the layer below, if anywhere.
    pub context: Option<Indirection>,
    /// Target consulted for names this directory does not hold itself.
    pub fallback: Option<Indirection>,
    /// Store whose tree actually holds the node.
    pub native_store: StoreId,
}

impl LookupComponent {
    pub fn root(node: Arc<Node>, store_id: StoreId) -> Self {
        let fallback = directory_fallback(&node, None);
        Self {
            name: String::new(),
            node,
            primary: true,
            local: true,
            context: None,
            fallback,
            native_store: store_id,
        }
    }

    pub fn child_context(&self, name: &str) -> Option<Indirection> {
        self.fallback.as_ref().or(self.context.as_ref()).map(|i| i.join(name))
    }

    /// The indirection a layered file or directory serves from.
    pub fn indirection(&self) -> Option<Indirection> {
        match &self.node.kind {
            NodeKind::LayeredFile { indirection } => Some(indirection.clone()),
            NodeKind::LayeredDirectory { .. } => self.fallback.clone(),
            _ => None,
        }
    }

    pub fn falls_through(&self) -> bool {
        matches!(self.node.kind, NodeKind::LayeredDirectory { opacity: false, .. })
            && self.fallback.is_some()
    }
}

/// A fully resolved path.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub store_id: StoreId,
    pub version: VersionRef,
    /// Root first. Never empty.
    pub components: Vec<LookupComponent>,
    /// Some step consulted a mutable head.
    pub head_dependent: bool,
}

impl Lookup {
    pub fn last(&self) -> &LookupComponent {
        &self.components[self.components.len() - 1]
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.last().node
    }

    pub fn parent(&self) -> Option<&LookupComponent> {
        let len = self.components.len();
        if len < 2 { None } else { Some(&self.components[len - 2]) }
    }

    pub fn path(&self) -> String {
        self.components.iter().skip(1).fold("/".to_string(), |acc, c| join_path(&acc, &c.name))
    }

    /// Some component on the way was served through indirection.
    pub fn is_background(&self) -> bool {
        self.components.iter().any(|c| !c.local)
    }
}

/// A directory listing entry.
#[derive(Debug, Clone)]
pub struct ListedEntry {
    pub name: String,
    pub node: Arc<Node>,
    pub primary: bool,
    pub local: bool,
}

pub(crate) fn directory_fallback(node: &Node, context: Option<&Indirection>) -> Option<Indirection> {
    match &node.kind {
        NodeKind::LayeredDirectory { indirection: Some(i), .. } => Some(i.clone()),
        NodeKind::LayeredDirectory { indirection: None, .. } => context.cloned(),
        _ => None,
    }
}

pub(crate) fn display_path(src: &dyn NodeSource, store_id: StoreId, path: &str) -> String {
    match src.store(store_id) {
        Ok(handle) => format!("{}:{}", handle.name(), path),
        Err(_) => format!("#{}:{}", store_id, path),
    }
}

pub fn lookup(
    src: &dyn NodeSource,
    store_id: StoreId,
    version: VersionRef,
    path: &str,
    include_deleted: bool,
) -> AvmResult<Lookup> {
    lookup_at(src, store_id, version, path, include_deleted, 0)
}

pub(crate) fn lookup_at(
    src: &dyn NodeSource,
    store_id: StoreId,
    version: VersionRef,
    path: &str,
    include_deleted: bool,
    depth: usize,
) -> AvmResult<Lookup> {
    let repo = src.repo();
    let max = repo.config.max_indirection_depth;
    if depth > max {
        return Err(AvmError::Cycle(format!(
            "more than {} indirection hops resolving {}",
            max,
            display_path(src, store_id, path)
        )));
    }

    if let VersionRef::At(v) = version
        && !src.is_staged(store_id, v)
        && let Some(hit) = repo.cache.get(store_id, v, path, include_deleted)
    {
        return Ok((*hit).clone());
    }

    let root = src.node(src.root(store_id, version)?)?;
    let names = components_of(path);
    let mut lookup = Lookup {
        store_id,
        version,
        components: vec![LookupComponent::root(root, store_id)],
        head_dependent: version.is_head(),
    };

    for (i, name) in names.iter().enumerate() {
        let last = i + 1 == names.len();
        let parent = lookup.last();
        if !parent.node.is_directory() {
            return Err(AvmError::NotFound(display_path(src, store_id, path)));
        }
        let (child, head_dependent) =
            lookup_child_at(src, parent, name, include_deleted && last, depth).map_err(|e| {
                match e {
                    AvmError::NotFound(_) => AvmError::NotFound(display_path(src, store_id, path)),
                    other => other,
                }
            })?;
        lookup.head_dependent |= head_dependent;
        lookup.components.push(child);
    }

    if let VersionRef::At(v) = version
        && !lookup.head_dependent
        && !src.is_staged(store_id, v)
    {
        repo.cache.insert(store_id, v, path, include_deleted, Arc::new(lookup.clone()));
    }
    Ok(lookup)
}

/// The entry stored under `name` in the directory itself, tombstones included.
pub(crate) fn local_child(
    src: &dyn NodeSource,
    parent: &LookupComponent,
    name: &str,
) -> AvmResult<Option<LookupComponent>> {
    let entries = parent
        .node
        .entries()
        .ok_or_else(|| AvmError::NotFound(format!("{} is not a directory", parent.name)))?;
    let Some(entry) = entries.get(&entry_key(name)) else {
        return Ok(None);
    };
    let node = src.node(entry.node_id)?;
    let context = parent.child_context(name);
    let fallback = directory_fallback(&node, context.as_ref());
    Ok(Some(LookupComponent {
        name: entry.name.clone(),
        node,
        primary: entry.primary,
        local: true,
        context,
        fallback,
        native_store: parent.native_store,
    }))
}

/// Resolves `name` under an already resolved directory.
pub fn lookup_child(
    src: &dyn NodeSource,
    parent: &LookupComponent,
    name: &str,
    include_deleted: bool,
) -> AvmResult<LookupComponent> {
    lookup_child_at(src, parent, name, include_deleted, 0).map(|(child, _)| child)
}

fn lookup_child_at(
    src: &dyn NodeSource,
    parent: &LookupComponent,
    name: &str,
    include_deleted: bool,
    depth: usize,
) -> AvmResult<(LookupComponent, bool)> {
    if let Some(child) = local_child(src, parent, name)? {
        if child.node.is_deleted() && !include_deleted {
            return Err(AvmError::NotFound(name.to_string()));
        }
        return Ok((child, false));
    }

    if !parent.falls_through() {
        return Err(AvmError::NotFound(name.to_string()));
    }
    let Some(target) = parent.child_context(name) else {
        return Err(AvmError::NotFound(name.to_string()));
    };

    let inner = match lookup_at(src, target.store_id, target.version, &target.path, false, depth + 1)
    {
        Ok(inner) => inner,
        Err(AvmError::NotFound(_)) => return Err(AvmError::NotFound(name.to_string())),
        Err(e) => return Err(e),
    };
    let head_dependent = inner.head_dependent;
    let last = inner
        .components
        .into_iter()
        .last()
        .ok_or_else(|| AvmError::NotFound(name.to_string()))?;

    let child = LookupComponent {
        name: last.name,
        node: last.node,
        primary: last.primary,
        local: false,
        context: Some(target),
        fallback: last.fallback,
        native_store: last.native_store,
    };
    Ok((child, head_dependent))
}

/// Lists a directory. `direct` restricts the listing to locally stored entries.
pub fn list_directory(
    src: &dyn NodeSource,
    dir: &LookupComponent,
    direct: bool,
    include_deleted: bool,
) -> AvmResult<BTreeMap<String, ListedEntry>> {
    list_at(src, dir, direct, include_deleted, 0)
}

fn list_at(
    src: &dyn NodeSource,
    dir: &LookupComponent,
    direct: bool,
    include_deleted: bool,
    depth: usize,
) -> AvmResult<BTreeMap<String, ListedEntry>> {
    let entries = dir
        .node
        .entries()
        .ok_or_else(|| AvmError::WrongType(format!("{} is not a directory", dir.name)))?;

    let mut listing = BTreeMap::new();
    if !direct
        && dir.falls_through()
        && let Some(fallback) = &dir.fallback
    {
        listing = list_below(src, fallback, depth + 1)?;
    }

    for (key, entry) in entries {
        let node = src.node(entry.node_id)?;
        if node.is_deleted() {
            listing.remove(key);
            if !include_deleted {
                continue;
            }
        }
        listing.insert(
            key.clone(),
            ListedEntry { name: entry.name.clone(), node, primary: entry.primary, local: true },
        );
    }
    Ok(listing)
}

fn list_below(
    src: &dyn NodeSource,
    target: &Indirection,
    depth: usize,
) -> AvmResult<BTreeMap<String, ListedEntry>> {
    let below = match lookup_at(src, target.store_id, target.version, &target.path, false, depth) {
        Ok(below) => below,
        Err(AvmError::NotFound(_)) => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };
    let dir = below.last();
    if !dir.node.is_directory() {
        return Ok(BTreeMap::new());
    }
    let mut listing = list_at(src, dir, false, false, depth)?;
    for entry in listing.values_mut() {
        entry.local = false;
    }
    Ok(listing)
}

/// Names tombstoned directly in a directory.
pub fn deleted_names(src: &dyn NodeSource, dir: &LookupComponent) -> AvmResult<Vec<String>> {
    let entries = dir
        .node
        .entries()
        .ok_or_else(|| AvmError::WrongType(format!("{} is not a directory", dir.name)))?;
    let mut names = Vec::new();
    for entry in entries.values() {
        if src.node(entry.node_id)?.is_deleted() {
            names.push(entry.name.clone());
        }
    }
    Ok(names)
}

/// Content served by a file, following layered files to their target.
pub fn file_content(src: &dyn NodeSource, node: &Node) -> AvmResult<Option<ContentRef>> {
    content_at(src, node, 0)
}

fn content_at(src: &dyn NodeSource, node: &Node, depth: usize) -> AvmResult<Option<ContentRef>> {
    match &node.kind {
        NodeKind::PlainFile { content } => Ok(content.clone()),
        NodeKind::LayeredFile { indirection } => {
            let target = lookup_at(
                src,
                indirection.store_id,
                indirection.version,
                &indirection.path,
                false,
                depth + 1,
            )?;
            content_at(src, target.node(), depth + 1)
        }
        NodeKind::PlainDirectory { .. } | NodeKind::LayeredDirectory { .. } => {
            Err(AvmError::WrongType(format!("node {} is a directory", node.id)))
        }
        NodeKind::DeletedFile | NodeKind::DeletedDirectory => {
            Err(AvmError::NotFound(format!("node {} is deleted", node.id)))
        }
    }
}

pub fn describe(src: &dyn NodeSource, path: String, component: &LookupComponent) -> NodeDescriptor {
    let node = &component.node;
    let indirection = component.indirection();
    let content = node.content();
    NodeDescriptor {
        path,
        name: component.name.clone(),
        id: node.id,
        node_type: node.node_type(),
        creator: node.creator.clone(),
        owner: node.owner.clone(),
        last_modifier: node.last_modifier.clone(),
        guid: node.guid,
        created_at: node.created_at,
        modified_at: node.modified_at,
        ancestor: node.ancestor,
        mod_seq: node.mod_seq,
        indirection: indirection.as_ref().map(|i| display_path(src, i.store_id, &i.path)),
        indirection_version: indirection.as_ref().map(|i| i.version),
        opacity: node.opacity(),
        primary: component.primary,
        size: content.map(|c| c.size),
        content_hash: content.map(|c| c.hash.clone()),
    }
}
