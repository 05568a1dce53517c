use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::fs::path::join_path;
use crate::types::{ContentId, NodeId, StoreId, VersionId, VersionRef};

/// Reference to file content held by the blob repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub content_id: ContentId,
    pub size: u64,
    pub hash: String,
}

impl ContentRef {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self {
            content_id: Uuid::new_v4(),
            size: bytes.len() as u64,
            hash: blake3::hash(bytes).to_hex().to_string(),
        }
    }
}

/// Target of a layered node: a path in some store at a pinned version or head.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Indirection {
    pub store_id: StoreId,
    pub path: String,
    pub version: VersionRef,
}

impl Indirection {
    pub fn join(&self, name: &str) -> Self {
        Self { store_id: self.store_id, path: join_path(&self.path, name), version: self.version }
    }

    /// Same store, version selector and (case-insensitive) path.
    pub fn addresses(&self, store_id: StoreId, path: &str, version: VersionRef) -> bool {
        self.store_id == store_id && self.version == version && self.path.eq_ignore_ascii_case(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: String,
    pub node_id: NodeId,
    /// Canonical-path marker for nodes reachable through several entries.
    pub primary: bool,
}

/// Directory entries keyed by lower-cased name.
pub type Entries = BTreeMap<String, ChildEntry>;

pub fn entry_key(name: &str) -> String {
    name.to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    PlainFile {
        content: Option<ContentRef>,
    },
    PlainDirectory {
        entries: Entries,
    },
    LayeredFile {
        indirection: Indirection,
    },
    /// `indirection == None` marks a non-primary layered directory whose
    /// target is derived from its position under a layered parent.
    LayeredDirectory {
        indirection: Option<Indirection>,
        opacity: bool,
        entries: Entries,
    },
    DeletedFile,
    DeletedDirectory,
}

impl NodeKind {
    pub fn entries(&self) -> Option<&Entries> {
        match self {
            NodeKind::PlainDirectory { entries } | NodeKind::LayeredDirectory { entries, .. } => {
                Some(entries)
            }
            _ => None,
        }
    }

    pub fn entries_mut(&mut self) -> Option<&mut Entries> {
        match self {
            NodeKind::PlainDirectory { entries } | NodeKind::LayeredDirectory { entries, .. } => {
                Some(entries)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    PlainFile,
    PlainDirectory,
    LayeredFile,
    LayeredDirectory,
    DeletedFile,
    DeletedDirectory,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::PlainFile => "PlainFile",
            NodeType::PlainDirectory => "PlainDirectory",
            NodeType::LayeredFile => "LayeredFile",
            NodeType::LayeredDirectory => "LayeredDirectory",
            NodeType::DeletedFile => "DeletedFile",
            NodeType::DeletedDirectory => "DeletedDirectory",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub creator: String,
    pub owner: String,
    pub last_modifier: String,
    pub guid: Uuid,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Immediate predecessor of the same logical entity.
    pub ancestor: Option<NodeId>,
    /// Store whose head owns this node while it is mutable.
    pub store_id: StoreId,
    /// Head version in which the node was created.
    pub version_id: VersionId,
    /// Global modification sequence, strictly increasing across all writes.
    pub mod_seq: u64,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match &self.kind {
            NodeKind::PlainFile { .. } => NodeType::PlainFile,
            NodeKind::PlainDirectory { .. } => NodeType::PlainDirectory,
            NodeKind::LayeredFile { .. } => NodeType::LayeredFile,
            NodeKind::LayeredDirectory { .. } => NodeType::LayeredDirectory,
            NodeKind::DeletedFile => NodeType::DeletedFile,
            NodeKind::DeletedDirectory => NodeType::DeletedDirectory,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::PlainDirectory { .. } | NodeKind::LayeredDirectory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::PlainFile { .. } | NodeKind::LayeredFile { .. })
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.kind, NodeKind::DeletedFile | NodeKind::DeletedDirectory)
    }

    pub fn is_layered(&self) -> bool {
        matches!(self.kind, NodeKind::LayeredFile { .. } | NodeKind::LayeredDirectory { .. })
    }

    pub fn entries(&self) -> Option<&Entries> {
        self.kind.entries()
    }

    pub fn entries_mut(&mut self) -> Option<&mut Entries> {
        self.kind.entries_mut()
    }

    pub fn content(&self) -> Option<&ContentRef> {
        match &self.kind {
            NodeKind::PlainFile { content } => content.as_ref(),
            _ => None,
        }
    }

    pub fn opacity(&self) -> bool {
        matches!(self.kind, NodeKind::LayeredDirectory { opacity: true, .. })
    }

    /// Mutable only in the head of its owning store, before the next snapshot.
    pub fn is_writable_in(&self, store_id: StoreId, next_version_id: VersionId) -> bool {
        self.store_id == store_id && self.version_id == next_version_id
    }

    /// The tombstone kind recorded when this node is removed.
    pub fn tombstone_kind(&self) -> NodeKind {
        if self.is_directory() || matches!(self.kind, NodeKind::DeletedDirectory) {
            NodeKind::DeletedDirectory
        } else {
            NodeKind::DeletedFile
        }
    }
}

/// An immutable snapshot of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub root: NodeId,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub tag: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: StoreId,
    pub name: String,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub head_root: NodeId,
    pub versions: Vec<Version>,
    pub next_version_id: VersionId,
    pub dirty: bool,
}

impl StoreRecord {
    pub fn version(&self, id: VersionId) -> Option<&Version> {
        self.versions.get(id as usize).filter(|v| v.id == id)
    }

    pub fn latest_version(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// Appends `root` as the next version and clears the pending-changes flag.
    pub fn push_version(
        &mut self,
        root: NodeId,
        creator: &str,
        tag: Option<String>,
        description: Option<String>,
    ) -> VersionId {
        let id = self.next_version_id;
        self.versions.push(Version {
            id,
            root,
            creator: creator.to_string(),
            created_at: Utc::now(),
            tag,
            description,
        });
        self.next_version_id += 1;
        self.dirty = false;
        id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub id: StoreId,
    pub name: String,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub next_version_id: VersionId,
    pub has_changes: bool,
}

impl From<&StoreRecord> for StoreDescriptor {
    fn from(record: &StoreRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            creator: record.creator.clone(),
            created_at: record.created_at,
            next_version_id: record.next_version_id,
            has_changes: record.dirty,
        }
    }
}

/// Caller-facing view of a resolved node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub path: String,
    pub name: String,
    pub id: NodeId,
    pub node_type: NodeType,
    pub creator: String,
    pub owner: String,
    pub last_modifier: String,
    pub guid: Uuid,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub ancestor: Option<NodeId>,
    pub mod_seq: u64,
    /// `store:/path` the node delegates to, when it is layered.
    pub indirection: Option<String>,
    pub indirection_version: Option<VersionRef>,
    pub opacity: bool,
    pub primary: bool,
    pub size: Option<u64>,
    pub content_hash: Option<String>,
}

impl NodeDescriptor {
    pub fn is_directory(&self) -> bool {
        matches!(self.node_type, NodeType::PlainDirectory | NodeType::LayeredDirectory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.node_type, NodeType::PlainFile | NodeType::LayeredFile)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.node_type, NodeType::DeletedFile | NodeType::DeletedDirectory)
    }
}

/// Which store actually serves a path versus the store it is addressed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeringInfo {
    pub background: bool,
    pub path_store: String,
    pub native_store: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kind: NodeKind) -> Node {
        let now = Utc::now();
        Node {
            id: 1,
            kind,
            creator: "system".to_string(),
            owner: "system".to_string(),
            last_modifier: "system".to_string(),
            guid: Uuid::new_v4(),
            created_at: now,
            modified_at: now,
            ancestor: None,
            store_id: 1,
            version_id: 1,
            mod_seq: 1,
        }
    }

    #[test]
    fn test_content_ref_hashes_bytes() {
        let a = ContentRef::for_bytes(b"hi");
        let b = ContentRef::for_bytes(b"hi");
        assert_eq!(a.size, 2);
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.content_id, b.content_id);
    }

    #[test]
    fn test_indirection_join_keeps_version() {
        let ind = Indirection { store_id: 3, path: "/".to_string(), version: VersionRef::At(2) };
        let child = ind.join("a").join("b");
        assert_eq!(child.path, "/a/b");
        assert_eq!(child.version, VersionRef::At(2));
        assert!(child.addresses(3, "/A/b", VersionRef::At(2)));
        assert!(!child.addresses(3, "/a/b", VersionRef::Head));
    }

    #[test]
    fn test_node_type_predicates() {
        let dir = node(NodeKind::PlainDirectory { entries: Entries::new() });
        assert!(dir.is_directory());
        assert!(dir.entries().is_some());
        assert_eq!(dir.tombstone_kind(), NodeKind::DeletedDirectory);

        let file = node(NodeKind::PlainFile { content: None });
        assert!(file.is_file());
        assert_eq!(file.tombstone_kind(), NodeKind::DeletedFile);
        assert_eq!(file.node_type().to_string(), "PlainFile");

        let gone = node(NodeKind::DeletedFile);
        assert!(gone.is_deleted());
        assert!(!gone.is_directory());
    }

    #[test]
    fn test_writability_follows_store_and_head_version() {
        let n = node(NodeKind::PlainFile { content: None });
        assert!(n.is_writable_in(1, 1));
        assert!(!n.is_writable_in(1, 2));
        assert!(!n.is_writable_in(2, 1));
    }

    #[test]
    fn test_store_record_version_lookup() {
        let now = Utc::now();
        let record = StoreRecord {
            id: 1,
            name: "main".to_string(),
            creator: "system".to_string(),
            created_at: now,
            head_root: 1,
            versions: vec![Version {
                id: 0,
                root: 1,
                creator: "system".to_string(),
                created_at: now,
                tag: None,
                description: None,
            }],
            next_version_id: 1,
            dirty: false,
        };
        assert!(record.version(0).is_some());
        assert!(record.version(1).is_none());
        assert_eq!(StoreDescriptor::from(&record).next_version_id, 1);
    }
}
