use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::types::NodeId;

use super::models::Node;

/// Append-mostly node table keyed by monotonically increasing id.
///
/// Committed nodes are only ever replaced by the head writer that owns them
/// or removed by the orphan reaper. While a sweep is marking, every committed
/// id is also recorded in a touched set so the reclaim phase can re-mark it.
#[derive(Debug)]
pub struct NodeArena {
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    next_id: AtomicU64,
    mod_seq: AtomicU64,
    touched: Mutex<Option<HashSet<NodeId>>>,
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeArena {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            mod_seq: AtomicU64::new(1),
            touched: Mutex::new(None),
        }
    }

    pub fn allocate_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_mod_seq(&self) -> u64 {
        self.mod_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).contains_key(&id)
    }

    /// Publishes a batch of nodes under a single write lock.
    pub fn insert_all(&self, batch: Vec<Arc<Node>>) {
        if batch.is_empty() {
            return;
        }
        {
            let mut touched = self.touched.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(set) = touched.as_mut() {
                set.extend(batch.iter().map(|n| n.id));
            }
        }
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        for node in batch {
            nodes.insert(node.id, node);
        }
    }

    pub fn remove_all(&self, ids: &[NodeId]) -> usize {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        ids.iter().filter(|id| nodes.remove(id).is_some()).count()
    }

    /// Replaces the ancestor link of surviving nodes after their predecessors were reclaimed.
    pub fn relink_ancestors(&self, relinks: &[(NodeId, Option<NodeId>)]) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        for (id, ancestor) in relinks {
            if let Some(node) = nodes.get_mut(id) {
                Arc::make_mut(node).ancestor = *ancestor;
            }
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn begin_tracking(&self) {
        *self.touched.lock().unwrap_or_else(PoisonError::into_inner) = Some(HashSet::new());
    }

    pub fn take_touched(&self) -> HashSet<NodeId> {
        self.touched.lock().unwrap_or_else(PoisonError::into_inner).take().unwrap_or_default()
    }
}
