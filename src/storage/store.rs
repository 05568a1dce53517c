use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::fs::error::{AvmError, AvmResult};
use crate::types::StoreId;

use super::models::StoreRecord;

/// One store: its single-writer lock plus the record describing head and versions.
#[derive(Debug)]
pub struct StoreHandle {
    pub id: StoreId,
    write_lock: Arc<Mutex<()>>,
    record: RwLock<StoreRecord>,
}

impl StoreHandle {
    fn new(record: StoreRecord) -> Self {
        Self { id: record.id, write_lock: Arc::new(Mutex::new(())), record: RwLock::new(record) }
    }

    pub fn record(&self) -> StoreRecord {
        self.record.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&StoreRecord) -> R) -> R {
        f(&self.record.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut StoreRecord) -> R) -> R {
        f(&mut self.record.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn name(&self) -> String {
        self.read(|r| r.name.clone())
    }
}

/// Held write locks for a set of stores, released on drop.
#[derive(Debug)]
pub struct StoreLocks {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// Acquires write locks in ascending store-id order, skipping duplicates.
pub async fn lock_stores(handles: &[Arc<StoreHandle>]) -> StoreLocks {
    let mut ordered: Vec<&Arc<StoreHandle>> = handles.iter().collect();
    ordered.sort_by_key(|h| h.id);
    ordered.dedup_by_key(|h| h.id);

    let mut guards = Vec::with_capacity(ordered.len());
    for handle in ordered {
        guards.push(handle.write_lock.clone().lock_owned().await);
    }
    StoreLocks { _guards: guards }
}

#[derive(Debug, Default)]
struct Tables {
    by_name: HashMap<String, Arc<StoreHandle>>,
    by_id: HashMap<StoreId, Arc<StoreHandle>>,
}

/// Case-insensitive name index over all live stores.
#[derive(Debug)]
pub struct StoreRegistry {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self { tables: RwLock::new(Tables::default()), next_id: AtomicU64::new(1) }
    }

    pub fn allocate_id(&self) -> StoreId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, record: StoreRecord) -> AvmResult<Arc<StoreHandle>> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let key = record.name.to_lowercase();
        if tables.by_name.contains_key(&key) {
            return Err(AvmError::Exists(format!("Store {}", record.name)));
        }
        let handle = Arc::new(StoreHandle::new(record));
        tables.by_name.insert(key, handle.clone());
        tables.by_id.insert(handle.id, handle.clone());
        Ok(handle)
    }

    pub fn contains(&self, name: &str) -> bool {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_name.contains_key(&name.to_lowercase())
    }

    pub fn get(&self, name: &str) -> AvmResult<Arc<StoreHandle>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .by_name
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| AvmError::NotFound(format!("Store {}", name)))
    }

    pub fn get_by_id(&self, id: StoreId) -> AvmResult<Arc<StoreHandle>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| AvmError::NotFound(format!("Store id {}", id)))
    }

    pub fn remove(&self, name: &str) -> AvmResult<Arc<StoreHandle>> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let handle = tables
            .by_name
            .remove(&name.to_lowercase())
            .ok_or_else(|| AvmError::NotFound(format!("Store {}", name)))?;
        tables.by_id.remove(&handle.id);
        Ok(handle)
    }

    pub fn rename(&self, from: &str, to: &str) -> AvmResult<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let from_key = from.to_lowercase();
        let to_key = to.to_lowercase();
        if !tables.by_name.contains_key(&from_key) {
            return Err(AvmError::NotFound(format!("Store {}", from)));
        }
        if from_key != to_key && tables.by_name.contains_key(&to_key) {
            return Err(AvmError::Exists(format!("Store {}", to)));
        }
        if let Some(handle) = tables.by_name.remove(&from_key) {
            handle.update(|record| record.name = to.to_string());
            tables.by_name.insert(to_key, handle);
        }
        Ok(())
    }

    /// All live stores, ordered by name.
    pub fn all(&self) -> Vec<Arc<StoreHandle>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut handles: Vec<(String, Arc<StoreHandle>)> =
            tables.by_name.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles.into_iter().map(|(_, h)| h).collect()
    }
}
