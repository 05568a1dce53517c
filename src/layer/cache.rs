use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::types::{StoreId, VersionId};

use super::union_view::Lookup;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    store_id: StoreId,
    version: VersionId,
    path: String,
    include_deleted: bool,
}

/// Resolutions against committed versions that never consulted a head.
///
/// Such lookups are immutable for the lifetime of the version, so entries only
/// need invalidating when versions disappear or history links are rewritten.
#[derive(Clone)]
pub struct LookupCache {
    cache: Cache<LookupKey, Arc<Lookup>>,
}

impl LookupCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(Duration::from_secs(config.ttl_seconds))
            .build();
        Self { cache }
    }

    pub fn get(
        &self,
        store_id: StoreId,
        version: VersionId,
        path: &str,
        include_deleted: bool,
    ) -> Option<Arc<Lookup>> {
        let key = LookupKey { store_id, version, path: path.to_lowercase(), include_deleted };
        let hit = self.cache.get(&key);
        tracing::trace!(store_id, version, path, hit = hit.is_some(), "Lookup cache read");
        hit
    }

    pub fn insert(
        &self,
        store_id: StoreId,
        version: VersionId,
        path: &str,
        include_deleted: bool,
        lookup: Arc<Lookup>,
    ) {
        let key = LookupKey { store_id, version, path: path.to_lowercase(), include_deleted };
        self.cache.insert(key, lookup);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
