use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::types::ContentId;

use super::traits::{AccessOperation, AccessPolicy, BlobRepository, PropertyOwner, PropertyRepository};

/// In-process property map.
#[derive(Debug, Default)]
pub struct MemoryPropertyRepository {
    properties: RwLock<HashMap<PropertyOwner, BTreeMap<String, Value>>>,
}

impl MemoryPropertyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PropertyRepository for MemoryPropertyRepository {
    async fn get(&self, owner: PropertyOwner, name: &str) -> Result<Option<Value>> {
        let properties = self.properties.read().unwrap_or_else(PoisonError::into_inner);
        Ok(properties.get(&owner).and_then(|props| props.get(name)).cloned())
    }

    async fn get_all(&self, owner: PropertyOwner) -> Result<BTreeMap<String, Value>> {
        let properties = self.properties.read().unwrap_or_else(PoisonError::into_inner);
        Ok(properties.get(&owner).cloned().unwrap_or_default())
    }

    async fn set(&self, owner: PropertyOwner, name: &str, value: Value) -> Result<()> {
        let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
        properties.entry(owner).or_default().insert(name.to_string(), value);
        Ok(())
    }

    async fn delete(&self, owner: PropertyOwner, name: &str) -> Result<bool> {
        let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
        let Some(props) = properties.get_mut(&owner) else {
            return Ok(false);
        };
        let removed = props.remove(name).is_some();
        if props.is_empty() {
            properties.remove(&owner);
        }
        Ok(removed)
    }

    async fn delete_all(&self, owner: PropertyOwner) -> Result<()> {
        let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
        properties.remove(&owner);
        Ok(())
    }

    async fn copy_all(&self, from: PropertyOwner, to: PropertyOwner) -> Result<()> {
        let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(props) = properties.get(&from).cloned() {
            properties.insert(to, props);
        }
        Ok(())
    }

    async fn owners(&self) -> Result<Vec<PropertyOwner>> {
        let properties = self.properties.read().unwrap_or_else(PoisonError::into_inner);
        Ok(properties.keys().copied().collect())
    }
}

/// In-process blob storage.
#[derive(Debug, Default)]
pub struct MemoryBlobRepository {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryBlobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobRepository for MemoryBlobRepository {
    async fn put(&self, content_id: ContentId, bytes: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(content_id, bytes);
        Ok(())
    }

    async fn get(&self, content_id: ContentId) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(&content_id).cloned())
    }

    async fn delete(&self, content_id: ContentId) -> Result<bool> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.remove(&content_id).is_some())
    }

    async fn list(&self) -> Result<Vec<ContentId>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.keys().copied().collect())
    }
}

/// Grants every request.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

#[async_trait]
impl AccessPolicy for AllowAll {
    async fn allow(
        &self,
        _principal: &str,
        _path: &str,
        _operation: AccessOperation,
    ) -> Result<bool> {
        Ok(true)
    }
}
