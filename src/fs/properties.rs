use serde_json::Value;
use std::collections::BTreeMap;

use crate::fs::error::AvmResult;
use crate::fs::path::AvmPath;
use crate::layer::cow::lookup_for_write;
use crate::storage::events::IndexEvent;
use crate::storage::store::StoreLocks;
use crate::storage::traits::{AccessOperation, PropertyOwner};
use crate::storage::txn::Txn;
use crate::types::{NodeId, VersionRef};

use super::operations::AvmService;

impl AvmService {
    /// Makes the node at a head path writable and returns its id.
    ///
    /// Properties of a frozen node are copied onto the new node as part of the
    /// commit, so writes afterwards never alter a snapshot.
    async fn property_target(&self, path: &str) -> AvmResult<(NodeId, StoreLocks)> {
        let path = AvmPath::parse(path)?;
        self.authorize(&path.to_string(), AccessOperation::Write).await?;
        let (handle, locks) = self.lock(&path.store).await?;
        let mut txn = Txn::begin(&self.repo, &self.principal).await;
        let wp = lookup_for_write(&mut txn, handle.id, &path.path)?;
        let id = wp.target_id();
        let changed = !txn.is_empty();
        if changed {
            txn.emit(IndexEvent::Modified { path: path.to_string(), node_id: id });
        }
        txn.commit().await?;
        Ok((id, locks))
    }

    pub async fn set_node_property(&self, path: &str, name: &str, value: Value) -> AvmResult<()> {
        instrumented!(self.repo, "set_node_property", {
            let (id, _locks) = self.property_target(path).await?;
            self.repo.properties.set(PropertyOwner::Node(id), name, value).await?;
            Ok(())
        })
    }

    pub async fn set_node_properties(
        &self,
        path: &str,
        properties: BTreeMap<String, Value>,
    ) -> AvmResult<()> {
        instrumented!(self.repo, "set_node_properties", {
            let (id, _locks) = self.property_target(path).await?;
            for (name, value) in properties {
                self.repo.properties.set(PropertyOwner::Node(id), &name, value).await?;
            }
            Ok(())
        })
    }

    pub async fn get_node_property(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
        name: &str,
    ) -> AvmResult<Option<Value>> {
        let version = version.into();
        let (_, found) = self.resolve_read(version, path, false)?;
        Ok(self.repo.properties.get(PropertyOwner::Node(found.node().id), name).await?)
    }

    pub async fn get_node_properties(
        &self,
        version: impl Into<VersionRef>,
        path: &str,
    ) -> AvmResult<BTreeMap<String, Value>> {
        let version = version.into();
        let (_, found) = self.resolve_read(version, path, false)?;
        Ok(self.repo.properties.get_all(PropertyOwner::Node(found.node().id)).await?)
    }

    /// Returns whether the property existed.
    pub async fn delete_node_property(&self, path: &str, name: &str) -> AvmResult<bool> {
        instrumented!(self.repo, "delete_node_property", {
            let (id, _locks) = self.property_target(path).await?;
            Ok(self.repo.properties.delete(PropertyOwner::Node(id), name).await?)
        })
    }

    pub async fn delete_node_properties(&self, path: &str) -> AvmResult<()> {
        instrumented!(self.repo, "delete_node_properties", {
            let (id, _locks) = self.property_target(path).await?;
            self.repo.properties.delete_all(PropertyOwner::Node(id)).await?;
            Ok(())
        })
    }

    pub async fn set_store_property(&self, store: &str, name: &str, value: Value) -> AvmResult<()> {
        let handle = self.repo.stores.get(store)?;
        self.authorize(&format!("{}:/", handle.name()), AccessOperation::Admin).await?;
        self.repo.properties.set(PropertyOwner::Store(handle.id), name, value).await?;
        Ok(())
    }

    pub async fn get_store_property(&self, store: &str, name: &str) -> AvmResult<Option<Value>> {
        let handle = self.repo.stores.get(store)?;
        Ok(self.repo.properties.get(PropertyOwner::Store(handle.id), name).await?)
    }

    pub async fn get_store_properties(&self, store: &str) -> AvmResult<BTreeMap<String, Value>> {
        let handle = self.repo.stores.get(store)?;
        Ok(self.repo.properties.get_all(PropertyOwner::Store(handle.id)).await?)
    }

    /// Store properties whose qualified name starts with `prefix`.
    pub async fn query_store_property_key(
        &self,
        store: &str,
        prefix: &str,
    ) -> AvmResult<BTreeMap<String, Value>> {
        let mut all = self.get_store_properties(store).await?;
        all.retain(|name, _| name.starts_with(prefix));
        Ok(all)
    }

    pub async fn delete_store_property(&self, store: &str, name: &str) -> AvmResult<bool> {
        let handle = self.repo.stores.get(store)?;
        self.authorize(&format!("{}:/", handle.name()), AccessOperation::Admin).await?;
        Ok(self.repo.properties.delete(PropertyOwner::Store(handle.id), name).await?)
    }
}
