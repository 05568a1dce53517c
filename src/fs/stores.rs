use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::fs::error::{AvmError, AvmResult};
use crate::fs::path::validate_store_name;
use crate::layer::union_view::{LookupComponent, describe};
use crate::storage::events::IndexEvent;
use crate::storage::models::{
    Entries, Node, NodeDescriptor, NodeKind, StoreDescriptor, StoreRecord, Version,
};
use crate::storage::repository::NodeSource;
use crate::storage::store::StoreHandle;
use crate::storage::traits::{AccessOperation, PropertyOwner};
use crate::types::{VersionId, VersionRef};

use super::operations::AvmService;

impl AvmService {
    /// Creates a store whose version 0 is an empty root directory.
    pub async fn create_store(&self, name: &str) -> AvmResult<StoreDescriptor> {
        instrumented!(self.repo, "create_store", {
            validate_store_name(name)?;
            self.authorize(&format!("{}:/", name), AccessOperation::Admin).await?;
            if self.repo.stores.contains(name) {
                return Err(AvmError::Exists(format!("Store {}", name)));
            }

            let store_id = self.repo.stores.allocate_id();
            let now = Utc::now();
            let root = Node {
                id: self.repo.arena.allocate_id(),
                kind: NodeKind::PlainDirectory { entries: Entries::new() },
                creator: self.principal.clone(),
                owner: self.principal.clone(),
                last_modifier: self.principal.clone(),
                guid: Uuid::new_v4(),
                created_at: now,
                modified_at: now,
                ancestor: None,
                store_id,
                version_id: 0,
                mod_seq: self.repo.arena.next_mod_seq(),
            };
            let record = StoreRecord {
                id: store_id,
                name: name.to_string(),
                creator: self.principal.clone(),
                created_at: now,
                head_root: root.id,
                versions: vec![Version {
                    id: 0,
                    root: root.id,
                    creator: self.principal.clone(),
                    created_at: now,
                    tag: None,
                    description: None,
                }],
                next_version_id: 1,
                dirty: false,
            };

            let handle = {
                let _gate = self.repo.gate.read().await;
                self.repo.arena.insert_all(vec![Arc::new(root)]);
                self.repo.stores.insert(record)?
            };
            self.repo.index.notify(IndexEvent::StoreCreated { store: name.to_string() });
            tracing::info!(store = name, store_id, "Created store");
            Ok(handle.read(|record| StoreDescriptor::from(record)))
        })
    }

    /// Removes a store. Its nodes become garbage for the orphan reaper.
    pub async fn purge_store(&self, name: &str) -> AvmResult<()> {
        instrumented!(self.repo, "purge_store", {
            self.authorize(&format!("{}:/", name), AccessOperation::Admin).await?;
            let (handle, _locks) = self.lock(name).await?;
            self.repo.stores.remove(&handle.name())?;
            self.repo.properties.delete_all(PropertyOwner::Store(handle.id)).await?;
            self.repo.cache.invalidate_all();
            self.repo.index.notify(IndexEvent::StorePurged { store: handle.name() });
            tracing::info!(store = name, store_id = handle.id, "Purged store");
            Ok(())
        })
    }

    pub async fn rename_store(&self, from: &str, to: &str) -> AvmResult<()> {
        instrumented!(self.repo, "rename_store", {
            validate_store_name(to)?;
            self.authorize(&format!("{}:/", from), AccessOperation::Admin).await?;
            let (_handle, _locks) = self.lock(from).await?;
            self.repo.stores.rename(from, to)?;
            self.repo.cache.invalidate_all();
            self.repo.index.notify(IndexEvent::StoreRenamed {
                from: from.to_string(),
                to: to.to_string(),
            });
            tracing::info!(from, to, "Renamed store");
            Ok(())
        })
    }

    pub async fn get_stores(&self) -> AvmResult<Vec<StoreDescriptor>> {
        let stores = self.repo.stores.all();
        Ok(stores.iter().map(|h| h.read(|record| StoreDescriptor::from(record))).collect())
    }

    pub async fn get_store(&self, name: &str) -> AvmResult<StoreDescriptor> {
        Ok(self.repo.stores.get(name)?.read(|record| StoreDescriptor::from(record)))
    }

    /// Freezes the head of `store` as a new version and returns its id.
    pub async fn create_snapshot(
        &self,
        store: &str,
        tag: Option<&str>,
        description: Option<&str>,
    ) -> AvmResult<VersionId> {
        instrumented!(self.repo, "create_snapshot", {
            self.authorize(&format!("{}:/", store), AccessOperation::Snapshot).await?;
            let (handle, _locks) = self.lock(store).await?;
            Ok(self.snapshot_locked(&handle, tag, description))
        })
    }

    /// Snapshot of a store whose write lock the caller holds.
    pub(crate) fn snapshot_locked(
        &self,
        handle: &StoreHandle,
        tag: Option<&str>,
        description: Option<&str>,
    ) -> VersionId {
        let principal = self.principal.clone();
        let (store, version) = handle.update(|record| {
            let root = record.head_root;
            let id = record.push_version(
                root,
                &principal,
                tag.map(str::to_string),
                description.map(str::to_string),
            );
            (record.name.clone(), id)
        });
        if let Some(metrics) = &self.repo.metrics {
            metrics.snapshots_total.inc();
        }
        tracing::info!(store = %store, version, tag, "Created snapshot");
        self.repo.index.notify(IndexEvent::Snapshotted { store, version });
        version
    }

    pub async fn get_store_versions(&self, store: &str) -> AvmResult<Vec<Version>> {
        Ok(self.repo.stores.get(store)?.read(|record| record.versions.clone()))
    }

    /// Versions created within `from..=to`.
    pub async fn get_store_versions_between(
        &self,
        store: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AvmResult<Vec<Version>> {
        if from > to {
            return Err(AvmError::BadArgument(format!("time range {} to {} is empty", from, to)));
        }
        let handle = self.repo.stores.get(store)?;
        Ok(handle.read(|record| {
            record
                .versions
                .iter()
                .filter(|v| v.created_at >= from && v.created_at <= to)
                .cloned()
                .collect()
        }))
    }

    pub async fn get_latest_snapshot_id(&self, store: &str) -> AvmResult<VersionId> {
        let handle = self.repo.stores.get(store)?;
        handle.read(|record| {
            record
                .latest_version()
                .map(|v| v.id)
                .ok_or_else(|| AvmError::NotFound(format!("Snapshots of {}", record.name)))
        })
    }

    pub async fn get_next_version_id(&self, store: &str) -> AvmResult<VersionId> {
        Ok(self.repo.stores.get(store)?.read(|record| record.next_version_id))
    }

    /// Root directory of a version or of the head.
    pub async fn get_store_root(
        &self,
        version: impl Into<VersionRef>,
        store: &str,
    ) -> AvmResult<NodeDescriptor> {
        let handle = self.repo.stores.get(store)?;
        let root = self.repo.node(self.repo.root(handle.id, version.into())?)?;
        let component = LookupComponent::root(root, handle.id);
        Ok(describe(self.repo.as_ref(), format!("{}:/", handle.name()), &component))
    }
}
