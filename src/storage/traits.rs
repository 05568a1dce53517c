use anyhow::Result;
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{ContentId, NodeId, StoreId};

use super::events::IndexEvent;

/// Who a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyOwner {
    Node(NodeId),
    Store(StoreId),
}

/// Structural operations checked against the access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessOperation {
    Create,
    Write,
    Delete,
    Snapshot,
    Admin,
}

impl fmt::Display for AccessOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessOperation::Create => "create",
            AccessOperation::Write => "write",
            AccessOperation::Delete => "delete",
            AccessOperation::Snapshot => "snapshot",
            AccessOperation::Admin => "admin",
        };
        write!(f, "{}", name)
    }
}

/// Opaque qualified-name to value map per node and per store.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait PropertyRepository: Send + Sync {
    async fn get(&self, owner: PropertyOwner, name: &str) -> Result<Option<Value>>;
    async fn get_all(&self, owner: PropertyOwner) -> Result<BTreeMap<String, Value>>;
    async fn set(&self, owner: PropertyOwner, name: &str, value: Value) -> Result<()>;
    async fn delete(&self, owner: PropertyOwner, name: &str) -> Result<bool>;
    async fn delete_all(&self, owner: PropertyOwner) -> Result<()>;
    async fn copy_all(&self, from: PropertyOwner, to: PropertyOwner) -> Result<()>;
    async fn owners(&self) -> Result<Vec<PropertyOwner>>;
}

/// File content storage keyed by content id.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait BlobRepository: Send + Sync {
    async fn put(&self, content_id: ContentId, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, content_id: ContentId) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, content_id: ContentId) -> Result<bool>;
    async fn list(&self) -> Result<Vec<ContentId>>;
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn allow(&self, principal: &str, path: &str, operation: AccessOperation)
    -> Result<bool>;
}

/// Receiver of committed-change notifications. Must not block.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait IndexSink: Send + Sync {
    fn notify(&self, event: IndexEvent);
}
