use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type NodeId = u64;
pub type StoreId = u64;
pub type VersionId = u32;
pub type ContentId = Uuid;

/// A version selector: the mutable head or a committed snapshot.
///
/// Callers coming from the numeric convention can convert with
/// `VersionRef::from(-1)`; any negative number selects the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionRef {
    Head,
    At(VersionId),
}

impl VersionRef {
    pub fn is_head(&self) -> bool {
        matches!(self, VersionRef::Head)
    }

    pub fn id(&self) -> Option<VersionId> {
        match self {
            VersionRef::Head => None,
            VersionRef::At(id) => Some(*id),
        }
    }
}

impl From<i32> for VersionRef {
    fn from(value: i32) -> Self {
        if value < 0 { VersionRef::Head } else { VersionRef::At(value as VersionId) }
    }
}

impl From<VersionId> for VersionRef {
    fn from(value: VersionId) -> Self {
        VersionRef::At(value)
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRef::Head => write!(f, "-1"),
            VersionRef::At(id) => write!(f, "{}", id),
        }
    }
}
