pub mod arena;
pub mod events;
pub mod memory;
pub mod models;
pub mod repository;
pub mod store;
pub mod traits;
pub mod txn;

pub use events::{ChannelIndexSink, IndexEvent, NullIndexSink};
pub use memory::{AllowAll, MemoryBlobRepository, MemoryPropertyRepository};
pub use models::*;
pub use repository::{AvmRepository, NodeSource, RepositoryBuilder};
pub use store::{StoreHandle, StoreRegistry};
pub use traits::{AccessOperation, AccessPolicy, BlobRepository, IndexSink, PropertyOwner, PropertyRepository};
