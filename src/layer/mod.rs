//! Path resolution through layered nodes and per-level copy-on-write.
//!
//! - `union_view`: resolving paths and listings across indirection
//! - `cow`: making a head path writable and editing directory entries
//! - `cache`: memoised resolutions against committed versions

pub mod cache;
pub mod cow;
pub mod union_view;

pub use cache::LookupCache;
pub use union_view::{Lookup, LookupComponent};
